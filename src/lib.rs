//! authgate: an OAuth 2.0 authorization server and bearer-token validation library.
//!
//! Issues RS256 access tokens through the authorization code (with PKCE), refresh token, and
//! client credentials grants, and protects resource routes with an axum middleware that
//! validates tokens locally, against a remote JWKS, or via introspection.

pub mod clock;
pub mod config;
pub mod errors;
pub mod http;
pub mod oauth;
pub mod storage;
pub mod templates;
