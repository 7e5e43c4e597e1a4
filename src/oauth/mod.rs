//! OAuth 2.0 authorization server and bearer token validation.

pub mod auth_server;
pub mod client_registry;
pub mod code_store;
pub mod codec;
pub mod keys;
pub mod pkce;
pub mod rate_limit;
pub mod refresh_store;
pub mod session;
pub mod token_service;
pub mod types;
pub mod users;
pub mod validator;

pub use auth_server::{
    AuthorizationServer, AuthorizationServerMetadata, AuthorizeError, ServerSettings,
    TokenActionForm, ValidatedAuthorization,
};
pub use client_registry::ClientRegistry;
pub use code_store::AuthorizationCodeStore;
pub use codec::{TokenClaims, TokenCodec};
pub use keys::{Jwks, KeyManager};
pub use rate_limit::RateLimiter;
pub use refresh_store::RefreshTokenStore;
pub use session::{Session, SessionManager};
pub use token_service::{IssueOptions, TokenPair, TokenService, TokenSettings};
pub use types::{
    AuthorizeRequest, Client, ClientMetadata, ClientType, GrantType, TokenForm, TokenResponse,
    parse_scope,
};
pub use users::{MemoryUserDirectory, User, UserDirectory};
pub use validator::{
    AuthenticatedToken, IntrospectionVerifier, JwksVerifier, LocalVerifier, TokenValidator,
    TokenVerifier,
};
