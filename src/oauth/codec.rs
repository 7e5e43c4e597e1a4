//! JWT payload types and RS256 signing/verification.
//!
//! Time claims are checked against the injected [`Clock`](crate::clock::Clock) rather than
//! the system time used inside `jsonwebtoken`, so expiry is deterministic under test.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::errors::TokenError;
use crate::oauth::keys::KeyManager;
use crate::oauth::types::parse_scope;

/// Permitted clock skew when checking `exp`, `nbf` and `iat`.
pub const CLOCK_SKEW_SECONDS: i64 = 30;

/// Registered claim names that custom claims may never override.
const RESERVED_CLAIMS: &[&str] = &[
    "sub",
    "aud",
    "iss",
    "iat",
    "exp",
    "nbf",
    "jti",
    "client_id",
    "scope",
    "token_type",
];

/// The `aud` claim, either a single string or an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(value) => value == audience,
            Audience::Multiple(values) => values.iter().any(|value| value == audience),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Audience::Single(value) => vec![value.clone()],
            Audience::Multiple(values) => values.clone(),
        }
    }
}

impl From<&str> for Audience {
    fn from(value: &str) -> Self {
        Audience::Single(value.to_string())
    }
}

/// Distinguishes access tokens from refresh tokens sharing the same signing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    #[default]
    AccessToken,
    RefreshToken,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::AccessToken => "access_token",
            TokenKind::RefreshToken => "refresh_token",
        }
    }
}

/// JWT payload for both access and refresh tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub aud: Audience,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    pub jti: String,
    #[serde(default)]
    pub client_id: String,
    /// Space-delimited granted scopes
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token_type: TokenKind,
    /// Custom claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    pub fn scopes(&self) -> BTreeSet<String> {
        parse_scope(&self.scope)
    }

    /// Attach custom claims, skipping any that collide with registered names.
    pub fn with_custom_claims(mut self, custom: Map<String, Value>) -> Self {
        for (name, value) in custom {
            if RESERVED_CLAIMS.contains(&name.as_str()) {
                tracing::debug!(claim = %name, "ignoring reserved custom claim");
                continue;
            }
            self.extra.insert(name, value);
        }
        self
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// Check `exp`, `nbf` and `iat` against `now` with the allowed skew.
    pub fn check_time(&self, now: DateTime<Utc>) -> Result<(), TokenError> {
        let now = now.timestamp();
        if self.exp + CLOCK_SKEW_SECONDS <= now {
            return Err(TokenError::Expired);
        }
        if self.nbf - CLOCK_SKEW_SECONDS > now || self.iat - CLOCK_SKEW_SECONDS > now {
            return Err(TokenError::NotYetValid);
        }
        Ok(())
    }
}

/// Decode a JWT with `key`, checking signature, issuer, audience and time claims.
///
/// Shared by the local codec and the remote JWKS verifier.
pub fn decode_claims(
    token: &str,
    key: &DecodingKey,
    issuer: Option<&str>,
    audience: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TokenClaims, TokenError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp", "sub", "iss"]);
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }

    let claims = decode::<TokenClaims>(token, key, &validation)?.claims;
    claims.check_time(now)?;

    if let Some(audience) = audience {
        if !claims.aud.contains(audience) {
            return Err(TokenError::InvalidClaims(format!(
                "audience does not include {}",
                audience
            )));
        }
    }

    Ok(claims)
}

/// Signs and verifies tokens with the server's key pair.
#[derive(Clone)]
pub struct TokenCodec {
    keys: Arc<KeyManager>,
    issuer: String,
    clock: SharedClock,
}

impl TokenCodec {
    pub fn new(keys: Arc<KeyManager>, issuer: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            clock,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// RS256-sign claims with header `{typ: JWT, alg: RS256, kid}`.
    pub fn sign(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some("JWT".to_string());
        header.kid = Some(self.keys.kid().to_string());

        encode(&header, claims, self.keys.encoding_key())
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verify a token issued by this server, optionally requiring an audience.
    pub fn verify(&self, token: &str, audience: Option<&str>) -> Result<TokenClaims, TokenError> {
        decode_claims(
            token,
            self.keys.decoding_key(),
            Some(&self.issuer),
            audience,
            self.clock.now(),
        )
    }
}
