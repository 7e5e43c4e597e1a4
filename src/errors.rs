//! Standardized error types following the `error-authgate-<domain>-<number>` format.

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::{HeaderValue, StatusCode, header};
use serde_json::json;
use thiserror::Error;

/// Configuration errors that occur during application startup
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when a required environment variable is not set
    #[error("error-authgate-config-1 {0} must be set")]
    EnvVarRequired(String),

    /// Error when PORT cannot be parsed
    #[error("error-authgate-config-2 Parsing PORT into u16 failed: {0:?}")]
    PortParsingFailed(std::num::ParseIntError),

    /// Error when version information is not available
    #[error("error-authgate-config-3 One of GIT_HASH or CARGO_PKG_VERSION must be set")]
    VersionNotSet,

    /// Error when a number cannot be parsed
    #[error("error-authgate-config-4 Failed to parse number '{0}': {1}")]
    NumberParsingFailed(String, std::num::ParseIntError),

    /// Error when an enumerated setting has an unknown value
    #[error("error-authgate-config-5 Unsupported value '{1}' for {0}")]
    UnsupportedValue(String, String),

    /// Error when duration string cannot be parsed
    #[error("error-authgate-config-6 Failed to parse duration '{0}': {1}")]
    DurationParsingFailed(String, String),

    /// Error when boolean string cannot be parsed
    #[error(
        "error-authgate-config-7 Failed to parse boolean '{0}': expected true/false/1/0/yes/no/on/off"
    )]
    BoolParsingFailed(String),

    /// Error when a scope list is invalid
    #[error("error-authgate-config-8 Invalid scope configuration: {0}")]
    InvalidScope(String),

    /// Error when a URL setting cannot be parsed
    #[error("error-authgate-config-9 Invalid URL for {0}: {1}")]
    InvalidUrl(String, String),
}

/// OAuth protocol errors, one variant per wire error code
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Malformed or missing request parameters
    #[error("error-authgate-oauth-1 Invalid request: {0}")]
    InvalidRequest(String),

    /// Client authentication failed
    #[error("error-authgate-oauth-2 Invalid client credentials: {0}")]
    InvalidClient(String),

    /// Authorization code or refresh token rejected
    #[error("error-authgate-oauth-3 Invalid grant: {0}")]
    InvalidGrant(String),

    /// Client may not use the requested grant or flow
    #[error("error-authgate-oauth-4 Unauthorized client: {0}")]
    UnauthorizedClient(String),

    /// Unsupported grant type
    #[error("error-authgate-oauth-5 Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// Unsupported response type
    #[error("error-authgate-oauth-6 Unsupported response type: {0}")]
    UnsupportedResponseType(String),

    /// Invalid scope
    #[error("error-authgate-oauth-7 Invalid scope: {0}")]
    InvalidScope(String),

    /// Resource owner or server denied the request
    #[error("error-authgate-oauth-8 Access denied: {0}")]
    AccessDenied(String),

    /// Token is valid but lacks a required scope
    #[error("error-authgate-oauth-9 Insufficient scope: {0}")]
    InsufficientScope(String),

    /// Bearer token missing, malformed, expired, or unverifiable
    #[error("error-authgate-oauth-10 Invalid token: {0}")]
    InvalidToken(String),

    /// Requested resource indicator is not served here
    #[error("error-authgate-oauth-11 Invalid target: {0}")]
    InvalidTarget(String),

    /// Caller exceeded its attempt budget
    #[error("error-authgate-oauth-12 Temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// Internal failure
    #[error("error-authgate-oauth-13 Server error: {0}")]
    ServerError(String),
}

impl OAuthError {
    /// RFC 6749 / RFC 6750 error code for the wire
    pub fn error_code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient(_) => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::UnauthorizedClient(_) => "unauthorized_client",
            OAuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthError::UnsupportedResponseType(_) => "unsupported_response_type",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::AccessDenied(_) => "access_denied",
            OAuthError::InsufficientScope(_) => "insufficient_scope",
            OAuthError::InvalidToken(_) => "invalid_token",
            OAuthError::InvalidTarget(_) => "invalid_target",
            OAuthError::TemporarilyUnavailable(_) => "temporarily_unavailable",
            OAuthError::ServerError(_) => "server_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            OAuthError::InvalidClient(_) | OAuthError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            OAuthError::InsufficientScope(_) | OAuthError::AccessDenied(_) => {
                StatusCode::FORBIDDEN
            }
            OAuthError::TemporarilyUnavailable(_) => StatusCode::TOO_MANY_REQUESTS,
            OAuthError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Human readable description safe to return to the caller.
    ///
    /// Server errors collapse to a fixed string so internals never reach the wire.
    pub fn description(&self) -> String {
        match self {
            OAuthError::ServerError(_) => "The server encountered an unexpected error".to_string(),
            OAuthError::InvalidRequest(d)
            | OAuthError::InvalidClient(d)
            | OAuthError::InvalidGrant(d)
            | OAuthError::UnauthorizedClient(d)
            | OAuthError::UnsupportedGrantType(d)
            | OAuthError::UnsupportedResponseType(d)
            | OAuthError::InvalidScope(d)
            | OAuthError::AccessDenied(d)
            | OAuthError::InsufficientScope(d)
            | OAuthError::InvalidToken(d)
            | OAuthError::InvalidTarget(d)
            | OAuthError::TemporarilyUnavailable(d) => d.clone(),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        if let OAuthError::ServerError(ref cause) = self {
            tracing::error!(error = %cause, "oauth server error");
        }

        let status = self.status_code();
        let body = json!({
            "error": self.error_code(),
            "error_description": self.description(),
        });

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(header::VARY, HeaderValue::from_static("Authorization"));
        }
        if let OAuthError::InvalidClient(_) = self {
            // RFC 6749 section 5.2
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"authgate\""),
            );
        }
        response
    }
}

impl From<StorageError> for OAuthError {
    fn from(err: StorageError) -> Self {
        OAuthError::ServerError(err.to_string())
    }
}

impl From<TokenError> for OAuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Signing(_) | TokenError::Key(_) => OAuthError::ServerError(err.to_string()),
            _ => OAuthError::InvalidToken(err.to_string()),
        }
    }
}

/// Client registration errors
#[derive(Debug, Error)]
pub enum ClientRegistrationError {
    /// Invalid client metadata
    #[error("error-authgate-client-1 Invalid client metadata: {0}")]
    InvalidClientMetadata(String),

    /// Invalid redirect URI
    #[error("error-authgate-client-2 Invalid redirect URI: {0}")]
    InvalidRedirectUri(String),

    /// Client not found
    #[error("error-authgate-client-3 Client not found: {0}")]
    ClientNotFound(String),

    /// Client identifier already registered
    #[error("error-authgate-client-4 Client already exists: {0}")]
    ClientExists(String),

    /// Client registration disabled
    #[error("error-authgate-client-5 Client registration disabled")]
    RegistrationDisabled,

    /// Secret hashing failed
    #[error("error-authgate-client-6 Client secret hashing failed: {0}")]
    SecretHashingFailed(String),

    /// Storage failure while registering
    #[error("error-authgate-client-7 Client storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl ClientRegistrationError {
    /// RFC 7591 section 3.2.2 error code
    pub fn error_code(&self) -> &'static str {
        match self {
            ClientRegistrationError::InvalidRedirectUri(_) => "invalid_redirect_uri",
            ClientRegistrationError::InvalidClientMetadata(_)
            | ClientRegistrationError::ClientExists(_) => "invalid_client_metadata",
            ClientRegistrationError::ClientNotFound(_) => "invalid_client_id",
            ClientRegistrationError::RegistrationDisabled => "access_denied",
            ClientRegistrationError::SecretHashingFailed(_)
            | ClientRegistrationError::Storage(_) => "server_error",
        }
    }
}

impl IntoResponse for ClientRegistrationError {
    fn into_response(self) -> Response {
        let status = match self {
            ClientRegistrationError::RegistrationDisabled => StatusCode::NOT_FOUND,
            ClientRegistrationError::ClientNotFound(_) => StatusCode::UNAUTHORIZED,
            ClientRegistrationError::SecretHashingFailed(_)
            | ClientRegistrationError::Storage(_) => {
                tracing::error!(error = ?self, "client registration failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };

        let description = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "Client registration failed".to_string(),
            _ => self.to_string(),
        };

        (
            status,
            Json(json!({
                "error": self.error_code(),
                "error_description": description,
            })),
        )
            .into_response()
    }
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Error when the backend connection fails
    #[error("error-authgate-storage-1 Connection failed: {0}")]
    ConnectionFailed(String),

    /// Error when a backend command fails
    #[error("error-authgate-storage-2 Query execution failed: {0}")]
    QueryFailed(String),

    /// Error when data serialization fails
    #[error("error-authgate-storage-3 Data serialization failed: {0}")]
    SerializationFailed(String),

    /// Error when stored data cannot be interpreted
    #[error("error-authgate-storage-4 Invalid data: {0}")]
    InvalidData(String),

    /// Error when the configured backend is not available in this build
    #[error("error-authgate-storage-5 Unsupported storage backend: {0}")]
    UnsupportedBackend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationFailed(err.to_string())
    }
}

/// Signing key errors
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key generation failed
    #[error("error-authgate-key-1 Key generation failed: {0}")]
    GenerationFailed(String),

    /// Key material could not be read or parsed
    #[error("error-authgate-key-2 Invalid key material: {0}")]
    InvalidKey(String),
}

/// JWT encoding and verification errors
#[derive(Debug, Error)]
pub enum TokenError {
    /// Signing failed
    #[error("error-authgate-token-1 Token signing failed: {0}")]
    Signing(String),

    /// Token could not be decoded or its signature is invalid
    #[error("error-authgate-token-2 Token verification failed: {0}")]
    Verification(String),

    /// Token is past its expiry
    #[error("error-authgate-token-3 Token expired")]
    Expired,

    /// Token is not yet valid
    #[error("error-authgate-token-4 Token not yet valid")]
    NotYetValid,

    /// Audience, issuer, or token type mismatch
    #[error("error-authgate-token-5 Invalid claims: {0}")]
    InvalidClaims(String),

    /// Verification key unavailable
    #[error("error-authgate-token-6 Key error: {0}")]
    Key(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::ImmatureSignature => TokenError::NotYetValid,
            ErrorKind::InvalidAudience
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidSubject
            | ErrorKind::MissingRequiredClaim(_) => TokenError::InvalidClaims(err.to_string()),
            ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => {
                TokenError::Key(err.to_string())
            }
            _ => TokenError::Verification(err.to_string()),
        }
    }
}

