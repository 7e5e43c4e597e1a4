//! OAuth 2.0 core types and data structures.
//!
//! Defines enums and structs for grants, clients, codes, refresh-token records,
//! token requests and responses, plus scope helpers.

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::errors::OAuthError;
use crate::oauth::pkce::CodeChallengeMethod;

/// OAuth 2.0 Grant Types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    ClientCredentials,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::ClientCredentials => "client_credentials",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

/// OAuth 2.0 Response Types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Code,
}

/// Client Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Public,
    Confidential,
}

/// Token endpoint authentication method advertised for a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    None,
}

/// Registered OAuth client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Unique client identifier
    pub client_id: String,
    /// Argon2id hash of the client secret, absent for public clients
    pub client_secret_hash: Option<String>,
    pub client_type: ClientType,
    /// Exact-match redirect URIs
    pub redirect_uris: Vec<String>,
    /// Scopes the client may be granted
    pub scopes: Vec<String>,
    pub grant_types: Vec<GrantType>,
    pub name: Option<String>,
    pub logo_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn is_public(&self) -> bool {
        self.client_type == ClientType::Public
    }

    pub fn allows_grant(&self, grant_type: GrantType) -> bool {
        self.grant_types.contains(&grant_type)
    }

    pub fn token_endpoint_auth_method(&self) -> ClientAuthMethod {
        match self.client_type {
            ClientType::Public => ClientAuthMethod::None,
            ClientType::Confidential => ClientAuthMethod::ClientSecretBasic,
        }
    }

    /// Display name for consent screens
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.client_id)
    }
}

/// Client registration metadata (RFC 7591 request body and bootstrap file entries)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Requested identifier; generated when absent
    #[serde(default)]
    pub client_id: Option<String>,
    /// Pre-shared secret for bootstrap seeding; generated for confidential clients when absent
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_type: Option<ClientType>,
    #[serde(default)]
    pub token_endpoint_auth_method: Option<ClientAuthMethod>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Space-delimited scope list
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub grant_types: Option<Vec<GrantType>>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub logo_uri: Option<String>,
}

/// Client registration response (RFC 7591)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub client_id_issued_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<GrantType>,
    pub response_types: Vec<ResponseType>,
    pub scope: String,
    pub token_endpoint_auth_method: ClientAuthMethod,
}

/// Single-use authorization code record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub user_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Refresh-token metadata; the bearer string is a JWT whose `jti` is `token_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_id: String,
    pub user_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
}

/// Raw authorization request parameters.
///
/// Kept as received so they can be stashed across the login redirect and replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    #[serde(default)]
    pub response_type: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

impl AuthorizeRequest {
    /// Encode the parameters as a query string, omitting absent ones.
    pub fn to_query(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        let params = [
            ("response_type", &self.response_type),
            ("client_id", &self.client_id),
            ("redirect_uri", &self.redirect_uri),
            ("scope", &self.scope),
            ("state", &self.state),
            ("code_challenge", &self.code_challenge),
            ("code_challenge_method", &self.code_challenge_method),
            ("resource", &self.resource),
        ];
        for (name, value) in params {
            if let Some(value) = value {
                query.append_pair(name, value);
            }
        }
        query.finish()
    }
}

/// Validated token request, one variant per grant type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRequest {
    AuthorizationCode {
        code: String,
        redirect_uri: String,
        code_verifier: Option<String>,
        resource: Option<String>,
    },
    RefreshToken {
        refresh_token: String,
        scope: Option<String>,
    },
    ClientCredentials {
        scope: Option<String>,
        resource: Option<String>,
    },
}

impl TokenRequest {
    pub fn grant_type(&self) -> GrantType {
        match self {
            TokenRequest::AuthorizationCode { .. } => GrantType::AuthorizationCode,
            TokenRequest::RefreshToken { .. } => GrantType::RefreshToken,
            TokenRequest::ClientCredentials { .. } => GrantType::ClientCredentials,
        }
    }
}

/// Raw form body of the token endpoint
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TokenForm {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub resource: Option<String>,
}

fn required(value: Option<String>, name: &str) -> Result<String, OAuthError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::InvalidRequest(format!("Missing {}", name)))
}

impl TryFrom<TokenForm> for TokenRequest {
    type Error = OAuthError;

    fn try_from(form: TokenForm) -> Result<Self, Self::Error> {
        let grant_type = required(form.grant_type, "grant_type")?;
        match grant_type.as_str() {
            "authorization_code" => Ok(TokenRequest::AuthorizationCode {
                code: required(form.code, "code")?,
                redirect_uri: required(form.redirect_uri, "redirect_uri")?,
                code_verifier: form.code_verifier.filter(|v| !v.is_empty()),
                resource: form.resource.filter(|v| !v.is_empty()),
            }),
            "refresh_token" => Ok(TokenRequest::RefreshToken {
                refresh_token: required(form.refresh_token, "refresh_token")?,
                scope: form.scope.filter(|v| !v.is_empty()),
            }),
            "client_credentials" => Ok(TokenRequest::ClientCredentials {
                scope: form.scope.filter(|v| !v.is_empty()),
                resource: form.resource.filter(|v| !v.is_empty()),
            }),
            _ => Err(OAuthError::UnsupportedGrantType(grant_type)),
        }
    }
}

/// Token endpoint success body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

/// RFC 7662 introspection response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// Generate a secure random token
pub fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.r#gen();
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a client ID
pub fn generate_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Validate scope string
pub fn validate_scope(scope: &str) -> bool {
    // RFC 6749 section 3.3 scope-token characters
    scope.split_whitespace().all(|s| {
        s.chars()
            .all(|c| c == '!' || ('#'..='[').contains(&c) || (']'..='~').contains(&c))
    })
}

/// Parse a space-delimited scope string into an ordered, de-duplicated set
pub fn parse_scope(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(|s| s.to_string()).collect()
}

/// Join scopes into a space-separated string
pub fn join_scopes<I, S>(scopes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = scopes
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect();
    set.into_iter().collect::<Vec<_>>().join(" ")
}

/// Intersection of requested scopes with the client's allow-list, in sorted order
pub fn clamp_scopes(requested: &BTreeSet<String>, allowed: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|scope| allowed.contains(scope))
        .cloned()
        .collect()
}
