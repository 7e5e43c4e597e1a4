//! Authorization server protocol logic: authorize validation, consent, token dispatch,
//! introspection, revocation, registration and discovery metadata.
//!
//! Nothing here renders HTTP. Handlers in `crate::http` translate the results into
//! redirects, JSON bodies and templates.

use base64::prelude::*;
use http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use url::Url;

use crate::errors::{ClientRegistrationError, OAuthError};
use crate::oauth::client_registry::{ClientRegistry, redirect_uri_matches, registration_response};
use crate::oauth::code_store::{AuthorizationCodeStore, CodeBinding};
use crate::oauth::pkce::{self, CodeChallengeMethod};
use crate::oauth::rate_limit::RateLimiter;
use crate::oauth::token_service::{IssueOptions, TokenService};
use crate::oauth::types::*;
use crate::oauth::users::{User, UserDirectory};
use crate::oauth::validator::AuthenticatedToken;

/// Deployment settings for the authorization server
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Issuer identifier and base URL of every endpoint
    pub issuer: String,
    /// Resource indicator accepted in `resource` parameters
    pub resource_uri: String,
    pub supported_scopes: BTreeSet<String>,
    /// Path prefix of the OAuth endpoints, such as `/oauth`
    pub path_prefix: String,
    pub registration_enabled: bool,
}

impl ServerSettings {
    pub fn endpoint(&self, name: &str) -> String {
        format!(
            "{}{}/{}",
            self.issuer.trim_end_matches('/'),
            self.path_prefix,
            name
        )
    }

    pub fn well_known(&self, name: &str) -> String {
        format!("{}/.well-known/{}", self.issuer.trim_end_matches('/'), name)
    }
}

/// Client credentials extracted from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAuthentication {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Undo the `application/x-www-form-urlencoded` encoding of a Basic credential
/// (RFC 6749 section 2.3.1).
fn form_decode(value: &str) -> Option<String> {
    urlencoding::decode(&value.replace('+', " "))
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Read client credentials from HTTP Basic first, then from the form body.
pub fn extract_client_auth(
    headers: &HeaderMap,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> Option<ClientAuthentication> {
    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64_STANDARD.decode(encoded.trim()).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok());

    if let Some(credentials) = basic {
        let (client_id, client_secret) = credentials.split_once(':')?;
        return Some(ClientAuthentication {
            client_id: form_decode(client_id)?,
            client_secret: Some(form_decode(client_secret)?),
        });
    }

    form_client_id
        .filter(|client_id| !client_id.is_empty())
        .map(|client_id| ClientAuthentication {
            client_id: client_id.to_string(),
            client_secret: form_client_secret
                .filter(|secret| !secret.is_empty())
                .map(str::to_string),
        })
}

/// Address a token request came from: the first `X-Forwarded-For` hop, else the peer.
fn request_source(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .and_then(|value| value.parse::<IpAddr>().ok())
        .or(peer)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Authorization request that passed every check against the registry
#[derive(Debug, Clone)]
pub struct ValidatedAuthorization {
    pub client: Client,
    pub redirect_uri: String,
    /// Scopes requested, before clamping to the client's allow-list
    pub requested_scopes: BTreeSet<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub request: AuthorizeRequest,
}

impl ValidatedAuthorization {
    /// Requested scopes the client is registered for.
    pub fn granted_scopes(&self) -> Vec<String> {
        clamp_scopes(&self.requested_scopes, &self.client.scopes)
    }
}

/// Failure of an authorization request.
///
/// Errors are only sent back to the client once its redirect URI has been validated;
/// until then they are shown to the user directly.
#[derive(Debug)]
pub enum AuthorizeError {
    Direct(OAuthError),
    Redirect {
        redirect_uri: String,
        error: OAuthError,
        state: Option<String>,
    },
}

impl AuthorizeError {
    pub fn error(&self) -> &OAuthError {
        match self {
            AuthorizeError::Direct(error) => error,
            AuthorizeError::Redirect { error, .. } => error,
        }
    }

    /// Redirect target carrying `error`, `error_description` and `state`, if redirectable.
    pub fn redirect_url(&self) -> Option<String> {
        let AuthorizeError::Redirect {
            redirect_uri,
            error,
            state,
        } = self
        else {
            return None;
        };
        let mut url = Url::parse(redirect_uri).ok()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("error", error.error_code());
            query.append_pair("error_description", &error.description());
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        Some(url.to_string())
    }
}

impl From<OAuthError> for AuthorizeError {
    fn from(error: OAuthError) -> Self {
        AuthorizeError::Direct(error)
    }
}

/// Body of the introspection and revocation endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenActionForm {
    pub token: Option<String>,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// RFC 8414 authorization server metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
    pub userinfo_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub introspection_endpoint_auth_methods_supported: Vec<String>,
    pub revocation_endpoint_auth_methods_supported: Vec<String>,
}

/// OAuth 2.0 authorization server
pub struct AuthorizationServer {
    pub clients: ClientRegistry,
    pub codes: AuthorizationCodeStore,
    pub tokens: TokenService,
    pub users: Arc<dyn UserDirectory>,
    pub rate_limiter: RateLimiter,
    settings: ServerSettings,
}

impl AuthorizationServer {
    pub fn new(
        clients: ClientRegistry,
        codes: AuthorizationCodeStore,
        tokens: TokenService,
        users: Arc<dyn UserDirectory>,
        rate_limiter: RateLimiter,
        settings: ServerSettings,
    ) -> Self {
        Self {
            clients,
            codes,
            tokens,
            users,
            rate_limiter,
            settings,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Validate an authorization request (RFC 6749 section 4.1.1).
    ///
    /// The client and redirect URI are checked first; any later failure is redirectable.
    pub async fn validate_authorize(
        &self,
        request: &AuthorizeRequest,
    ) -> Result<ValidatedAuthorization, AuthorizeError> {
        let client_id = request
            .client_id
            .as_deref()
            .filter(|client_id| !client_id.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("Missing client_id".to_string()))?;
        let client = self
            .clients
            .get(client_id)
            .await
            .map_err(OAuthError::from)?
            .ok_or_else(|| OAuthError::InvalidRequest("Unknown client_id".to_string()))?;

        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("Missing redirect_uri".to_string()))?;
        if !redirect_uri_matches(&client, redirect_uri) {
            tracing::warn!(target: "security", client_id, "unregistered redirect_uri presented");
            return Err(AuthorizeError::Direct(OAuthError::InvalidRequest(
                "redirect_uri is not registered for this client".to_string(),
            )));
        }

        let redirect = |error: OAuthError| AuthorizeError::Redirect {
            redirect_uri: redirect_uri.to_string(),
            error,
            state: request.state.clone(),
        };

        match request.response_type.as_deref() {
            Some("code") => {}
            Some(other) => {
                return Err(redirect(OAuthError::UnsupportedResponseType(other.to_string())));
            }
            None => {
                return Err(redirect(OAuthError::InvalidRequest(
                    "Missing response_type".to_string(),
                )));
            }
        }

        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(redirect(OAuthError::UnauthorizedClient(
                "Client is not registered for the authorization_code grant".to_string(),
            )));
        }

        let requested_scopes = match request.scope.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(scope) if !validate_scope(scope) => {
                return Err(redirect(OAuthError::InvalidScope(
                    "scope contains invalid characters".to_string(),
                )));
            }
            Some(scope) => parse_scope(scope),
            None => client.scopes.iter().cloned().collect(),
        };

        let code_challenge = request
            .code_challenge
            .clone()
            .filter(|challenge| !challenge.is_empty());
        let code_challenge_method = match request.code_challenge_method.as_deref() {
            Some(method) => Some(method.parse::<CodeChallengeMethod>().map_err(redirect)?),
            None => None,
        };
        match (&code_challenge, code_challenge_method) {
            (None, Some(_)) => {
                return Err(redirect(OAuthError::InvalidRequest(
                    "code_challenge_method without code_challenge".to_string(),
                )));
            }
            (Some(challenge), _) if !pkce::is_well_formed(challenge) => {
                return Err(redirect(OAuthError::InvalidRequest(
                    "Malformed code_challenge".to_string(),
                )));
            }
            _ => {}
        }
        if client.is_public()
            && (code_challenge.is_none() || code_challenge_method != Some(CodeChallengeMethod::S256))
        {
            return Err(redirect(OAuthError::InvalidRequest(
                "Public clients must use PKCE with code_challenge_method=S256".to_string(),
            )));
        }

        if let Some(resource) = request.resource.as_deref() {
            if resource != self.settings.resource_uri {
                return Err(redirect(OAuthError::InvalidTarget(format!(
                    "Unknown resource {}",
                    resource
                ))));
            }
        }

        Ok(ValidatedAuthorization {
            redirect_uri: redirect_uri.to_string(),
            state: request.state.clone(),
            code_challenge_method: code_challenge.as_ref().map(|_| {
                code_challenge_method.unwrap_or(CodeChallengeMethod::Plain)
            }),
            code_challenge,
            requested_scopes,
            request: request.clone(),
            client,
        })
    }

    /// Issue a code for an approved request and return the client redirect URL.
    ///
    /// The request is validated again against the registry, so a client or redirect URI
    /// changed since the consent screen was shown cannot receive the code.
    pub async fn approve(
        &self,
        request: &AuthorizeRequest,
        user_id: &str,
    ) -> Result<String, AuthorizeError> {
        let validated = self.validate_authorize(request).await?;
        let scopes = validated.granted_scopes();
        if scopes.is_empty() {
            return Err(AuthorizeError::Redirect {
                redirect_uri: validated.redirect_uri,
                error: OAuthError::InvalidScope(
                    "None of the requested scopes are allowed for this client".to_string(),
                ),
                state: validated.state,
            });
        }

        let code = self
            .codes
            .issue(
                &validated.client.client_id,
                user_id,
                &validated.redirect_uri,
                scopes,
                CodeBinding {
                    state: validated.state.clone(),
                    code_challenge: validated.code_challenge.clone(),
                    code_challenge_method: validated.code_challenge_method,
                },
            )
            .await
            .map_err(OAuthError::from)?;

        let mut url = Url::parse(&validated.redirect_uri).map_err(|e| {
            AuthorizeError::Direct(OAuthError::ServerError(format!("redirect_uri: {}", e)))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("code", &code);
            if let Some(state) = &validated.state {
                query.append_pair("state", state);
            }
            query.append_pair("iss", &self.settings.issuer);
        }

        tracing::info!(client_id = %validated.client.client_id, "authorization approved");
        Ok(url.to_string())
    }

    /// Build the `access_denied` redirect for a refused request.
    pub async fn deny(&self, request: &AuthorizeRequest) -> AuthorizeError {
        match self.validate_authorize(request).await {
            Ok(validated) => AuthorizeError::Redirect {
                redirect_uri: validated.redirect_uri,
                error: OAuthError::AccessDenied("The resource owner denied the request".to_string()),
                state: validated.state,
            },
            Err(err) => err,
        }
    }

    /// Check resource owner credentials under the login attempt budget.
    pub async fn login(&self, username: &str, password: &str) -> Result<User, OAuthError> {
        let limit_key = format!("login:{}", username);
        self.rate_limiter.check(&limit_key).await?;

        match self.users.authenticate(username, password).await? {
            Some(user) => {
                self.rate_limiter.reset(&limit_key).await?;
                tracing::info!(user_id = %user.id, "user signed in");
                Ok(user)
            }
            None => {
                tracing::warn!(target: "security", username, "failed login");
                Err(OAuthError::AccessDenied("Invalid username or password".to_string()))
            }
        }
    }

    /// Token endpoint (RFC 6749 section 3.2).
    pub async fn token(&self, form: TokenForm, headers: &HeaderMap) -> Result<TokenResponse, OAuthError> {
        self.token_from(form, headers, None).await
    }

    /// Token endpoint for a request that arrived from `peer`.
    ///
    /// Only failed client authentications spend the budget, which is kept per client and
    /// request source so a flood of bad secrets from one address cannot lock the client out
    /// everywhere.
    pub async fn token_from(
        &self,
        form: TokenForm,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> Result<TokenResponse, OAuthError> {
        let client_auth = extract_client_auth(
            headers,
            form.client_id.as_deref(),
            form.client_secret.as_deref(),
        );
        let request = TokenRequest::try_from(form)?;
        let client_auth = client_auth
            .ok_or_else(|| OAuthError::InvalidClient("Missing client authentication".to_string()))?;

        let limit_key = format!(
            "token:{}:{}",
            client_auth.client_id,
            request_source(headers, peer)
        );
        self.rate_limiter.ensure_allowed(&limit_key).await?;
        let client = match self.authenticate_client(&client_auth).await {
            Ok(client) => client,
            Err(err) => {
                if let OAuthError::InvalidClient(_) = err {
                    let attempts = self.rate_limiter.record_failure(&limit_key).await?;
                    tracing::warn!(target: "security", client_id = %client_auth.client_id, attempts, "client authentication failed");
                }
                return Err(err);
            }
        };

        if !client.allows_grant(request.grant_type()) {
            return Err(OAuthError::UnauthorizedClient(format!(
                "Client may not use the {} grant",
                request.grant_type().as_str()
            )));
        }

        let response = match request {
            TokenRequest::AuthorizationCode {
                code,
                redirect_uri,
                code_verifier,
                resource,
            } => {
                self.check_resource(resource.as_deref())?;
                self.handle_authorization_code_grant(&client, &code, &redirect_uri, code_verifier.as_deref())
                    .await?
            }
            TokenRequest::RefreshToken {
                refresh_token,
                scope,
            } => {
                let scope = scope.as_deref().map(parse_scope);
                self.tokens
                    .refresh(&refresh_token, &client.client_id, scope.as_ref())
                    .await?
                    .into()
            }
            TokenRequest::ClientCredentials { scope, resource } => {
                self.check_resource(resource.as_deref())?;
                self.handle_client_credentials_grant(&client, scope.as_deref())
                    .await?
            }
        };

        Ok(response)
    }

    async fn handle_authorization_code_grant(
        &self,
        client: &Client,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, OAuthError> {
        let record = self
            .codes
            .redeem(code, &client.client_id, redirect_uri, code_verifier)
            .await?
            .ok_or_else(|| OAuthError::InvalidGrant("Invalid authorization code".to_string()))?;

        let pair = self
            .tokens
            .issue_token_pair(
                &record.user_id,
                &client.client_id,
                &record.scopes,
                IssueOptions {
                    include_refresh_token: client.allows_grant(GrantType::RefreshToken),
                    custom_claims: Map::new(),
                },
            )
            .await?;
        Ok(pair.into())
    }

    async fn handle_client_credentials_grant(
        &self,
        client: &Client,
        scope: Option<&str>,
    ) -> Result<TokenResponse, OAuthError> {
        if client.is_public() {
            return Err(OAuthError::UnauthorizedClient(
                "client_credentials requires a confidential client".to_string(),
            ));
        }

        let scopes = match scope {
            Some(scope) => {
                let requested = parse_scope(scope);
                if let Some(extra) = requested.iter().find(|s| !client.scopes.contains(*s)) {
                    return Err(OAuthError::InvalidScope(format!(
                        "scope {} is not allowed for this client",
                        extra
                    )));
                }
                requested.into_iter().collect::<Vec<_>>()
            }
            None => client.scopes.clone(),
        };
        if scopes.is_empty() {
            return Err(OAuthError::InvalidScope("No scopes available".to_string()));
        }

        let pair = self
            .tokens
            .issue_token_pair(&client.client_id, &client.client_id, &scopes, IssueOptions::default())
            .await?;
        Ok(pair.into())
    }

    /// Introspection endpoint (RFC 7662). Only confidential clients may introspect.
    pub async fn introspect(
        &self,
        form: TokenActionForm,
        headers: &HeaderMap,
    ) -> Result<IntrospectionResponse, OAuthError> {
        let client_auth = extract_client_auth(
            headers,
            form.client_id.as_deref(),
            form.client_secret.as_deref(),
        )
        .ok_or_else(|| OAuthError::InvalidClient("Missing client authentication".to_string()))?;
        let client = self.authenticate_client(&client_auth).await?;
        if client.is_public() {
            return Err(OAuthError::InvalidClient(
                "Public clients may not introspect tokens".to_string(),
            ));
        }

        let token = form
            .token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("Missing token".to_string()))?;
        self.tokens.introspect(&token).await
    }

    /// Revocation endpoint (RFC 7009).
    pub async fn revoke(&self, form: TokenActionForm, headers: &HeaderMap) -> Result<(), OAuthError> {
        let client_auth = extract_client_auth(
            headers,
            form.client_id.as_deref(),
            form.client_secret.as_deref(),
        )
        .ok_or_else(|| OAuthError::InvalidClient("Missing client authentication".to_string()))?;
        let client = self.authenticate_client(&client_auth).await?;

        let token = form
            .token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("Missing token".to_string()))?;
        self.tokens.revoke_token(&token, &client.client_id).await?;
        Ok(())
    }

    /// Dynamic client registration (RFC 7591).
    pub async fn register(
        &self,
        metadata: ClientMetadata,
    ) -> Result<ClientRegistrationResponse, ClientRegistrationError> {
        if !self.settings.registration_enabled {
            return Err(ClientRegistrationError::RegistrationDisabled);
        }
        let (client, secret) = self.clients.register(metadata).await?;
        Ok(registration_response(&client, secret))
    }

    /// Claims about the token's user, gated by its scopes.
    pub async fn userinfo(&self, token: &AuthenticatedToken) -> Result<Value, OAuthError> {
        let user = self
            .users
            .get(&token.subject)
            .await?
            .ok_or_else(|| OAuthError::InvalidToken("Token subject is not a user".to_string()))?;

        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!(user.id));
        if token.has_scope("profile") {
            claims.insert("preferred_username".to_string(), json!(user.username));
            if let Some(name) = &user.name {
                claims.insert("name".to_string(), json!(name));
            }
            if let Some(picture) = &user.picture {
                claims.insert("picture".to_string(), json!(picture));
            }
        }
        if token.has_scope("email") {
            if let Some(email) = &user.email {
                claims.insert("email".to_string(), json!(email));
                claims.insert("email_verified".to_string(), json!(user.email_verified));
            }
        }
        Ok(Value::Object(claims))
    }

    /// RFC 8414 metadata document.
    pub fn metadata(&self) -> AuthorizationServerMetadata {
        let settings = &self.settings;
        let strings = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();

        AuthorizationServerMetadata {
            issuer: settings.issuer.clone(),
            authorization_endpoint: settings.endpoint("authorize"),
            token_endpoint: settings.endpoint("token"),
            jwks_uri: settings.well_known("jwks.json"),
            introspection_endpoint: settings.endpoint("introspect"),
            revocation_endpoint: settings.endpoint("revoke"),
            userinfo_endpoint: settings.endpoint("userinfo"),
            registration_endpoint: settings
                .registration_enabled
                .then(|| settings.endpoint("register")),
            scopes_supported: settings.supported_scopes.iter().cloned().collect(),
            response_types_supported: strings(&["code"]),
            grant_types_supported: strings(&[
                GrantType::AuthorizationCode.as_str(),
                GrantType::RefreshToken.as_str(),
                GrantType::ClientCredentials.as_str(),
            ]),
            code_challenge_methods_supported: strings(&["S256", "plain"]),
            token_endpoint_auth_methods_supported: strings(&[
                "client_secret_basic",
                "client_secret_post",
                "none",
            ]),
            introspection_endpoint_auth_methods_supported: strings(&[
                "client_secret_basic",
                "client_secret_post",
            ]),
            revocation_endpoint_auth_methods_supported: strings(&[
                "client_secret_basic",
                "client_secret_post",
                "none",
            ]),
        }
    }

    async fn authenticate_client(&self, auth: &ClientAuthentication) -> Result<Client, OAuthError> {
        self.clients
            .validate_client(&auth.client_id, auth.client_secret.as_deref())
            .await?
            .ok_or_else(|| OAuthError::InvalidClient("Client authentication failed".to_string()))
    }

    fn check_resource(&self, resource: Option<&str>) -> Result<(), OAuthError> {
        match resource {
            Some(resource) if resource != self.settings.resource_uri => Err(
                OAuthError::InvalidTarget(format!("Unknown resource {}", resource)),
            ),
            _ => Ok(()),
        }
    }
}
