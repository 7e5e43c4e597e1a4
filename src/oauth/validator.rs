//! Resource-server side bearer token validation.
//!
//! A deployment picks exactly one [`TokenVerifier`]: local verification against the
//! server's own key, verification against a remote JWKS document, or RFC 7662
//! introspection. The [`TokenValidator`] layers the audience check, the all-of scope check
//! and a bounded result cache on top. Without a verifier every token is rejected.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use http::{HeaderMap, header};
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::clock::SharedClock;
use crate::errors::{OAuthError, TokenError};
use crate::oauth::codec::{TokenClaims, TokenCodec, TokenKind, decode_claims};
use crate::oauth::types::{IntrospectionResponse, join_scopes, parse_scope};

/// Identity and grant carried by a validated access token
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedToken {
    pub subject: String,
    pub client_id: String,
    pub scopes: BTreeSet<String>,
    pub audience: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthenticatedToken {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    pub fn scope(&self) -> String {
        join_scopes(&self.scopes)
    }
}

impl From<TokenClaims> for AuthenticatedToken {
    fn from(claims: TokenClaims) -> Self {
        AuthenticatedToken {
            scopes: claims.scopes(),
            audience: claims.aud.to_vec(),
            expires_at: claims.expires_at(),
            subject: claims.sub,
            client_id: claims.client_id,
        }
    }
}

fn invalid_token(description: impl Into<String>) -> OAuthError {
    OAuthError::InvalidToken(description.into())
}

/// One token validation strategy.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Check signature or activity and time claims. Audience and scope are checked by the caller.
    async fn verify(&self, token: &str) -> Result<AuthenticatedToken, OAuthError>;
}

/// Verifies tokens signed by this server's own key.
pub struct LocalVerifier {
    codec: TokenCodec,
}

impl LocalVerifier {
    pub fn new(codec: TokenCodec) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl TokenVerifier for LocalVerifier {
    async fn verify(&self, token: &str) -> Result<AuthenticatedToken, OAuthError> {
        let claims = self.codec.verify(token, None)?;
        if claims.token_type != TokenKind::AccessToken {
            return Err(invalid_token("refresh tokens cannot be used as bearer tokens"));
        }
        Ok(claims.into())
    }
}

/// Verifies tokens against a remote JWKS document.
///
/// The key set is cached and fetched again when a token names an unknown `kid`, at most
/// once per [`JWKS_REFETCH_COOLDOWN_SECS`].
pub struct JwksVerifier {
    http_client: reqwest::Client,
    jwks_uri: String,
    issuer: Option<String>,
    clock: SharedClock,
    keys: RwLock<Option<JwkSet>>,
    last_fetch: Mutex<Option<DateTime<Utc>>>,
}

/// Minimum gap between two JWKS fetches, in seconds.
pub const JWKS_REFETCH_COOLDOWN_SECS: i64 = 30;

impl JwksVerifier {
    pub fn new(
        http_client: reqwest::Client,
        jwks_uri: impl Into<String>,
        issuer: Option<String>,
        clock: SharedClock,
    ) -> Self {
        Self {
            http_client,
            jwks_uri: jwks_uri.into(),
            issuer,
            clock,
            keys: RwLock::new(None),
            last_fetch: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<JwkSet, OAuthError> {
        let response = self
            .http_client
            .get(&self.jwks_uri)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| {
                tracing::error!(error = %e, jwks_uri = %self.jwks_uri, "JWKS fetch failed");
                invalid_token("signing keys unavailable")
            })?;

        let jwks = response.json::<JwkSet>().await.map_err(|e| {
            tracing::error!(error = %e, jwks_uri = %self.jwks_uri, "JWKS document is malformed");
            invalid_token("signing keys unavailable")
        })?;

        *self.keys.write().await = Some(jwks.clone());
        Ok(jwks)
    }

    async fn cached_jwk(&self, kid: &str) -> Option<Jwk> {
        self.keys
            .read()
            .await
            .as_ref()
            .and_then(|jwks| jwks.find(kid))
            .cloned()
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, OAuthError> {
        let jwk = match self.cached_jwk(kid).await {
            Some(jwk) => jwk,
            None => {
                // Held across the fetch so concurrent misses share one request.
                let mut last_fetch = self.last_fetch.lock().await;
                match self.cached_jwk(kid).await {
                    Some(jwk) => jwk,
                    None => {
                        let now = self.clock.now();
                        if let Some(at) = *last_fetch {
                            if now - at < Duration::seconds(JWKS_REFETCH_COOLDOWN_SECS) {
                                tracing::debug!(kid, "unknown kid inside JWKS refetch cooldown");
                                return Err(invalid_token(format!("unknown signing key {}", kid)));
                            }
                        }
                        *last_fetch = Some(now);
                        self.fetch()
                            .await?
                            .find(kid)
                            .cloned()
                            .ok_or_else(|| invalid_token(format!("unknown signing key {}", kid)))?
                    }
                }
            }
        };

        DecodingKey::from_jwk(&jwk).map_err(|e| invalid_token(format!("unusable signing key: {}", e)))
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<AuthenticatedToken, OAuthError> {
        let header = jsonwebtoken::decode_header(token).map_err(TokenError::from)?;
        let kid = header
            .kid
            .ok_or_else(|| invalid_token("token header has no kid"))?;
        let key = self.decoding_key(&kid).await?;

        let claims = decode_claims(token, &key, self.issuer.as_deref(), None, self.clock.now())?;
        if claims.token_type != TokenKind::AccessToken {
            return Err(invalid_token("refresh tokens cannot be used as bearer tokens"));
        }
        Ok(claims.into())
    }
}

/// Client credentials presented to a remote introspection endpoint
#[derive(Debug, Clone)]
pub struct IntrospectionCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Asks a remote authorization server whether a token is active (RFC 7662).
///
/// Transport errors, timeouts and unreadable responses all count as inactive.
pub struct IntrospectionVerifier {
    http_client: reqwest::Client,
    endpoint: String,
    credentials: IntrospectionCredentials,
    timeout: std::time::Duration,
    clock: SharedClock,
}

impl IntrospectionVerifier {
    pub fn new(
        http_client: reqwest::Client,
        endpoint: impl Into<String>,
        credentials: IntrospectionCredentials,
        timeout: std::time::Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
            credentials,
            timeout,
            clock,
        }
    }

    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse, reqwest::Error> {
        let mut form = vec![("token", token), ("token_type_hint", "access_token")];
        let mut request = self.http_client.post(&self.endpoint).timeout(self.timeout);
        match &self.credentials.client_secret {
            Some(secret) => {
                request = request.basic_auth(&self.credentials.client_id, Some(secret));
            }
            None => form.push(("client_id", self.credentials.client_id.as_str())),
        }

        request
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json::<IntrospectionResponse>()
            .await
    }
}

fn audience_from_value(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(aud)) => vec![aud.clone()],
        Some(serde_json::Value::Array(values)) => values
            .iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl TokenVerifier for IntrospectionVerifier {
    async fn verify(&self, token: &str) -> Result<AuthenticatedToken, OAuthError> {
        let response = self.introspect(token).await.map_err(|e| {
            tracing::warn!(error = %e, endpoint = %self.endpoint, "token introspection failed");
            invalid_token("token could not be validated")
        })?;

        if !response.active {
            return Err(invalid_token("token is not active"));
        }

        let expires_at = response.exp.and_then(|exp| DateTime::from_timestamp(exp, 0));
        if expires_at.is_some_and(|exp| exp <= self.clock.now()) {
            return Err(invalid_token("token is expired"));
        }

        Ok(AuthenticatedToken {
            subject: response.sub.clone().unwrap_or_default(),
            client_id: response.client_id.clone().unwrap_or_default(),
            scopes: response.scope.as_deref().map(parse_scope).unwrap_or_default(),
            audience: audience_from_value(response.aud.as_ref()),
            expires_at,
        })
    }
}

#[derive(Debug, Clone)]
struct CachedValidation {
    token: AuthenticatedToken,
    cached_until: DateTime<Utc>,
}

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// Any other scheme, an empty token, or a token containing whitespace yields `None`.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }
    Some(token)
}

/// Validates bearer tokens for a protected resource.
pub struct TokenValidator {
    verifier: Option<Arc<dyn TokenVerifier>>,
    resource_uri: Option<String>,
    cache: DashMap<String, CachedValidation>,
    cache_ttl: Duration,
    clock: SharedClock,
}

impl TokenValidator {
    pub fn new(
        verifier: Option<Arc<dyn TokenVerifier>>,
        resource_uri: Option<String>,
        cache_ttl: Duration,
        clock: SharedClock,
    ) -> Self {
        if verifier.is_none() {
            tracing::warn!("no token validation strategy configured; all bearer tokens will be rejected");
        }
        Self {
            verifier,
            resource_uri,
            cache: DashMap::new(),
            cache_ttl,
            clock,
        }
    }

    pub fn resource_uri(&self) -> Option<&str> {
        self.resource_uri.as_deref()
    }

    /// Validate a token and require every scope in `required_scopes`.
    ///
    /// Fails with `invalid_token` when the token cannot be trusted and with
    /// `insufficient_scope` when it is trusted but under-scoped.
    pub async fn validate_token(
        &self,
        token: &str,
        required_scopes: &[String],
    ) -> Result<AuthenticatedToken, OAuthError> {
        let authenticated = match self.cached(token) {
            Some(authenticated) => authenticated,
            None => {
                let verifier = self
                    .verifier
                    .as_ref()
                    .ok_or_else(|| invalid_token("token validation is not configured"))?;
                let authenticated = verifier.verify(token).await?;
                self.check_audience(&authenticated)?;
                self.remember(token, &authenticated);
                authenticated
            }
        };

        let missing: Vec<&String> = required_scopes
            .iter()
            .filter(|scope| !authenticated.scopes.contains(*scope))
            .collect();
        if !missing.is_empty() {
            return Err(OAuthError::InsufficientScope(format!(
                "Required scope: {}",
                join_scopes(required_scopes)
            )));
        }

        Ok(authenticated)
    }

    /// Drop expired cache entries, returning how many were removed.
    pub fn purge_cache(&self) -> usize {
        let now = self.clock.now();
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.cached_until > now);
        before.saturating_sub(self.cache.len())
    }

    fn check_audience(&self, token: &AuthenticatedToken) -> Result<(), OAuthError> {
        match &self.resource_uri {
            Some(resource_uri) if !token.audience.iter().any(|aud| aud == resource_uri) => {
                Err(invalid_token("token audience does not include this resource"))
            }
            _ => Ok(()),
        }
    }

    fn cached(&self, token: &str) -> Option<AuthenticatedToken> {
        let now = self.clock.now();
        let entry = self.cache.get(token)?;
        if entry.cached_until > now {
            return Some(entry.token.clone());
        }
        drop(entry);
        self.cache.remove(token);
        None
    }

    fn remember(&self, token: &str, authenticated: &AuthenticatedToken) {
        // Tokens without a known expiry are re-validated every time.
        let Some(expires_at) = authenticated.expires_at else {
            return;
        };
        let now = self.clock.now();
        let cached_until = (now + self.cache_ttl).min(expires_at);
        if cached_until > now {
            self.cache.insert(
                token.to_string(),
                CachedValidation {
                    token: authenticated.clone(),
                    cached_until,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::oauth::codec::Audience;
    use crate::oauth::keys::KeyManager;
    use axum::{Form, Json, Router, routing::{get, post}};
    use serde_json::{Map, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ISSUER: &str = "https://auth.example";

    fn scopes(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn claims(clock: &MockClock, aud: &str, scope: &str, ttl: Duration) -> TokenClaims {
        let now = clock.now();
        TokenClaims {
            sub: "user-1".to_string(),
            aud: Audience::from(aud),
            iss: ISSUER.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            nbf: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            client_id: "client-1".to_string(),
            scope: scope.to_string(),
            token_type: TokenKind::AccessToken,
            extra: Map::new(),
        }
    }

    fn local(clock: &MockClock, resource_uri: &str) -> (TokenCodec, TokenValidator) {
        let shared: SharedClock = Arc::new(clock.clone());
        let codec = TokenCodec::new(Arc::new(KeyManager::generate().unwrap()), ISSUER, shared.clone());
        let validator = TokenValidator::new(
            Some(Arc::new(LocalVerifier::new(codec.clone()))),
            Some(resource_uri.to_string()),
            Duration::seconds(60),
            shared,
        );
        (codec, validator)
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc.def"));

        for malformed in ["Basic abc", "bearer abc", "Bearer ", "Bearer a b", "Bearerabc"] {
            headers.insert(header::AUTHORIZATION, malformed.parse().unwrap());
            assert_eq!(extract_bearer_token(&headers), None, "{}", malformed);
        }
    }

    #[tokio::test]
    async fn test_scope_check_is_all_of() {
        let clock = MockClock::default();
        let (codec, validator) = local(&clock, "urn:res:A");
        let token = codec
            .sign(&claims(&clock, "urn:res:A", "mcp.read", Duration::minutes(15)))
            .unwrap();

        let authenticated = validator
            .validate_token(&token, &scopes(&["mcp.read"]))
            .await
            .unwrap();
        assert_eq!(authenticated.subject, "user-1");
        assert!(authenticated.has_scope("mcp.read"));

        let err = validator
            .validate_token(&token, &scopes(&["mcp.read", "mcp.write"]))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "insufficient_scope");
    }

    #[tokio::test]
    async fn test_audience_mismatch_is_rejected() {
        let clock = MockClock::default();
        let (codec, validator) = local(&clock, "urn:res:B");
        let token = codec
            .sign(&claims(&clock, "urn:res:A", "mcp.read", Duration::minutes(15)))
            .unwrap();

        let err = validator.validate_token(&token, &[]).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_token");
    }

    #[tokio::test]
    async fn test_refresh_token_is_not_a_bearer_token() {
        let clock = MockClock::default();
        let (codec, validator) = local(&clock, "urn:res:A");
        let mut refresh = claims(&clock, "urn:res:A", "mcp.read", Duration::days(1));
        refresh.token_type = TokenKind::RefreshToken;
        let token = codec.sign(&refresh).unwrap();

        assert!(validator.validate_token(&token, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_never_outlives_token() {
        let clock = MockClock::default();
        let (codec, validator) = local(&clock, "urn:res:A");
        let token = codec
            .sign(&claims(&clock, "urn:res:A", "mcp.read", Duration::seconds(20)))
            .unwrap();

        assert!(validator.validate_token(&token, &[]).await.is_ok());
        let cached_until = validator.cache.get(&token).unwrap().cached_until;
        assert!(cached_until <= clock.now() + Duration::seconds(20));

        clock.advance(Duration::seconds(21));
        assert_eq!(validator.purge_cache(), 1);

        clock.advance(Duration::seconds(30));
        assert!(validator.validate_token(&token, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_no_verifier_fails_closed() {
        let clock = MockClock::default();
        let validator = TokenValidator::new(None, None, Duration::seconds(60), Arc::new(clock));
        let err = validator.validate_token("anything", &[]).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_token");
    }

    #[tokio::test]
    async fn test_jwks_verifier() {
        let clock = MockClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let keys = Arc::new(KeyManager::generate().unwrap());
        let jwks = serde_json::to_value(keys.jwks()).unwrap();
        let codec = TokenCodec::new(keys, ISSUER, shared.clone());

        let base = spawn(Router::new().route(
            "/jwks.json",
            get(move || {
                let jwks = jwks.clone();
                async move { Json(jwks) }
            }),
        ))
        .await;

        let verifier = JwksVerifier::new(
            reqwest::Client::new(),
            format!("{}/jwks.json", base),
            Some(ISSUER.to_string()),
            shared.clone(),
        );
        let validator = TokenValidator::new(
            Some(Arc::new(verifier)),
            Some("urn:res:A".to_string()),
            Duration::seconds(60),
            shared,
        );

        let token = codec
            .sign(&claims(&clock, "urn:res:A", "mcp.read", Duration::minutes(5)))
            .unwrap();
        let authenticated = validator
            .validate_token(&token, &scopes(&["mcp.read"]))
            .await
            .unwrap();
        assert_eq!(authenticated.client_id, "client-1");

        let stranger = TokenCodec::new(Arc::new(KeyManager::generate().unwrap()), ISSUER, Arc::new(clock.clone()));
        let forged = stranger
            .sign(&claims(&clock, "urn:res:A", "mcp.read", Duration::minutes(5)))
            .unwrap();
        assert!(validator.validate_token(&forged, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_jwks_unknown_kid_refetch_is_throttled() {
        let clock = MockClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let keys = Arc::new(KeyManager::generate().unwrap());
        let jwks = serde_json::to_value(keys.jwks()).unwrap();
        let codec = TokenCodec::new(keys, ISSUER, shared.clone());
        let fetches = Arc::new(AtomicUsize::new(0));

        let counter = fetches.clone();
        let base = spawn(Router::new().route(
            "/jwks.json",
            get(move || {
                let jwks = jwks.clone();
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Json(jwks) }
            }),
        ))
        .await;

        let verifier = JwksVerifier::new(
            reqwest::Client::new(),
            format!("{}/jwks.json", base),
            Some(ISSUER.to_string()),
            shared.clone(),
        );
        let token = codec
            .sign(&claims(&clock, "urn:res:A", "mcp.read", Duration::minutes(5)))
            .unwrap();
        assert!(verifier.verify(&token).await.is_ok());
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let stranger = TokenCodec::new(Arc::new(KeyManager::generate().unwrap()), ISSUER, shared);
        let forged = stranger
            .sign(&claims(&clock, "urn:res:A", "mcp.read", Duration::minutes(5)))
            .unwrap();
        for _ in 0..20 {
            assert!(verifier.verify(&forged).await.is_err());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(JWKS_REFETCH_COOLDOWN_SECS + 1));
        assert!(verifier.verify(&forged).await.is_err());
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        assert!(verifier.verify(&token).await.is_ok());
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_introspection_verifier() {
        let clock = MockClock::default();
        let exp = (clock.now() + Duration::minutes(5)).timestamp();

        let base = spawn(Router::new().route(
            "/introspect",
            post(move |headers: HeaderMap, Form(form): Form<HashMap<String, String>>| async move {
                let authorized = headers.get(header::AUTHORIZATION).is_some();
                let active = authorized && form.get("token").map(String::as_str) == Some("good");
                if active {
                    Json(json!({
                        "active": true,
                        "scope": "mcp.read",
                        "sub": "user-1",
                        "client_id": "client-1",
                        "aud": ["urn:res:A"],
                        "exp": exp,
                    }))
                } else {
                    Json(json!({ "active": false }))
                }
            }),
        ))
        .await;

        let shared: SharedClock = Arc::new(clock.clone());
        let verifier = IntrospectionVerifier::new(
            reqwest::Client::new(),
            format!("{}/introspect", base),
            IntrospectionCredentials {
                client_id: "resource-server".to_string(),
                client_secret: Some("secret".to_string()),
            },
            std::time::Duration::from_secs(5),
            shared.clone(),
        );
        let validator = TokenValidator::new(
            Some(Arc::new(verifier)),
            Some("urn:res:A".to_string()),
            Duration::seconds(60),
            shared,
        );

        let authenticated = validator
            .validate_token("good", &scopes(&["mcp.read"]))
            .await
            .unwrap();
        assert_eq!(authenticated.subject, "user-1");
        assert_eq!(authenticated.audience, vec!["urn:res:A"]);

        assert!(validator.validate_token("bad", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_introspection_timeout_fails_closed() {
        let base = spawn(Router::new().route(
            "/introspect",
            post(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                Json(json!({ "active": true, "scope": "mcp.read" }))
            }),
        ))
        .await;

        let clock: SharedClock = Arc::new(MockClock::default());
        let verifier = IntrospectionVerifier::new(
            reqwest::Client::new(),
            format!("{}/introspect", base),
            IntrospectionCredentials {
                client_id: "resource-server".to_string(),
                client_secret: None,
            },
            std::time::Duration::from_millis(100),
            clock,
        );

        let err = verifier.verify("good").await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_token");
    }

    #[tokio::test]
    async fn test_introspection_transport_error_fails_closed() {
        let clock: SharedClock = Arc::new(MockClock::default());
        let verifier = IntrospectionVerifier::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/introspect",
            IntrospectionCredentials {
                client_id: "resource-server".to_string(),
                client_secret: None,
            },
            std::time::Duration::from_secs(1),
            clock,
        );
        assert!(verifier.verify("good").await.is_err());
    }
}
