//! Access/refresh token minting, refresh, revocation and introspection.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::errors::{OAuthError, StorageError};
use crate::oauth::codec::{Audience, TokenClaims, TokenCodec, TokenKind};
use crate::oauth::refresh_store::RefreshTokenStore;
use crate::oauth::types::{IntrospectionResponse, RefreshTokenRecord, TokenResponse, join_scopes};

/// Result of a successful grant
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        TokenResponse {
            access_token: pair.access_token,
            token_type: pair.token_type.to_string(),
            expires_in: pair.expires_in,
            refresh_token: pair.refresh_token,
            scope: pair.scope,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    pub include_refresh_token: bool,
    pub custom_claims: Map<String, Value>,
}

/// Settings that shape issued tokens
#[derive(Debug, Clone)]
pub struct TokenSettings {
    /// Audience of access tokens
    pub resource_uri: String,
    pub access_token_ttl: Duration,
    /// Replace the refresh token on every use
    pub rotate_refresh_tokens: bool,
}

fn invalid_refresh() -> OAuthError {
    OAuthError::InvalidGrant("Invalid refresh token".to_string())
}

#[derive(Clone)]
pub struct TokenService {
    codec: TokenCodec,
    refresh_tokens: RefreshTokenStore,
    settings: TokenSettings,
}

impl TokenService {
    pub fn new(codec: TokenCodec, refresh_tokens: RefreshTokenStore, settings: TokenSettings) -> Self {
        Self {
            codec,
            refresh_tokens,
            settings,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    pub async fn issue_token_pair(
        &self,
        user_id: &str,
        client_id: &str,
        scopes: &[String],
        options: IssueOptions,
    ) -> Result<TokenPair, OAuthError> {
        let refresh_token = if options.include_refresh_token {
            let record = self
                .refresh_tokens
                .create(user_id, client_id, scopes.to_vec())
                .await?;
            Some(self.sign_refresh_token(&record)?)
        } else {
            None
        };

        self.access_pair(user_id, client_id, scopes, options.custom_claims, refresh_token)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// `scope` may narrow the original grant but never widen it. Without rotation the same
    /// refresh token stays valid and is not returned again.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        scope: Option<&BTreeSet<String>>,
    ) -> Result<TokenPair, OAuthError> {
        let claims = self
            .codec
            .verify(refresh_token, Some(self.codec.issuer()))
            .map_err(|e| {
                tracing::debug!(error = %e, "refresh token failed verification");
                invalid_refresh()
            })?;
        if claims.token_type != TokenKind::RefreshToken {
            return Err(invalid_refresh());
        }

        let record = self
            .refresh_tokens
            .get(&claims.jti)
            .await?
            .ok_or_else(invalid_refresh)?;
        if record.is_revoked {
            tracing::warn!(target: "security", client_id, "revoked refresh token presented");
            return Err(invalid_refresh());
        }
        if record.client_id != client_id || claims.client_id != client_id {
            tracing::warn!(target: "security", client_id, "refresh token presented by another client");
            return Err(invalid_refresh());
        }

        let scopes: Vec<String> = match scope {
            Some(requested) => {
                if let Some(extra) = requested.iter().find(|s| !record.scopes.contains(*s)) {
                    return Err(OAuthError::InvalidScope(format!(
                        "scope {} exceeds the original grant",
                        extra
                    )));
                }
                requested.iter().cloned().collect()
            }
            None => record.scopes.clone(),
        };

        let refresh_token = if self.settings.rotate_refresh_tokens {
            let next = self
                .refresh_tokens
                .rotate(&record.token_id)
                .await?
                .ok_or_else(invalid_refresh)?;
            Some(self.sign_refresh_token(&next)?)
        } else {
            None
        };

        self.access_pair(&record.user_id, client_id, &scopes, Map::new(), refresh_token)
    }

    /// Revoke a refresh-token record by id.
    pub async fn revoke(&self, token_id: &str) -> Result<bool, StorageError> {
        self.refresh_tokens.revoke(token_id).await
    }

    /// RFC 7009 revocation of a presented token on behalf of `client_id`.
    ///
    /// Access tokens are stateless and cannot be revoked before they expire; they and any
    /// unrecognized token are accepted silently.
    pub async fn revoke_token(&self, token: &str, client_id: &str) -> Result<bool, OAuthError> {
        let Ok(claims) = self.codec.verify(token, None) else {
            return Ok(false);
        };
        if claims.token_type != TokenKind::RefreshToken {
            return Ok(false);
        }
        if claims.client_id != client_id {
            tracing::warn!(target: "security", client_id, "revocation attempted for another client's token");
            return Ok(false);
        }
        Ok(self.revoke(&claims.jti).await?)
    }

    /// RFC 7662 view of a token issued by this server.
    pub async fn introspect(&self, token: &str) -> Result<IntrospectionResponse, OAuthError> {
        let Ok(claims) = self.codec.verify(token, None) else {
            return Ok(IntrospectionResponse::inactive());
        };

        if claims.token_type == TokenKind::RefreshToken {
            let live = self
                .refresh_tokens
                .get(&claims.jti)
                .await?
                .is_some_and(|record| !record.is_revoked);
            if !live {
                return Ok(IntrospectionResponse::inactive());
            }
        }

        Ok(IntrospectionResponse {
            active: true,
            scope: Some(claims.scope.clone()),
            client_id: Some(claims.client_id.clone()),
            sub: Some(claims.sub.clone()),
            exp: Some(claims.exp),
            iat: Some(claims.iat),
            nbf: Some(claims.nbf),
            aud: serde_json::to_value(&claims.aud).ok(),
            iss: Some(claims.iss.clone()),
            jti: Some(claims.jti.clone()),
            token_type: Some(claims.token_type.as_str().to_string()),
        })
    }

    fn access_pair(
        &self,
        user_id: &str,
        client_id: &str,
        scopes: &[String],
        custom_claims: Map<String, Value>,
        refresh_token: Option<String>,
    ) -> Result<TokenPair, OAuthError> {
        let now = self.codec.clock().now();
        let ttl = self.settings.access_token_ttl;
        let scope = join_scopes(scopes);

        let claims = TokenClaims {
            sub: user_id.to_string(),
            aud: Audience::from(self.settings.resource_uri.as_str()),
            iss: self.codec.issuer().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            nbf: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            scope: scope.clone(),
            token_type: TokenKind::AccessToken,
            extra: Map::new(),
        }
        .with_custom_claims(custom_claims);

        Ok(TokenPair {
            access_token: self.codec.sign(&claims)?,
            refresh_token,
            token_type: "Bearer",
            expires_in: ttl.num_seconds(),
            scope,
            issued_at: now,
        })
    }

    fn sign_refresh_token(&self, record: &RefreshTokenRecord) -> Result<String, OAuthError> {
        let claims = TokenClaims {
            sub: record.user_id.clone(),
            aud: Audience::from(self.codec.issuer()),
            iss: self.codec.issuer().to_string(),
            iat: record.created_at.timestamp(),
            exp: record.expires_at.timestamp(),
            nbf: record.created_at.timestamp(),
            jti: record.token_id.clone(),
            client_id: record.client_id.clone(),
            scope: join_scopes(&record.scopes),
            token_type: TokenKind::RefreshToken,
            extra: Map::new(),
        };
        Ok(self.codec.sign(&claims)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MockClock, SharedClock};
    use crate::oauth::keys::KeyManager;
    use crate::oauth::types::parse_scope;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    const ISSUER: &str = "https://auth.example";
    const RESOURCE: &str = "urn:res:A";

    fn service(clock: &MockClock, rotate: bool) -> TokenService {
        let shared: SharedClock = Arc::new(clock.clone());
        let codec = TokenCodec::new(Arc::new(KeyManager::generate().unwrap()), ISSUER, shared.clone());
        let refresh_tokens = RefreshTokenStore::new(
            Arc::new(MemoryStore::with_clock(shared.clone())),
            shared,
            Duration::days(30),
        );
        TokenService::new(
            codec,
            refresh_tokens,
            TokenSettings {
                resource_uri: RESOURCE.to_string(),
                access_token_ttl: Duration::minutes(15),
                rotate_refresh_tokens: rotate,
            },
        )
    }

    fn scopes(value: &str) -> Vec<String> {
        parse_scope(value).into_iter().collect()
    }

    #[tokio::test]
    async fn test_issue_access_token_only() {
        let clock = MockClock::default();
        let service = service(&clock, false);
        let pair = service
            .issue_token_pair("user-1", "client-1", &scopes("mcp.read"), IssueOptions::default())
            .await
            .unwrap();

        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 900);
        assert!(pair.refresh_token.is_none());

        let claims = service.codec().verify(&pair.access_token, Some(RESOURCE)).unwrap();
        assert_eq!(claims.scope, "mcp.read");
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.client_id, "client-1");
        assert_eq!(claims.token_type, TokenKind::AccessToken);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[tokio::test]
    async fn test_custom_claims_are_embedded() {
        let clock = MockClock::default();
        let service = service(&clock, false);
        let mut custom = Map::new();
        custom.insert("tenant_id".to_string(), json!("t-1"));
        let pair = service
            .issue_token_pair(
                "user-1",
                "client-1",
                &scopes("mcp.read"),
                IssueOptions {
                    include_refresh_token: false,
                    custom_claims: custom,
                },
            )
            .await
            .unwrap();

        let claims = service.codec().verify(&pair.access_token, None).unwrap();
        assert_eq!(claims.extra.get("tenant_id"), Some(&json!("t-1")));
    }

    #[tokio::test]
    async fn test_refresh_issues_new_access_token() {
        let clock = MockClock::default();
        let service = service(&clock, false);
        let pair = service
            .issue_token_pair(
                "user-1",
                "client-1",
                &scopes("mcp.read mcp.write"),
                IssueOptions {
                    include_refresh_token: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let refresh_token = pair.refresh_token.unwrap();

        clock.advance(Duration::hours(1));
        let refreshed = service.refresh(&refresh_token, "client-1", None).await.unwrap();
        assert!(refreshed.refresh_token.is_none());
        assert_eq!(refreshed.scope, "mcp.read mcp.write");

        let narrowed = service
            .refresh(&refresh_token, "client-1", Some(&parse_scope("mcp.read")))
            .await
            .unwrap();
        assert_eq!(narrowed.scope, "mcp.read");

        let widened = service
            .refresh(&refresh_token, "client-1", Some(&parse_scope("mcp.read profile")))
            .await;
        assert!(matches!(widened, Err(OAuthError::InvalidScope(_))));
    }

    #[tokio::test]
    async fn test_refresh_rejects_wrong_client_and_access_tokens() {
        let clock = MockClock::default();
        let service = service(&clock, false);
        let pair = service
            .issue_token_pair(
                "user-1",
                "client-1",
                &scopes("mcp.read"),
                IssueOptions {
                    include_refresh_token: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let refresh_token = pair.refresh_token.unwrap();
        assert!(matches!(
            service.refresh(&refresh_token, "client-2", None).await,
            Err(OAuthError::InvalidGrant(_))
        ));
        assert!(matches!(
            service.refresh(&pair.access_token, "client-1", None).await,
            Err(OAuthError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_fails_before_expiry() {
        let clock = MockClock::default();
        let service = service(&clock, false);
        let pair = service
            .issue_token_pair(
                "user-1",
                "client-1",
                &scopes("mcp.read"),
                IssueOptions {
                    include_refresh_token: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let refresh_token = pair.refresh_token.unwrap();
        let jti = service.codec().verify(&refresh_token, None).unwrap().jti;

        assert!(service.revoke(&jti).await.unwrap());
        assert!(matches!(
            service.refresh(&refresh_token, "client-1", None).await,
            Err(OAuthError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_refresh_token_fails() {
        let clock = MockClock::default();
        let service = service(&clock, false);
        let pair = service
            .issue_token_pair(
                "user-1",
                "client-1",
                &scopes("mcp.read"),
                IssueOptions {
                    include_refresh_token: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        clock.advance(Duration::days(31));
        assert!(service
            .refresh(&pair.refresh_token.unwrap(), "client-1", None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rotation_replaces_refresh_token() {
        let clock = MockClock::default();
        let service = service(&clock, true);
        let pair = service
            .issue_token_pair(
                "user-1",
                "client-1",
                &scopes("mcp.read"),
                IssueOptions {
                    include_refresh_token: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let first = pair.refresh_token.unwrap();

        let rotated = service.refresh(&first, "client-1", None).await.unwrap();
        let second = rotated.refresh_token.unwrap();
        assert_ne!(first, second);

        assert!(service.refresh(&first, "client-1", None).await.is_err());
        assert!(service.refresh(&second, "client-1", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_introspection_and_revocation() {
        let clock = MockClock::default();
        let service = service(&clock, false);
        let pair = service
            .issue_token_pair(
                "user-1",
                "client-1",
                &scopes("mcp.read"),
                IssueOptions {
                    include_refresh_token: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let refresh_token = pair.refresh_token.unwrap();

        let access = service.introspect(&pair.access_token).await.unwrap();
        assert!(access.active);
        assert_eq!(access.scope.as_deref(), Some("mcp.read"));
        assert_eq!(access.aud, Some(json!(RESOURCE)));

        assert!(service.introspect(&refresh_token).await.unwrap().active);
        assert!(!service.revoke_token(&refresh_token, "client-2").await.unwrap());
        assert!(service.revoke_token(&refresh_token, "client-1").await.unwrap());
        assert!(!service.introspect(&refresh_token).await.unwrap().active);

        assert!(!service.introspect("garbage").await.unwrap().active);
        clock.advance(Duration::minutes(20));
        assert!(!service.introspect(&pair.access_token).await.unwrap().active);
    }
}
