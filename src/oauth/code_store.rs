//! Single-use authorization codes.

use chrono::Duration;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::errors::StorageError;
use crate::oauth::client_registry::normalize_redirect_uri;
use crate::oauth::pkce::{self, CodeChallengeMethod};
use crate::oauth::types::{AuthorizationCode, generate_token};
use crate::storage::{Store, StoreExt};

fn code_key(code: &str) -> String {
    format!("code:{}", code)
}

/// Optional request parameters bound into an issued code
#[derive(Debug, Clone, Default)]
pub struct CodeBinding {
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
}

/// Issues codes and redeems them at most once.
#[derive(Clone)]
pub struct AuthorizationCodeStore {
    store: Arc<dyn Store>,
    clock: SharedClock,
    ttl: Duration,
}

impl AuthorizationCodeStore {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub async fn issue(
        &self,
        client_id: &str,
        user_id: &str,
        redirect_uri: &str,
        scopes: Vec<String>,
        binding: CodeBinding,
    ) -> Result<String, StorageError> {
        let now = self.clock.now();
        let code = generate_token();
        let code_challenge_method = binding
            .code_challenge
            .as_ref()
            .map(|_| binding.code_challenge_method.unwrap_or(CodeChallengeMethod::Plain));

        let record = AuthorizationCode {
            code: code.clone(),
            client_id: client_id.to_string(),
            user_id: user_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scopes,
            state: binding.state,
            code_challenge: binding.code_challenge,
            code_challenge_method,
            issued_at: now,
            expires_at: now + self.ttl,
        };

        self.store
            .set_json(&code_key(&code), &record, Some(self.ttl))
            .await?;
        tracing::debug!(client_id, "authorization code issued");
        Ok(code)
    }

    /// Redeem a code.
    ///
    /// Every check runs before the record is touched, so a failed attempt leaves the code
    /// redeemable. Only the caller whose delete actually removed the record gets it back,
    /// which keeps redemption at-most-once across concurrent requests and shared backends.
    pub async fn redeem(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<Option<AuthorizationCode>, StorageError> {
        let key = code_key(code);
        let Some(record) = self.store.get_json::<AuthorizationCode>(&key).await? else {
            return Ok(self.reject(client_id, "unknown or consumed code"));
        };

        if self.clock.now() >= record.expires_at {
            return Ok(self.reject(client_id, "expired code"));
        }
        if record.client_id != client_id {
            return Ok(self.reject(client_id, "client mismatch"));
        }
        if !redirect_uri_equal(&record.redirect_uri, redirect_uri) {
            return Ok(self.reject(client_id, "redirect_uri mismatch"));
        }

        match (&record.code_challenge, code_verifier) {
            (Some(challenge), Some(verifier)) => {
                let method = record
                    .code_challenge_method
                    .unwrap_or(CodeChallengeMethod::Plain);
                if !pkce::verify(verifier, challenge, method) {
                    return Ok(self.reject(client_id, "PKCE verification failed"));
                }
            }
            (Some(_), None) => return Ok(self.reject(client_id, "missing code_verifier")),
            (None, Some(_)) => return Ok(self.reject(client_id, "unexpected code_verifier")),
            (None, None) => {}
        }

        if !self.store.delete(&key).await? {
            return Ok(self.reject(client_id, "code redeemed concurrently"));
        }
        Ok(Some(record))
    }

    fn reject(&self, client_id: &str, reason: &str) -> Option<AuthorizationCode> {
        tracing::warn!(target: "security", client_id, reason, "authorization code redemption rejected");
        None
    }
}

fn redirect_uri_equal(stored: &str, presented: &str) -> bool {
    match (normalize_redirect_uri(stored), normalize_redirect_uri(presented)) {
        (Some(stored), Some(presented)) => stored == presented,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::storage::MemoryStore;
    use futures::future::join_all;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    fn code_store(clock: &MockClock) -> AuthorizationCodeStore {
        let clock: SharedClock = Arc::new(clock.clone());
        AuthorizationCodeStore::new(
            Arc::new(MemoryStore::with_clock(clock.clone())),
            clock,
            Duration::minutes(10),
        )
    }

    fn s256_binding() -> CodeBinding {
        CodeBinding {
            state: Some("xyz".to_string()),
            code_challenge: Some(pkce::s256_challenge(VERIFIER)),
            code_challenge_method: Some(CodeChallengeMethod::S256),
        }
    }

    async fn issue_c1(store: &AuthorizationCodeStore) -> String {
        store
            .issue("X", "user-1", "https://app/cb", vec!["mcp.read".to_string()], s256_binding())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_redeem_once() {
        let clock = MockClock::default();
        let store = code_store(&clock);
        let code = issue_c1(&store).await;

        let record = store
            .redeem(&code, "X", "https://app/cb", Some(VERIFIER))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.user_id, "user-1");
        assert_eq!(record.state.as_deref(), Some("xyz"));

        assert!(store
            .redeem(&code, "X", "https://app/cb", Some(VERIFIER))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_wrong_verifier_does_not_consume() {
        let clock = MockClock::default();
        let store = code_store(&clock);
        let code = issue_c1(&store).await;

        let mut near = VERIFIER.to_string();
        near.replace_range(0..1, "e");
        assert!(store.redeem(&code, "X", "https://app/cb", Some(&near)).await.unwrap().is_none());
        assert!(store.redeem(&code, "X", "https://app/cb", None).await.unwrap().is_none());

        assert!(store
            .redeem(&code, "X", "https://app/cb", Some(VERIFIER))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_binding_mismatches_fail() {
        let clock = MockClock::default();
        let store = code_store(&clock);
        let code = issue_c1(&store).await;

        assert!(store.redeem(&code, "Y", "https://app/cb", Some(VERIFIER)).await.unwrap().is_none());
        assert!(store.redeem(&code, "X", "https://app/cb/", Some(VERIFIER)).await.unwrap().is_none());
        assert!(store.redeem(&code, "X", "https://app/cb?x=1", Some(VERIFIER)).await.unwrap().is_none());
        assert!(store.redeem("not-a-code", "X", "https://app/cb", Some(VERIFIER)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected() {
        let clock = MockClock::default();
        let store = code_store(&clock);
        let code = issue_c1(&store).await;

        clock.advance(Duration::minutes(10));
        assert!(store
            .redeem(&code, "X", "https://app/cb", Some(VERIFIER))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_plain_challenge() {
        let clock = MockClock::default();
        let store = code_store(&clock);
        let binding = CodeBinding {
            code_challenge: Some("plain-verifier".to_string()),
            code_challenge_method: None,
            ..Default::default()
        };
        let code = store
            .issue("X", "user-1", "https://app/cb", vec![], binding)
            .await
            .unwrap();

        assert!(store.redeem(&code, "X", "https://app/cb", Some("plain-verifieR")).await.unwrap().is_none());
        let record = store
            .redeem(&code, "X", "https://app/cb", Some("plain-verifier"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.code_challenge_method, Some(CodeChallengeMethod::Plain));
    }

    #[tokio::test]
    async fn test_verifier_without_challenge_fails() {
        let clock = MockClock::default();
        let store = code_store(&clock);
        let code = store
            .issue("X", "user-1", "https://app/cb", vec![], CodeBinding::default())
            .await
            .unwrap();

        assert!(store.redeem(&code, "X", "https://app/cb", Some(VERIFIER)).await.unwrap().is_none());
        assert!(store.redeem(&code, "X", "https://app/cb", None).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redemption_has_single_winner() {
        let clock = MockClock::default();
        let store = code_store(&clock);
        let code = issue_c1(&store).await;

        let attempts = (0..16).map(|_| {
            let store = store.clone();
            let code = code.clone();
            tokio::spawn(async move {
                store
                    .redeem(&code, "X", "https://app/cb", Some(VERIFIER))
                    .await
                    .unwrap()
                    .is_some()
            })
        });

        let successes = join_all(attempts)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();
        assert_eq!(successes, 1);
    }
}
