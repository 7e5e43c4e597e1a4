//! Fixed-window attempt budgets for login and token requests.

use chrono::Duration;
use std::sync::Arc;

use crate::errors::OAuthError;
use crate::storage::Store;

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
    max_attempts: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, max_attempts: u64, window: Duration) -> Self {
        Self {
            store,
            max_attempts,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count an attempt for `identifier`, failing once the budget for the window is spent.
    pub async fn check(&self, identifier: &str) -> Result<(), OAuthError> {
        let attempts = self
            .store
            .increment(&format!("ratelimit:{}", identifier), self.window)
            .await?;

        if attempts > self.max_attempts {
            tracing::warn!(target: "security", identifier, attempts, "rate limit exceeded");
            return Err(OAuthError::TemporarilyUnavailable(
                "Too many attempts, try again later".to_string(),
            ));
        }
        Ok(())
    }

    /// Fail when `identifier` has already spent its budget, without counting this call.
    pub async fn ensure_allowed(&self, identifier: &str) -> Result<(), OAuthError> {
        let attempts = self
            .store
            .get(&format!("ratelimit:{}", identifier))
            .await?
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        if attempts >= self.max_attempts {
            tracing::warn!(target: "security", identifier, attempts, "rate limit exceeded");
            return Err(OAuthError::TemporarilyUnavailable(
                "Too many attempts, try again later".to_string(),
            ));
        }
        Ok(())
    }

    /// Count a failed attempt against `identifier`.
    pub async fn record_failure(&self, identifier: &str) -> Result<u64, OAuthError> {
        let attempts = self
            .store
            .increment(&format!("ratelimit:{}", identifier), self.window)
            .await?;
        Ok(attempts)
    }

    /// Forget the attempts recorded for `identifier`.
    pub async fn reset(&self, identifier: &str) -> Result<(), OAuthError> {
        self.store
            .delete(&format!("ratelimit:{}", identifier))
            .await?;
        Ok(())
    }
}
