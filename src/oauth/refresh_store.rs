//! Refresh-token metadata keyed by the JWT `jti`.

use chrono::Duration;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::errors::StorageError;
use crate::oauth::types::RefreshTokenRecord;
use crate::storage::{Store, StoreExt};

fn refresh_key(token_id: &str) -> String {
    format!("refresh:{}", token_id)
}

#[derive(Clone)]
pub struct RefreshTokenStore {
    store: Arc<dyn Store>,
    clock: SharedClock,
    ttl: Duration,
}

impl RefreshTokenStore {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn create(
        &self,
        user_id: &str,
        client_id: &str,
        scopes: Vec<String>,
    ) -> Result<RefreshTokenRecord, StorageError> {
        let now = self.clock.now();
        let record = RefreshTokenRecord {
            token_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            scopes,
            created_at: now,
            expires_at: now + self.ttl,
            is_revoked: false,
        };
        self.save(&record).await?;
        Ok(record)
    }

    /// Look up a record. Expired records read as absent; revoked ones are returned as-is.
    pub async fn get(&self, token_id: &str) -> Result<Option<RefreshTokenRecord>, StorageError> {
        let record = self
            .store
            .get_json::<RefreshTokenRecord>(&refresh_key(token_id))
            .await?;
        Ok(record.filter(|record| record.expires_at > self.clock.now()))
    }

    /// Mark a record revoked. Returns false when no live record exists.
    pub async fn revoke(&self, token_id: &str) -> Result<bool, StorageError> {
        let Some(mut record) = self.get(token_id).await? else {
            return Ok(false);
        };
        if !record.is_revoked {
            record.is_revoked = true;
            self.save(&record).await?;
            tracing::info!(client_id = %record.client_id, "refresh token revoked");
        }
        Ok(true)
    }

    /// Supersede a record with a fresh one carrying the same grant.
    ///
    /// Only one concurrent caller can rotate a given record; the others get `None`.
    pub async fn rotate(&self, token_id: &str) -> Result<Option<RefreshTokenRecord>, StorageError> {
        let Some(mut previous) = self.get(token_id).await? else {
            return Ok(None);
        };
        if previous.is_revoked || !self.store.delete(&refresh_key(token_id)).await? {
            return Ok(None);
        }

        previous.is_revoked = true;
        self.save(&previous).await?;

        let next = self
            .create(&previous.user_id, &previous.client_id, previous.scopes.clone())
            .await?;
        Ok(Some(next))
    }

    async fn save(&self, record: &RefreshTokenRecord) -> Result<(), StorageError> {
        let ttl = record.expires_at - self.clock.now();
        self.store
            .set_json(&refresh_key(&record.token_id), record, Some(ttl))
            .await
    }
}
