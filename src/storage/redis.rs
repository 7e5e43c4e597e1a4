//! Redis-backed [`Store`] for deployments with more than one replica.

use async_trait::async_trait;
use chrono::Duration;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;

use crate::errors::StorageError;
use crate::storage::traits::{Result, Store};

/// Key prefix isolating this service inside a shared Redis database.
const KEY_PREFIX: &str = "authgate:";

/// Shared store over a pooled Redis connection.
///
/// Expiry is native to Redis, `DEL` reports how many keys it removed so only one
/// concurrent deleter wins, and counters use `INCR` with a TTL applied when the
/// window opens.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::ConnectionFailed(format!("Redis pool creation failed: {}", e)))?;
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("Redis connection failed: {}", e)))
    }

    fn key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.num_seconds().max(1) as u64
}

fn query_failed(op: &str, err: redis::RedisError) -> StorageError {
    tracing::error!(error = %err, op, "redis command failed");
    StorageError::QueryFailed(format!("Redis {} failed: {}", op, err))
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<String>>(Self::key(key))
            .await
            .map_err(|e| query_failed("GET", e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) if ttl <= Duration::zero() => {
                let _: i64 = conn
                    .del(Self::key(key))
                    .await
                    .map_err(|e| query_failed("DEL", e))?;
                Ok(())
            }
            Some(ttl) => conn
                .set_ex::<_, _, ()>(Self::key(key), value, ttl_seconds(ttl))
                .await
                .map_err(|e| query_failed("SETEX", e)),
            None => conn
                .set::<_, _, ()>(Self::key(key), value)
                .await
                .map_err(|e| query_failed("SET", e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .del(Self::key(key))
            .await
            .map_err(|e| query_failed("DEL", e))?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        conn.expire::<_, bool>(Self::key(key), ttl_seconds(ttl) as i64)
            .await
            .map_err(|e| query_failed("EXPIRE", e))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.connection().await?;
        let redis_key = Self::key(key);
        let count: u64 = conn
            .incr(&redis_key, 1u64)
            .await
            .map_err(|e| query_failed("INCR", e))?;
        if count == 1 {
            let _: bool = conn
                .expire(&redis_key, ttl_seconds(window) as i64)
                .await
                .map_err(|e| query_failed("EXPIRE", e))?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed() {
        assert_eq!(RedisStore::key("code:abc"), "authgate:code:abc");
    }

    #[test]
    fn test_ttl_never_rounds_to_zero() {
        assert_eq!(ttl_seconds(Duration::milliseconds(10)), 1);
        assert_eq!(ttl_seconds(Duration::minutes(2)), 120);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RedisStore::new("not a url").is_err());
    }
}
