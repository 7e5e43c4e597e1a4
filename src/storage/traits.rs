//! Key-value storage contract shared by every stateful OAuth component.
//!
//! Authorization codes, refresh-token records, sessions, clients, and rate-limit
//! counters all live behind [`Store`], so a single-process deployment can use the
//! in-memory backend while a replicated deployment plugs in a shared one.

use async_trait::async_trait;
use chrono::Duration;
use serde::{Serialize, de::DeserializeOwned};

use crate::errors::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Minimal key-value contract with expiry.
///
/// Implementations must make `delete` linearizable: when several callers delete
/// the same key concurrently, exactly one of them observes `true`. Single-use
/// artifacts rely on that to guarantee at-most-once consumption.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a live value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value. `ttl` of `None` keeps it until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key, returning whether this call removed a live value.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Reset the time-to-live of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Increment a counter, creating it with `window` as its lifetime when absent.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64>;

    /// Drop expired entries. Backends with native expiry return zero.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Typed helpers layered over the string contract.
#[async_trait]
pub trait StoreExt: Store {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
