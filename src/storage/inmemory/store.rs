//! In-memory [`Store`] backed by a concurrent map.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::clock::{SharedClock, system_clock};
use crate::errors::StorageError;
use crate::storage::traits::{Result, Store};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Process-local store for development, tests, and single-replica deployments.
///
/// Every operation on a key runs under that key's shard lock, which makes
/// `delete` and `increment` atomic per key. Expiry is judged against the
/// injected clock.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn deadline(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| self.clock.now() + ttl)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        if ttl.is_some_and(|ttl| ttl <= Duration::zero()) {
            self.entries.remove(key);
            return Ok(());
        }
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: self.deadline(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| !stored.is_expired(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        let now = self.clock.now();
        let fresh = || StoredValue {
            value: "1".to_string(),
            expires_at: Some(now + window),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh());
                    return Ok(1);
                }
                let current: u64 = occupied.get().value.parse().map_err(|_| {
                    StorageError::InvalidData(format!("counter {} is not numeric", key))
                })?;
                let next = current.saturating_add(1);
                occupied.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                Ok(1)
            }
        }
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::Arc;

    fn store_with_clock() -> (MemoryStore, MockClock) {
        let clock = MockClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let (store, _) = store_with_clock();

        store.set("code:abc", "value", None).await.unwrap();
        assert_eq!(store.get("code:abc").await.unwrap().as_deref(), Some("value"));

        assert!(store.delete("code:abc").await.unwrap());
        assert!(!store.delete("code:abc").await.unwrap());
        assert!(store.get("code:abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire_with_clock() {
        let (store, clock) = store_with_clock();

        store
            .set("session:1", "data", Some(Duration::minutes(5)))
            .await
            .unwrap();
        clock.advance(Duration::minutes(4));
        assert!(store.get("session:1").await.unwrap().is_some());

        clock.advance(Duration::minutes(1));
        assert!(store.get("session:1").await.unwrap().is_none());
        assert!(!store.delete("session:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_extends_lifetime() {
        let (store, clock) = store_with_clock();

        store
            .set("session:1", "data", Some(Duration::minutes(1)))
            .await
            .unwrap();
        assert!(store.expire("session:1", Duration::minutes(10)).await.unwrap());

        clock.advance(Duration::minutes(5));
        assert!(store.get("session:1").await.unwrap().is_some());
        assert!(!store.expire("missing", Duration::minutes(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_resets_after_window() {
        let (store, clock) = store_with_clock();
        let window = Duration::minutes(15);

        assert_eq!(store.increment("ratelimit:a", window).await.unwrap(), 1);
        assert_eq!(store.increment("ratelimit:a", window).await.unwrap(), 2);
        assert_eq!(store.increment("ratelimit:a", window).await.unwrap(), 3);

        clock.advance(window);
        assert_eq!(store.increment("ratelimit:a", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_counts_removed_entries() {
        let (store, clock) = store_with_clock();

        store
            .set("a", "1", Some(Duration::seconds(10)))
            .await
            .unwrap();
        store
            .set("b", "2", Some(Duration::seconds(60)))
            .await
            .unwrap();
        store.set("c", "3", None).await.unwrap();

        clock.advance(Duration::seconds(30));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_delete_has_single_winner() {
        let store = Arc::new(MemoryStore::new());
        store.set("code:race", "x", None).await.unwrap();

        let attempts = (0..32).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.delete("code:race").await.unwrap() })
        });

        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }
}
