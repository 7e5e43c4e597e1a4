//! Key-value storage abstraction with in-memory and Redis backends.

pub mod inmemory;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::MemoryStore;
pub use traits::*;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use crate::clock::SharedClock;
use crate::errors::StorageError;
use std::sync::Arc;

/// Storage backend configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    #[cfg(feature = "redis")]
    Redis(String),
}

/// Create a store for the configured backend
pub fn create_store(
    backend: StorageBackend,
    clock: SharedClock,
) -> std::result::Result<Arc<dyn Store>, StorageError> {
    match backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory store; state is not shared between replicas");
            Ok(Arc::new(MemoryStore::with_clock(clock)))
        }
        #[cfg(feature = "redis")]
        StorageBackend::Redis(redis_url) => Ok(Arc::new(RedisStore::new(&redis_url)?)),
    }
}

/// Parse storage backend from configuration string
pub fn parse_storage_backend(
    backend_name: &str,
    redis_url: Option<&str>,
) -> std::result::Result<StorageBackend, StorageError> {
    match backend_name {
        "memory" => Ok(StorageBackend::Memory),
        #[cfg(feature = "redis")]
        "redis" => {
            let url = redis_url.ok_or_else(|| {
                StorageError::InvalidData("REDIS_URL required for redis backend".to_string())
            })?;
            Ok(StorageBackend::Redis(url.to_string()))
        }
        #[cfg(not(feature = "redis"))]
        "redis" => {
            let _ = redis_url;
            Err(StorageError::UnsupportedBackend(
                "redis (built without the redis feature)".to_string(),
            ))
        }
        _ => Err(StorageError::UnsupportedBackend(backend_name.to_string())),
    }
}
