//! In-memory storage implementation
//!
//! Suitable for development, testing, and single-process deployments. State is
//! not shared between replicas.

mod store;

pub use store::MemoryStore;
