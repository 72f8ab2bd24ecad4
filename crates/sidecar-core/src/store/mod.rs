//! Shared key-value store
//!
//! The store is the only state shared between sidecar processes. It backs
//! leader election (an atomic set-if-absent key with TTL), the presence and
//! drain sets, the gateway blacklist and the ephemeral-gateway hashes.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`] keeps everything in-process; used by tests and by
//!   single-node setups.
//! - `RedisStore` (feature `redis`) talks to a Redis server.

mod keys;
mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use keys::ClusterKeys;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Operations the sidecar needs from the shared store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a string key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string key, optionally with a TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically write a key only if it does not exist. Returns true when written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key of any type
    async fn delete(&self, key: &str) -> Result<()>;

    /// Add a member to a set. Returns true if it was not already present.
    async fn add_to_set(&self, set: &str, member: &str) -> Result<bool>;

    /// Remove a member from a set. Returns true if it was present.
    async fn remove_from_set(&self, set: &str, member: &str) -> Result<bool>;

    /// Check set membership
    async fn is_member_of_set(&self, set: &str, member: &str) -> Result<bool>;

    /// Read every member of a set
    async fn retrieve_set(&self, set: &str) -> Result<Vec<String>>;

    /// Write one field of a hash and (re)arm the TTL of the whole hash
    async fn hash_set(&self, key: &str, field: &str, value: &str, key_ttl: Duration) -> Result<()>;

    /// Remove one field of a hash
    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;
}
