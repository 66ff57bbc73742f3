mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::error::StoreError;

/// The operations the pool core requires from the shared store.
///
/// Several processes may serve the same pool concurrently, so the store is
/// the single point of cross-process coordination. Two operations carry a
/// hard atomicity contract:
///
/// - [`hash_incr_by`](SharedStore::hash_incr_by) must be an atomic add on
///   the stored field, never read-modify-write in the client. Share
///   crediting relies on it: concurrent increments from different
///   processes must all be observed.
/// - [`hash_take`](SharedStore::hash_take) must atomically return the full
///   hash and remove it in one step. Round rotation relies on it: a credit
///   racing the rotation must land either in the returned snapshot or in
///   the fresh (empty) hash, never be lost between a read and a clear.
///
/// A Redis-backed implementation maps these to `HINCRBY` and to
/// `RENAME` + `HGETALL` + `DEL` (or a script). Everything else is plain
/// key/value, hash, sorted-set and expiry access.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List keys starting with the given prefix
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically add `delta` to a hash field, creating it at zero first.
    /// Returns the new value.
    async fn hash_incr_by(&self, key: &str, field: &str, delta: u64) -> Result<u64, StoreError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a hash field. Returns whether it existed.
    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Atomically read the whole hash and delete it in one step
    async fn hash_take(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn sorted_add(&self, key: &str, score: u64, member: &str) -> Result<(), StoreError>;

    /// Members with `min <= score <= max`, in score order
    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: u64,
        max: u64,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove members with `min <= score <= max`. Returns how many.
    async fn sorted_remove_range_by_score(
        &self,
        key: &str,
        min: u64,
        max: u64,
    ) -> Result<u64, StoreError>;

    /// Expire the key `ttl_secs` from now
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;
}
