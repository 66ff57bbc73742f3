use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use minepool_common::time::{get_current_time_in_millis, TimestampMillis};

use super::SharedStore;
use crate::core::error::StoreError;

/// In-process implementation of [`SharedStore`].
///
/// Used by tests and single-process deployments. All operations run under
/// one lock, which makes the atomicity contracts of the trait trivially
/// true. It cannot coordinate multiple processes; production pools point
/// the daemon at a network store instead.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    // (score, member) pairs; BTreeSet keeps them in score order
    sorted: HashMap<String, BTreeSet<(u64, String)>>,
    expirations: HashMap<String, TimestampMillis>,
}

impl Inner {
    /// Drop the key everywhere if its expiry has passed
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(at) = self.expirations.get(key) {
            if get_current_time_in_millis() >= *at {
                self.expirations.remove(key);
                self.strings.remove(key);
                self.hashes.remove(key);
                self.sorted.remove(key);
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.expirations.remove(key);
        inner.strings.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.expirations.remove(key);
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sorted.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.sorted.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: u64) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        let map = inner.hashes.entry(key.to_owned()).or_default();
        let current: u64 = map
            .get(field)
            .map(|v| v.parse())
            .transpose()
            .map_err(|e| StoreError::Backend(format!("field {} is not a counter: {}", field, e)))?
            .unwrap_or(0);
        let next = current.saturating_add(delta);
        map.insert(field.to_owned(), next.to_string());
        Ok(next)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).and_then(|m| m.get(field)).cloned())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        inner
            .hashes
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner
            .hashes
            .get_mut(key)
            .map(|m| m.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).map(|m| m.len()).unwrap_or(0))
    }

    async fn hash_take(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner.hashes.remove(key).unwrap_or_default())
    }

    async fn sorted_add(&self, key: &str, score: u64, member: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        inner
            .sorted
            .entry(key.to_owned())
            .or_default()
            .insert((score, member.to_owned()));
        Ok(())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: u64,
        max: u64,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        Ok(inner
            .sorted
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(score, _)| *score >= min && *score <= max)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sorted_remove_range_by_score(
        &self,
        key: &str,
        min: u64,
        max: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        inner.purge_if_expired(key);
        let Some(set) = inner.sorted.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(score, _)| *score < min || *score > max);
        Ok((before - set.len()) as u64)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.expirations.insert(
            key.to_owned(),
            get_current_time_in_millis() + ttl_secs * 1000,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_incr_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.hash_incr_by("h", "a", 5).await.unwrap(), 5);
        assert_eq!(store.hash_incr_by("h", "a", 7).await.unwrap(), 12);
        assert_eq!(store.hash_get("h", "a").await.unwrap().as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn test_hash_take_clears() {
        let store = MemoryStore::new();
        store.hash_set("h", "a", "1").await.unwrap();
        store.hash_set("h", "b", "2").await.unwrap();

        let taken = store.hash_take("h").await.unwrap();
        assert_eq!(taken.len(), 2);
        assert!(store.hash_get_all("h").await.unwrap().is_empty());

        // Taking an absent key yields an empty map
        assert!(store.hash_take("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sorted_range() {
        let store = MemoryStore::new();
        store.sorted_add("z", 10, "a").await.unwrap();
        store.sorted_add("z", 20, "b").await.unwrap();
        store.sorted_add("z", 30, "c").await.unwrap();

        let range = store.sorted_range_by_score("z", 15, 30).await.unwrap();
        assert_eq!(range, vec!["b".to_owned(), "c".to_owned()]);

        let removed = store.sorted_remove_range_by_score("z", 0, 20).await.unwrap();
        assert_eq!(removed, 2);
        let rest = store.sorted_range_by_score("z", 0, u64::MAX).await.unwrap();
        assert_eq!(rest, vec!["c".to_owned()]);
    }

    #[tokio::test]
    async fn test_expired_key_is_gone() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.expire("k", 0).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = MemoryStore::new();
        store.set("pool:a", "1").await.unwrap();
        store.hash_set("pool:b", "f", "1").await.unwrap();
        store.set("other", "1").await.unwrap();

        let keys = store.keys("pool:").await.unwrap();
        assert_eq!(keys, vec!["pool:a".to_owned(), "pool:b".to_owned()]);
    }
}
