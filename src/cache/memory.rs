//! In-process fallback store
//!
//! Serves every cache call while the external store is unavailable. Expiry is
//! lazy: an expired entry is dropped the next time it is touched, and
//! `run_expiration_task` sweeps the rest periodically.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::entry::CacheEntry;
use super::store::{glob_to_regex, CacheStore, CacheStoreError, StoreStats};

/// In-memory cache store implementation
#[derive(Default)]
pub struct InMemoryCacheStore {
  data: RwLock<HashMap<String, CacheEntry>>,
  memory_used: AtomicUsize,
  expired: AtomicU64,
}

impl InMemoryCacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Drop every expired entry, returning how many were removed
  pub fn evict_expired(&self) -> usize {
    let mut data = self.data.write();
    let before = data.len();
    let mut freed = 0usize;
    data.retain(|_, entry| {
      if entry.is_expired() {
        freed += entry.size();
        false
      } else {
        true
      }
    });
    let count = before - data.len();

    self.memory_used.fetch_sub(freed, Ordering::Relaxed);
    self.expired.fetch_add(count as u64, Ordering::Relaxed);
    count
  }

  pub fn info(&self) -> StoreStats {
    let data = self.data.read();
    StoreStats {
      keys: data.values().filter(|e| !e.is_expired()).count(),
      memory_used: self.memory_used.load(Ordering::Relaxed),
      expired: self.expired.load(Ordering::Relaxed),
    }
  }

  fn remove_expired(&self, data: &mut HashMap<String, CacheEntry>, key: &str) {
    if let Some(entry) = data.remove(key) {
      self.memory_used.fetch_sub(entry.size(), Ordering::Relaxed);
      self.expired.fetch_add(1, Ordering::Relaxed);
    }
  }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
  fn name(&self) -> &'static str {
    "memory"
  }

  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
    {
      let data = self.data.read();
      match data.get(key) {
        None => return Ok(None),
        Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
        Some(_) => {}
      }
    }

    let mut data = self.data.write();
    // Re-check under the write lock, a concurrent set may have replaced it
    match data.get(key) {
      Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
      Some(_) => {
        self.remove_expired(&mut data, key);
        Ok(None)
      }
      None => Ok(None),
    }
  }

  async fn set(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let entry = CacheEntry::new(key.to_string(), value, ttl);
    let new_size = entry.size();

    let mut data = self.data.write();
    if let Some(old) = data.insert(key.to_string(), entry) {
      self.memory_used.fetch_sub(old.size(), Ordering::Relaxed);
    }
    self.memory_used.fetch_add(new_size, Ordering::Relaxed);
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut data = self.data.write();
    match data.remove(key) {
      Some(entry) => {
        self.memory_used.fetch_sub(entry.size(), Ordering::Relaxed);
        // An expired entry was already gone as far as callers can tell
        if entry.is_expired() {
          self.expired.fetch_add(1, Ordering::Relaxed);
          return Ok(false);
        }
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
    let data = self.data.read();
    Ok(data.get(key).map(|e| !e.is_expired()).unwrap_or(false))
  }

  async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError> {
    let data = self.data.read();
    Ok(
      data
        .get(key)
        .filter(|e| !e.is_expired())
        .and_then(|e| e.ttl_remaining()),
    )
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheStoreError> {
    let data = self.data.read();

    if pattern == "*" {
      return Ok(
        data
          .iter()
          .filter(|(_, e)| !e.is_expired())
          .map(|(k, _)| k.clone())
          .collect(),
      );
    }

    let Some(regex) = glob_to_regex(pattern) else {
      return Ok(Vec::new());
    };
    Ok(
      data
        .iter()
        .filter(|(k, e)| !e.is_expired() && regex.is_match(k))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }

  async fn flush(&self) -> Result<(), CacheStoreError> {
    let mut data = self.data.write();
    data.clear();
    self.memory_used.store(0, Ordering::Relaxed);
    Ok(())
  }

  async fn dbsize(&self) -> Result<usize, CacheStoreError> {
    let data = self.data.read();
    Ok(data.values().filter(|e| !e.is_expired()).count())
  }

  async fn ping(&self) -> Result<(), CacheStoreError> {
    Ok(())
  }
}

/// TTL expiration task
pub async fn run_expiration_task(store: Arc<InMemoryCacheStore>, interval: Duration) {
  loop {
    tokio::time::sleep(interval).await;
    let expired = store.evict_expired();
    if expired > 0 {
      tracing::debug!("Evicted {} expired fallback keys", expired);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_set_get_delete() {
    let store = InMemoryCacheStore::new();
    store.set("k", b"v".to_vec(), None).await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    assert!(store.delete("k").await.unwrap());
    assert!(!store.delete("k").await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_lazy_expiry_on_get() {
    let store = InMemoryCacheStore::new();
    store
      .set("k", b"v".to_vec(), Some(Duration::from_millis(20)))
      .await
      .unwrap();
    assert!(store.exists("k").await.unwrap());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!store.exists("k").await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), None);

    let stats = store.info();
    assert_eq!(stats.keys, 0);
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.memory_used, 0);
  }

  #[tokio::test]
  async fn test_delete_of_expired_entry_counts_as_expired() {
    let store = InMemoryCacheStore::new();
    store
      .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!store.delete("k").await.unwrap());
    let stats = store.info();
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.memory_used, 0);
  }

  #[tokio::test]
  async fn test_huge_ttl_does_not_overflow() {
    let store = InMemoryCacheStore::new();
    store
      .set("k", b"v".to_vec(), Some(Duration::from_secs(u64::MAX)))
      .await
      .unwrap();
    assert!(store.exists("k").await.unwrap());
    assert_eq!(store.ttl("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_evict_expired_sweeps_untouched_keys() {
    let store = InMemoryCacheStore::new();
    for i in 0..5 {
      store
        .set(
          &format!("short:{}", i),
          b"x".to_vec(),
          Some(Duration::from_millis(10)),
        )
        .await
        .unwrap();
    }
    store.set("long", b"x".to_vec(), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(store.evict_expired(), 5);
    assert_eq!(store.dbsize().await.unwrap(), 1);
    assert_eq!(store.keys("*").await.unwrap(), vec!["long".to_string()]);
  }

  #[tokio::test]
  async fn test_overwrite_tracks_memory() {
    let store = InMemoryCacheStore::new();
    store.set("k", vec![0u8; 100], None).await.unwrap();
    store.set("k", vec![0u8; 10], None).await.unwrap();
    assert_eq!(store.info().memory_used, 11);

    store.flush().await.unwrap();
    assert_eq!(store.info().memory_used, 0);
    assert_eq!(store.dbsize().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_ttl_reporting() {
    let store = InMemoryCacheStore::new();
    store
      .set("with", b"v".to_vec(), Some(Duration::from_secs(100)))
      .await
      .unwrap();
    store.set("without", b"v".to_vec(), None).await.unwrap();

    let ttl = store.ttl("with").await.unwrap().unwrap();
    assert!(ttl > Duration::from_secs(98) && ttl <= Duration::from_secs(100));
    assert_eq!(store.ttl("without").await.unwrap(), None);
    assert_eq!(store.ttl("missing").await.unwrap(), None);
  }
}
