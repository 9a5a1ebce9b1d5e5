//! The cache facade
//!
//! `Cache` is the only type the rest of the backend talks to. Each call asks
//! the connection manager whether the external store is usable and runs
//! against it or against the in-memory fallback. Store failures never reach
//! the caller: the call is logged and re-served by the fallback, which is
//! exactly what a disconnected cache would have answered.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::codec::{CodecError, ValueCodec};
use super::config::{CacheConfig, MAX_TTL};
use super::connection::ConnectionManager;
use super::events::{ConnectionState, StateChange};
use super::memory::{run_expiration_task, InMemoryCacheStore};
use super::store::{CacheStore, CacheStoreError};

/// Errors the facade reports to callers. Connectivity is never one of them.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("cache value could not be encoded: {0}")]
  Encode(#[from] CodecError),
}

/// Overall health as reported by `Cache::stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHealth {
  Connected,
  Disconnected,
  /// The store was reachable earlier in this process and is not now
  Error,
}

/// Which backend is serving calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  /// External store
  Store,
  /// In-memory fallback
  Degraded,
}

impl std::fmt::Display for CacheMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheMode::Store => write!(f, "store"),
      CacheMode::Degraded => write!(f, "degraded"),
    }
  }
}

/// Operational view of the cache. Not meant for correctness decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatus {
  pub status: CacheHealth,
  pub mode: CacheMode,
  pub state: ConnectionState,
  pub endpoint: Option<String>,
  pub codec: ValueCodec,
  pub last_error: Option<String>,
  pub since: DateTime<Utc>,
  pub hits: u64,
  pub misses: u64,
  pub fallback_keys: usize,
  /// Key count reported by the external store, when it is serving
  pub store_keys: Option<usize>,
}

impl CacheStatus {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

#[derive(Debug, Clone, Copy)]
enum Op {
  Get,
  Set,
  Del,
  Exists,
  Ttl,
  Keys,
  Flush,
}

impl Op {
  fn name(self) -> &'static str {
    match self {
      Op::Get => "get",
      Op::Set => "set",
      Op::Del => "del",
      Op::Exists => "exists",
      Op::Ttl => "ttl",
      Op::Keys => "keys",
      Op::Flush => "flush",
    }
  }
}

/// Writes served by the fallback while the store was unusable. The store
/// missed them, so its copies of these keys are stale once it is back.
#[derive(Debug, Default)]
struct OutageLog {
  flushed: bool,
  keys: HashSet<String>,
}

impl OutageLog {
  fn is_empty(&self) -> bool {
    !self.flushed && self.keys.is_empty()
  }

  fn record(&mut self, op: Op, key: &str) {
    match op {
      Op::Flush => {
        self.flushed = true;
        self.keys.clear();
      }
      Op::Set | Op::Del if !self.flushed => {
        self.keys.insert(key.to_string());
      }
      _ => {}
    }
  }

  fn merge(&mut self, other: OutageLog) {
    self.flushed |= other.flushed;
    if self.flushed {
      self.keys.clear();
    } else {
      self.keys.extend(other.keys);
    }
  }
}

/// Cache facade with transparent fallback
pub struct Cache {
  manager: Arc<ConnectionManager>,
  fallback: Arc<InMemoryCacheStore>,
  outage: Mutex<OutageLog>,
  codec: ValueCodec,
  default_ttl: Option<Duration>,
  hits: AtomicU64,
  misses: AtomicU64,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cache {
  /// Connect to the configured store and build the facade. Never fails.
  pub async fn connect(config: &CacheConfig) -> Arc<Self> {
    let manager = ConnectionManager::initialize(config).await;
    Self::with_manager(manager, config)
  }

  /// Build the facade around an existing connection manager.
  ///
  /// Background tasks (fallback sweep, fallback reset on reconnect) are only
  /// started when called inside a Tokio runtime.
  pub fn with_manager(manager: Arc<ConnectionManager>, config: &CacheConfig) -> Arc<Self> {
    let fallback = Arc::new(InMemoryCacheStore::new());
    let mut tasks = Vec::new();

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      if let Some(interval) = config.sweep_interval() {
        tasks.push(handle.spawn(run_expiration_task(fallback.clone(), interval)));
      }
      tasks.push(handle.spawn(run_fallback_reset(
        fallback.clone(),
        manager.subscribe(),
      )));
    }

    Arc::new(Self {
      manager,
      fallback,
      outage: Mutex::new(OutageLog::default()),
      codec: config.codec,
      default_ttl: config.default_ttl(),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      tasks: Mutex::new(tasks),
    })
  }

  pub fn manager(&self) -> &Arc<ConnectionManager> {
    &self.manager
  }

  pub fn codec(&self) -> ValueCodec {
    self.codec
  }

  /// Whether calls currently go to the external store
  pub fn is_connected(&self) -> bool {
    self.manager.is_connected()
  }

  /// Run `call` against the external store if it is usable, otherwise (or if
  /// it fails) against the fallback.
  async fn dispatch<T, F, Fut>(&self, op: Op, key: &str, call: F) -> T
  where
    T: Default,
    F: Fn(Arc<dyn CacheStore>) -> Fut,
    Fut: Future<Output = Result<T, CacheStoreError>>,
  {
    if let Some(store) = self.manager.active_store() {
      if self.replay_outage(&store).await {
        let name = store.name();
        match call(store).await {
          Ok(value) => return value,
          Err(e) => {
            tracing::warn!(
              "Cache {} on {} failed for key {:?}, serving from fallback: {}",
              op.name(),
              name,
              key,
              e
            );
            if e.is_connection() {
              self.manager.force_degraded(e.to_string());
            }
          }
        }
      }
    }

    self.outage.lock().record(op, key);
    let fallback: Arc<dyn CacheStore> = self.fallback.clone();
    match call(fallback).await {
      Ok(value) => value,
      Err(e) => {
        tracing::warn!(
          "Fallback cache {} failed for key {:?}: {}",
          op.name(),
          key,
          e
        );
        T::default()
      }
    }
  }

  /// Invalidate in the store whatever changed while it was unusable, so a
  /// delete or overwrite made during an outage is not undone by recovery.
  /// Returns false if the store failed, in which case the log is kept.
  async fn replay_outage(&self, store: &Arc<dyn CacheStore>) -> bool {
    let pending = {
      let mut log = self.outage.lock();
      if log.is_empty() {
        return true;
      }
      std::mem::take(&mut *log)
    };

    let result = if pending.flushed {
      store.flush().await
    } else {
      let mut result = Ok(());
      for key in &pending.keys {
        if let Err(e) = store.delete(key).await {
          result = Err(e);
          break;
        }
      }
      result
    };

    match result {
      Ok(()) => {
        tracing::info!(
          "Invalidated {} on {} after outage",
          if pending.flushed {
            "all keys".to_string()
          } else {
            format!("{} keys", pending.keys.len())
          },
          store.name()
        );
        true
      }
      Err(e) => {
        tracing::warn!("Cache store invalidation after outage failed: {}", e);
        if e.is_connection() {
          self.manager.force_degraded(e.to_string());
        }
        self.outage.lock().merge(pending);
        false
      }
    }
  }

  /// Read the raw encoded bytes stored under `key`
  pub async fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
    let value = self
      .dispatch(Op::Get, key, |store| async move { store.get(key).await })
      .await;

    if value.is_some() {
      self.hits.fetch_add(1, Ordering::Relaxed);
    } else {
      self.misses.fetch_add(1, Ordering::Relaxed);
    }
    value
  }

  /// Store raw bytes. `None` TTL means no expiry; TTLs above `MAX_TTL` are
  /// clamped.
  pub async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
    let ttl = ttl.map(|d| d.min(MAX_TTL));
    self
      .dispatch(Op::Set, key, |store| {
        let value = value.clone();
        async move { store.set(key, value, ttl).await.map(|()| true) }
      })
      .await
  }

  /// Read and decode a value. Misses, store errors and undecodable payloads
  /// all come back as `None`.
  pub async fn get<T>(&self, key: &str) -> Option<T>
  where
    T: DeserializeOwned,
  {
    let bytes = self.get_raw(key).await?;
    match self.codec.decode(&bytes) {
      Ok(value) => Some(value),
      Err(e) => {
        tracing::warn!("Discarding unreadable cache value for key {:?}: {}", key, e);
        None
      }
    }
  }

  /// Store a value with the configured default TTL
  pub async fn set<T>(&self, key: &str, value: &T) -> Result<bool, CacheError>
  where
    T: Serialize + ?Sized,
  {
    self.store_value(key, value, self.default_ttl).await
  }

  /// Store a value with an explicit TTL; `Duration::ZERO` means no expiry
  pub async fn set_with_ttl<T>(
    &self,
    key: &str,
    value: &T,
    ttl: Duration,
  ) -> Result<bool, CacheError>
  where
    T: Serialize + ?Sized,
  {
    self.store_value(key, value, non_zero(ttl)).await
  }

  async fn store_value<T>(
    &self,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
  ) -> Result<bool, CacheError>
  where
    T: Serialize + ?Sized,
  {
    let bytes = self.codec.encode(value)?;
    Ok(self.set_raw(key, bytes, ttl).await)
  }

  /// Return the cached value, or compute, store and return it.
  ///
  /// `ttl` of `None` uses the default TTL. Errors from `producer` are passed
  /// through untouched; a failed store write is only logged.
  pub async fn get_or_set<T, E, F, Fut>(
    &self,
    key: &str,
    ttl: Option<Duration>,
    producer: F,
  ) -> Result<T, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    if let Some(cached) = self.get(key).await {
      return Ok(cached);
    }

    let value = producer().await?;
    let ttl = match ttl {
      Some(ttl) => non_zero(ttl),
      None => self.default_ttl,
    };
    if let Err(e) = self.store_value(key, &value, ttl).await {
      tracing::warn!("Computed value for key {:?} was not cached: {}", key, e);
    }
    Ok(value)
  }

  /// Delete a key, returning whether it existed
  pub async fn del(&self, key: &str) -> bool {
    self
      .dispatch(Op::Del, key, |store| async move { store.delete(key).await })
      .await
  }

  pub async fn exists(&self, key: &str) -> bool {
    self
      .dispatch(Op::Exists, key, |store| async move { store.exists(key).await })
      .await
  }

  /// Remaining lifetime of a key; `None` for missing keys or keys without expiry
  pub async fn ttl(&self, key: &str) -> Option<Duration> {
    self
      .dispatch(Op::Ttl, key, |store| async move { store.ttl(key).await })
      .await
  }

  /// Keys matching a Redis-style glob pattern
  pub async fn keys(&self, pattern: &str) -> Vec<String> {
    self
      .dispatch(Op::Keys, pattern, |store| async move {
        store.keys(pattern).await
      })
      .await
  }

  /// Delete every key matching `pattern`, returning how many were removed
  pub async fn del_pattern(&self, pattern: &str) -> usize {
    let mut removed = 0;
    for key in self.keys(pattern).await {
      if self.del(&key).await {
        removed += 1;
      }
    }
    removed
  }

  /// Remove every key
  pub async fn flush_all(&self) -> bool {
    self
      .dispatch(Op::Flush, "*", |store| async move {
        store.flush().await.map(|()| true)
      })
      .await
  }

  pub async fn stats(&self) -> CacheStatus {
    let snapshot = self.manager.snapshot();

    let (status, mode) = match snapshot.state {
      ConnectionState::Ready => (CacheHealth::Connected, CacheMode::Store),
      _ if snapshot.ever_connected && snapshot.state != ConnectionState::Disconnected => {
        (CacheHealth::Error, CacheMode::Degraded)
      }
      _ => (CacheHealth::Disconnected, CacheMode::Degraded),
    };

    let store_keys = match self.manager.active_store() {
      Some(store) => store.dbsize().await.ok(),
      None => None,
    };

    CacheStatus {
      status,
      mode,
      state: snapshot.state,
      endpoint: self.manager.endpoint().map(String::from),
      codec: self.codec,
      last_error: snapshot.last_error,
      since: snapshot.since,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      fallback_keys: self.fallback.info().keys,
      store_keys,
    }
  }

  /// Stop background work and close the store connection. Never fails.
  pub async fn shutdown(&self) {
    for task in self.tasks.lock().drain(..) {
      task.abort();
    }
    self.manager.shutdown().await;
  }
}

impl Drop for Cache {
  fn drop(&mut self) {
    for task in self.tasks.get_mut().drain(..) {
      task.abort();
    }
  }
}

fn non_zero(ttl: Duration) -> Option<Duration> {
  (!ttl.is_zero()).then_some(ttl)
}

/// Clear the fallback whenever the external store comes back, so values
/// written during an outage cannot resurface stale during the next one.
async fn run_fallback_reset(
  fallback: Arc<InMemoryCacheStore>,
  mut changes: broadcast::Receiver<StateChange>,
) {
  loop {
    match changes.recv().await {
      Ok(change) if change.to == ConnectionState::Ready => {
        if fallback.flush().await.is_ok() {
          tracing::debug!("Cleared in-memory fallback after reconnect");
        }
      }
      Ok(_) => {}
      Err(broadcast::error::RecvError::Lagged(_)) => continue,
      Err(broadcast::error::RecvError::Closed) => break,
    }
  }
}
