//! Redis client used as the external cache store

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, RedisResult};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cache::config::CacheConfig;
use crate::cache::events::ConnectionEvent;
use crate::cache::store::{CacheStore, CacheStoreError};

/// `CacheStore` backed by an external Redis server.
///
/// The underlying `ConnectionManager` reconnects on its own after a dropped
/// link. This type only reports what it sees: connection-level failures are
/// pushed as `ConnectionEvent::Error` so the connection manager can degrade.
pub struct RedisProxyClient {
  connection: ConnectionManager,
  events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl RedisProxyClient {
  /// Open a connection and check that the server answers `PING`.
  ///
  /// No deadline is applied here; the caller races this against its own
  /// connect timeout.
  pub async fn connect(
    config: &CacheConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
  ) -> Result<Self, CacheStoreError> {
    let client = Client::open(config.connection_url())?;
    let manager_config =
      ConnectionManagerConfig::new().set_connection_timeout(config.connect_timeout());
    let connection = ConnectionManager::new_with_config(client, manager_config).await?;
    let _ = events.send(ConnectionEvent::Connected);

    let proxy = Self {
      connection,
      events,
    };
    proxy.ping().await?;
    Ok(proxy)
  }

  /// Convert a Redis result, reporting connection-level failures
  fn observe<T>(&self, result: RedisResult<T>) -> Result<T, CacheStoreError> {
    result.map_err(|e| {
      let err = CacheStoreError::from(e);
      if err.is_connection() {
        let _ = self.events.send(ConnectionEvent::Error(err.to_string()));
      }
      err
    })
  }
}

#[async_trait]
impl CacheStore for RedisProxyClient {
  fn name(&self) -> &'static str {
    "redis"
  }

  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let result: RedisResult<Option<Vec<u8>>> = conn.get(key).await;
    self.observe(result)
  }

  async fn set(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();

    let result: RedisResult<()> = match ttl {
      // PSETEX rejects 0, round sub-millisecond TTLs up
      Some(duration) => {
        let millis = (duration.as_millis() as u64).max(1);
        conn.pset_ex(key, value, millis).await
      }
      None => conn.set(key, value).await,
    };
    self.observe(result)
  }

  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let result: RedisResult<i64> = conn.del(key).await;
    self.observe(result).map(|n| n > 0)
  }

  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
    let mut conn = self.connection.clone();
    let result: RedisResult<bool> = conn.exists(key).await;
    self.observe(result)
  }

  async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let result: RedisResult<i64> = conn.pttl(key).await;
    // -2: missing key, -1: no expiry
    self
      .observe(result)
      .map(|ms| (ms >= 0).then(|| Duration::from_millis(ms as u64)))
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheStoreError> {
    let mut conn = self.connection.clone();
    let result: RedisResult<Vec<String>> = conn.keys(pattern).await;
    self.observe(result)
  }

  async fn flush(&self) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    let result = redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await;
    self.observe(result)
  }

  async fn dbsize(&self) -> Result<usize, CacheStoreError> {
    let mut conn = self.connection.clone();
    let result = redis::cmd("DBSIZE").query_async::<usize>(&mut conn).await;
    self.observe(result)
  }

  async fn ping(&self) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    let result = redis::cmd("PING").query_async::<()>(&mut conn).await;
    self.observe(result)
  }

  async fn close(&self) -> Result<(), CacheStoreError> {
    let mut conn = self.connection.clone();
    redis::cmd("QUIT")
      .query_async::<()>(&mut conn)
      .await
      .map_err(CacheStoreError::from)?;
    let _ = self.events.send(ConnectionEvent::Closed);
    Ok(())
  }
}
