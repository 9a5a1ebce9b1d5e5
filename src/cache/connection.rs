//! Lifecycle of the link to the external store
//!
//! Created once at startup. `initialize` makes a single connection attempt
//! bounded by the configured timeout; if that fails there is no client at all
//! and the manager stays `Degraded` until the process exits. After a successful
//! connect the manager only observes: liveness events move it between `Ready`
//! and `Degraded`, while reconnecting is left to the Redis client.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::config::CacheConfig;
use super::events::{ConnectionEvent, ConnectionState, StateChange};
use super::proxy::RedisProxyClient;
use super::store::CacheStore;

/// Point-in-time view of the connection, read under one lock
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
  pub state: ConnectionState,
  /// Whether the store was ever reachable in this process
  pub ever_connected: bool,
  pub last_error: Option<String>,
  /// When the current state was entered
  pub since: DateTime<Utc>,
}

struct Inner {
  state: ConnectionState,
  store: Option<Arc<dyn CacheStore>>,
  ever_connected: bool,
  last_error: Option<String>,
  since: DateTime<Utc>,
  closed: bool,
}

/// Owns the connection to the external store and tracks its health
pub struct ConnectionManager {
  inner: RwLock<Inner>,
  endpoint: Option<String>,
  close_timeout: Duration,
  changes: broadcast::Sender<StateChange>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
  fn new(endpoint: Option<String>, close_timeout: Duration) -> Self {
    let (changes, _) = broadcast::channel(64);
    Self {
      inner: RwLock::new(Inner {
        state: ConnectionState::Disconnected,
        store: None,
        ever_connected: false,
        last_error: None,
        since: Utc::now(),
        closed: false,
      }),
      endpoint,
      close_timeout,
      changes,
      tasks: Mutex::new(Vec::new()),
    }
  }

  /// Connect to the external store described by `config`.
  ///
  /// Never fails: a disabled store, a connection error or a timeout all leave
  /// the manager `Degraded`.
  pub async fn initialize(config: &CacheConfig) -> Arc<Self> {
    let timeout = config.connect_timeout();

    if !config.enabled {
      let manager = Arc::new(Self::new(None, timeout));
      manager.update(|_| {
        Some((
          ConnectionState::Degraded,
          Some("external store disabled".to_string()),
        ))
      });
      tracing::info!("Cache store disabled, serving from in-memory fallback");
      return manager;
    }

    let endpoint = config.endpoint();
    let manager = Arc::new(Self::new(Some(endpoint.clone()), timeout));
    manager.update(|_| Some((ConnectionState::Connecting, None)));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let attempt = RedisProxyClient::connect(config, events_tx);

    match tokio::time::timeout(timeout, attempt).await {
      Ok(Ok(proxy)) => {
        let store: Arc<dyn CacheStore> = Arc::new(proxy);
        manager.attach(store.clone());
        tracing::info!("Cache store connected at {}", endpoint);

        manager.spawn(run_event_loop(Arc::downgrade(&manager), events_rx));
        if let Some(interval) = config.health_check_interval() {
          manager.spawn(run_liveness_probe(
            Arc::downgrade(&manager),
            store,
            interval,
          ));
        }
      }
      Ok(Err(e)) => {
        manager.fail_initial(format!("connection to {} failed: {}", endpoint, e));
      }
      Err(_) => {
        manager.fail_initial(format!(
          "connection to {} timed out after {}ms",
          endpoint,
          timeout.as_millis()
        ));
      }
    }

    manager
  }

  /// Wrap an already-connected store, e.g. a test double
  pub fn with_store(store: Arc<dyn CacheStore>) -> Arc<Self> {
    let manager = Arc::new(Self::new(
      Some(store.name().to_string()),
      Duration::from_secs(5),
    ));
    manager.attach(store);
    manager
  }

  /// Like `with_store`, plus the liveness probe `initialize` runs for a real
  /// connection. The check only starts inside a Tokio runtime.
  pub fn with_monitored_store(store: Arc<dyn CacheStore>, interval: Duration) -> Arc<Self> {
    let manager = Self::with_store(store.clone());
    if tokio::runtime::Handle::try_current().is_ok() {
      manager.spawn(run_liveness_probe(
        Arc::downgrade(&manager),
        store,
        interval,
      ));
    }
    manager
  }

  fn attach(&self, store: Arc<dyn CacheStore>) {
    self.update(move |inner| {
      inner.store = Some(store);
      inner.ever_connected = true;
      Some((ConnectionState::Ready, None))
    });
  }

  fn fail_initial(&self, reason: String) {
    tracing::warn!(
      "Cache store unavailable, serving from in-memory fallback: {}",
      reason
    );
    self.update(move |inner| {
      inner.last_error = Some(reason.clone());
      Some((ConnectionState::Degraded, Some(reason)))
    });
  }

  fn spawn<F>(&self, task: F)
  where
    F: std::future::Future<Output = ()> + Send + 'static,
  {
    self.tasks.lock().push(tokio::spawn(task));
  }

  /// Apply a mutation and, if it returns a target state, move there.
  /// Transitions are logged and broadcast; same-state updates are silent.
  fn update<F>(&self, f: F)
  where
    F: FnOnce(&mut Inner) -> Option<(ConnectionState, Option<String>)>,
  {
    let mut inner = self.inner.write();
    let Some((to, reason)) = f(&mut *inner) else {
      return;
    };
    let from = inner.state;
    if from == to {
      return;
    }

    inner.state = to;
    inner.since = Utc::now();

    match (from, to) {
      (ConnectionState::Ready, ConnectionState::Degraded) => tracing::warn!(
        "Cache store connection lost ({}), serving from in-memory fallback",
        reason.as_deref().unwrap_or("unknown reason")
      ),
      (ConnectionState::Degraded, ConnectionState::Ready) => {
        tracing::info!("Cache store connection restored")
      }
      _ => tracing::debug!("Cache connection state {} -> {}", from, to),
    }

    let _ = self.changes.send(StateChange::new(from, to, reason));
  }

  /// Apply a liveness event from the store client
  pub fn handle_event(&self, event: ConnectionEvent) {
    use ConnectionState::*;

    self.update(|inner| {
      if inner.closed {
        return None;
      }
      let current = inner.state;
      match event {
        ConnectionEvent::Connected if current == Disconnected => Some((Connecting, None)),
        ConnectionEvent::Connected => None,
        // Without a client (initial connect failed) there is nothing to be ready
        ConnectionEvent::Ready if inner.store.is_some() => {
          inner.ever_connected = true;
          Some((Ready, None))
        }
        ConnectionEvent::Ready => None,
        ConnectionEvent::Error(msg) => {
          inner.last_error = Some(msg.clone());
          matches!(current, Ready | Connecting).then_some((Degraded, Some(msg)))
        }
        ConnectionEvent::Reconnecting => {
          (current == Ready).then(|| (Degraded, Some("reconnecting".to_string())))
        }
        ConnectionEvent::Closed => matches!(current, Ready | Connecting)
          .then(|| (Degraded, Some("connection closed".to_string()))),
      }
    });
  }

  /// Push the manager into `Degraded` as if the store had reported an error
  pub fn force_degraded(&self, reason: impl Into<String>) {
    self.handle_event(ConnectionEvent::Error(reason.into()));
  }

  pub fn state(&self) -> ConnectionState {
    self.inner.read().state
  }

  pub fn is_connected(&self) -> bool {
    let inner = self.inner.read();
    inner.state == ConnectionState::Ready && inner.store.is_some()
  }

  /// The external store, when it should be used for the next call
  pub fn active_store(&self) -> Option<Arc<dyn CacheStore>> {
    let inner = self.inner.read();
    if inner.state == ConnectionState::Ready {
      inner.store.clone()
    } else {
      None
    }
  }

  pub fn snapshot(&self) -> ConnectionSnapshot {
    let inner = self.inner.read();
    ConnectionSnapshot {
      state: inner.state,
      ever_connected: inner.ever_connected,
      last_error: inner.last_error.clone(),
      since: inner.since,
    }
  }

  /// `host:port` of the configured store, `None` when disabled
  pub fn endpoint(&self) -> Option<&str> {
    self.endpoint.as_deref()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
    self.changes.subscribe()
  }

  /// Stop background tasks and close the link. Best effort: failures are
  /// logged and the manager ends up `Disconnected` regardless.
  pub async fn shutdown(&self) {
    for task in self.tasks.lock().drain(..) {
      task.abort();
    }

    let store = {
      let mut inner = self.inner.write();
      inner.closed = true;
      inner.store.take()
    };

    if let Some(store) = store {
      match tokio::time::timeout(self.close_timeout, store.close()).await {
        Ok(Ok(())) => tracing::info!("Cache store connection closed"),
        Ok(Err(e)) => tracing::warn!("Cache store disconnect failed: {}", e),
        Err(_) => tracing::warn!(
          "Cache store disconnect timed out after {}ms",
          self.close_timeout.as_millis()
        ),
      }
    }

    self.update(|_| Some((ConnectionState::Disconnected, Some("shutdown".to_string()))));
  }
}

impl Drop for ConnectionManager {
  fn drop(&mut self) {
    for task in self.tasks.get_mut().drain(..) {
      task.abort();
    }
  }
}

/// Forward client events to the manager until either side goes away
async fn run_event_loop(
  manager: Weak<ConnectionManager>,
  mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
  while let Some(event) = events.recv().await {
    let Some(manager) = manager.upgrade() else {
      break;
    };
    manager.handle_event(event);
  }
}

/// Periodically ping the store so the manager notices when the client's own
/// reconnect succeeds or the link silently drops.
async fn run_liveness_probe(
  manager: Weak<ConnectionManager>,
  store: Arc<dyn CacheStore>,
  interval: Duration,
) {
  loop {
    tokio::time::sleep(interval).await;
    let Some(manager) = manager.upgrade() else {
      break;
    };

    if manager.state() == ConnectionState::Degraded {
      manager.handle_event(ConnectionEvent::Reconnecting);
    }
    match store.ping().await {
      Ok(()) => manager.handle_event(ConnectionEvent::Ready),
      Err(e) => {
        tracing::debug!("Cache liveness probe failed: {}", e);
        manager.handle_event(ConnectionEvent::Error(e.to_string()));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::memory::InMemoryCacheStore;

  fn connected() -> Arc<ConnectionManager> {
    ConnectionManager::with_store(Arc::new(InMemoryCacheStore::new()))
  }

  #[tokio::test]
  async fn test_disabled_store_is_degraded() {
    let manager = ConnectionManager::initialize(&CacheConfig::default()).await;
    assert_eq!(manager.state(), ConnectionState::Degraded);
    assert!(!manager.is_connected());
    assert!(manager.active_store().is_none());
    assert!(manager.endpoint().is_none());
  }

  #[test]
  fn test_error_after_connect_degrades() {
    let manager = connected();
    assert!(manager.is_connected());

    manager.handle_event(ConnectionEvent::Error("socket reset".to_string()));
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Degraded);
    assert!(snapshot.ever_connected);
    assert_eq!(snapshot.last_error.as_deref(), Some("socket reset"));
    assert!(manager.active_store().is_none());
  }

  #[test]
  fn test_ready_restores_connected_manager() {
    let manager = connected();
    manager.handle_event(ConnectionEvent::Reconnecting);
    assert_eq!(manager.state(), ConnectionState::Degraded);

    manager.handle_event(ConnectionEvent::Connected);
    assert_eq!(manager.state(), ConnectionState::Degraded);

    manager.handle_event(ConnectionEvent::Ready);
    assert_eq!(manager.state(), ConnectionState::Ready);
    assert!(manager.is_connected());
  }

  #[test]
  fn test_closed_degrades() {
    let manager = connected();
    manager.handle_event(ConnectionEvent::Closed);
    assert_eq!(manager.state(), ConnectionState::Degraded);
  }

  #[tokio::test]
  async fn test_ready_ignored_without_client() {
    let manager = ConnectionManager::initialize(&CacheConfig::default()).await;
    manager.handle_event(ConnectionEvent::Ready);
    assert_eq!(manager.state(), ConnectionState::Degraded);
  }

  #[tokio::test]
  async fn test_transitions_are_broadcast_once() {
    let manager = connected();
    let mut changes = manager.subscribe();

    manager.force_degraded("first");
    manager.force_degraded("second");
    manager.handle_event(ConnectionEvent::Ready);

    let first = changes.recv().await.unwrap();
    assert_eq!(first.from, ConnectionState::Ready);
    assert_eq!(first.to, ConnectionState::Degraded);
    assert_eq!(first.reason.as_deref(), Some("first"));

    let second = changes.recv().await.unwrap();
    assert_eq!(second.from, ConnectionState::Degraded);
    assert_eq!(second.to, ConnectionState::Ready);
    assert!(changes.try_recv().is_err());
    assert_eq!(manager.snapshot().last_error.as_deref(), Some("second"));
  }

  #[tokio::test]
  async fn test_shutdown_disconnects_and_ignores_later_events() {
    let manager = connected();
    manager.shutdown().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    manager.handle_event(ConnectionEvent::Connected);
    manager.handle_event(ConnectionEvent::Ready);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.active_store().is_none());
  }
}
