//! Connection liveness events and state-change notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state of the external store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
  #[default]
  Disconnected,
  Connecting,
  Ready,
  /// Calls are served by the in-memory fallback
  Degraded,
}

impl std::fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectionState::Disconnected => write!(f, "disconnected"),
      ConnectionState::Connecting => write!(f, "connecting"),
      ConnectionState::Ready => write!(f, "ready"),
      ConnectionState::Degraded => write!(f, "degraded"),
    }
  }
}

/// Liveness notification pushed by the store client or the liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
  /// Socket established, not yet usable
  Connected,
  /// Store answered and accepts commands
  Ready,
  /// A call or probe failed at the connection level
  Error(String),
  /// The client is re-establishing its link
  Reconnecting,
  /// The link was closed
  Closed,
}

impl std::fmt::Display for ConnectionEvent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectionEvent::Connected => write!(f, "connected"),
      ConnectionEvent::Ready => write!(f, "ready"),
      ConnectionEvent::Error(msg) => write!(f, "error: {}", msg),
      ConnectionEvent::Reconnecting => write!(f, "reconnecting"),
      ConnectionEvent::Closed => write!(f, "closed"),
    }
  }
}

/// A state transition of the connection manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
  pub from: ConnectionState,
  pub to: ConnectionState,
  pub reason: Option<String>,
  pub changed_at: DateTime<Utc>,
}

impl StateChange {
  pub fn new(from: ConnectionState, to: ConnectionState, reason: Option<String>) -> Self {
    Self {
      from,
      to,
      reason,
      changed_at: Utc::now(),
    }
  }
}
