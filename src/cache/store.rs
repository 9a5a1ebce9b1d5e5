//! Cache store abstraction
//!
//! `CacheStore` is the one interface both backends implement: the Redis client
//! and the in-memory fallback. The facade picks one per call and never needs to
//! know which it is talking to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store-level statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
  pub keys: usize,
  /// Approximate bytes held (0 when the store does not report it)
  pub memory_used: usize,
  /// Entries dropped because their TTL elapsed
  pub expired: u64,
}

/// Cache store trait
#[async_trait]
pub trait CacheStore: Send + Sync {
  /// Short backend name for logs and stats
  fn name(&self) -> &'static str;

  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError>;
  async fn set(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<(), CacheStoreError>;
  async fn delete(&self, key: &str) -> Result<bool, CacheStoreError>;
  async fn exists(&self, key: &str) -> Result<bool, CacheStoreError>;
  /// Remaining TTL; `None` when the key is missing or never expires
  async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError>;
  async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheStoreError>;
  async fn flush(&self) -> Result<(), CacheStoreError>;
  async fn dbsize(&self) -> Result<usize, CacheStoreError>;
  async fn ping(&self) -> Result<(), CacheStoreError>;

  /// Release the underlying connection, if any
  async fn close(&self) -> Result<(), CacheStoreError> {
    Ok(())
  }
}

/// Store operation error
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheStoreError {
  /// The store could not be reached or the link dropped mid-call
  #[error("connection error: {0}")]
  Connection(String),
  /// The store answered with an error
  #[error("command error: {0}")]
  Command(String),
  /// A stored payload could not be interpreted
  #[error("invalid value: {0}")]
  InvalidValue(String),
}

impl CacheStoreError {
  /// Whether the error says the store itself is unavailable
  pub fn is_connection(&self) -> bool {
    matches!(self, CacheStoreError::Connection(_))
  }
}

impl From<redis::RedisError> for CacheStoreError {
  fn from(e: redis::RedisError) -> Self {
    if e.is_io_error()
      || e.is_connection_dropped()
      || e.is_connection_refusal()
      || e.is_timeout()
      || e.is_unrecoverable_error()
    {
      CacheStoreError::Connection(e.to_string())
    } else {
      CacheStoreError::Command(e.to_string())
    }
  }
}

/// Convert a Redis-style glob pattern to a regex.
///
/// Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes. An empty
/// class matches nothing and yields `None`.
pub(crate) fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
  let mut regex_str = String::with_capacity(pattern.len() * 2);
  regex_str.push('^');

  let mut chars = pattern.chars().peekable();
  while let Some(c) = chars.next() {
    match c {
      '*' => regex_str.push_str(".*"),
      '?' => regex_str.push('.'),
      '\\' => push_escaped(&mut regex_str, chars.next().unwrap_or('\\')),
      '[' => {
        let negated = chars.next_if_eq(&'^').is_some();
        let mut class = String::new();
        // Unterminated classes run to the end of the pattern, as in Redis
        while let Some(c) = chars.next() {
          match c {
            ']' => break,
            '\\' => push_escaped(&mut class, chars.next().unwrap_or('\\')),
            '-' => class.push('-'),
            _ => push_escaped(&mut class, c),
          }
        }
        match (class.is_empty(), negated) {
          (true, false) => return None,
          (true, true) => regex_str.push('.'),
          (false, negated) => {
            regex_str.push('[');
            if negated {
              regex_str.push('^');
            }
            regex_str.push_str(&class);
            regex_str.push(']');
          }
        }
      }
      _ => push_escaped(&mut regex_str, c),
    }
  }

  regex_str.push('$');
  regex::Regex::new(&regex_str).ok()
}

fn push_escaped(out: &mut String, c: char) {
  let mut buf = [0u8; 4];
  out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}
