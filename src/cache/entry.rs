//! Cache entry types

use std::time::{Duration, Instant};

/// An entry held by the in-memory fallback store
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  /// Encoded value, as produced by the facade's codec
  pub value: Vec<u8>,
  pub ttl: Option<Duration>,
  pub created_at: Instant,
  pub expires_at: Option<Instant>,
}

impl CacheEntry {
  pub fn new(key: String, value: Vec<u8>, ttl: Option<Duration>) -> Self {
    let now = Instant::now();
    Self {
      key,
      value,
      ttl,
      created_at: now,
      // A TTL too large to represent never expires in practice
      expires_at: ttl.and_then(|d| now.checked_add(d)),
    }
  }

  pub fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() >= exp)
      .unwrap_or(false)
  }

  pub fn ttl_remaining(&self) -> Option<Duration> {
    self
      .expires_at
      .and_then(|exp| exp.checked_duration_since(Instant::now()))
  }

  /// Approximate footprint in bytes
  pub fn size(&self) -> usize {
    self.key.len() + self.value.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_without_ttl_never_expires() {
    let entry = CacheEntry::new("k".to_string(), b"v".to_vec(), None);
    assert!(!entry.is_expired());
    assert_eq!(entry.ttl_remaining(), None);
    assert_eq!(entry.size(), 2);
  }

  #[test]
  fn test_entry_zero_ttl_is_expired() {
    let entry = CacheEntry::new("k".to_string(), b"v".to_vec(), Some(Duration::ZERO));
    assert!(entry.is_expired());
  }

  #[test]
  fn test_entry_ttl_remaining() {
    let entry = CacheEntry::new(
      "k".to_string(),
      b"v".to_vec(),
      Some(Duration::from_secs(30)),
    );
    let remaining = entry.ttl_remaining().unwrap();
    assert!(remaining <= Duration::from_secs(30));
    assert!(remaining > Duration::from_secs(29));
  }
}
