//! Cache configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::codec::ValueCodec;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax; unset variables expand to "".
fn expand_env_vars(input: &str) -> String {
  let mut result = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(pos) = rest.find('$') {
    result.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];

    if let Some(braced) = after.strip_prefix('{') {
      match braced.find('}') {
        Some(end) => {
          result.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
          rest = &braced[end + 1..];
          continue;
        }
        None => {
          // Unterminated, keep the remainder as written
          result.push_str(&rest[pos..]);
          return result;
        }
      }
    }

    let name_len = after
      .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
      .unwrap_or(after.len());
    if name_len > 0 {
      result.push_str(&std::env::var(&after[..name_len]).unwrap_or_default());
    } else {
      result.push('$');
    }
    rest = &after[name_len..];
  }

  result.push_str(rest);
  result
}

/// Longest TTL the cache will apply (100 years). Larger values are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Cache layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  /// Use the external store at all. When false every call is served in-process.
  #[serde(default)]
  pub enabled: bool,

  /// Redis host
  #[serde(default = "default_host")]
  pub host: String,

  /// Redis port
  #[serde(default = "default_port")]
  pub port: u16,

  /// Redis password (optional)
  #[serde(default)]
  pub password: Option<String>,

  /// Redis database number
  #[serde(default)]
  pub database: u8,

  /// Enable TLS
  #[serde(default)]
  pub tls_enabled: bool,

  /// Default TTL in seconds (0 = no expiry)
  #[serde(default = "default_ttl")]
  pub default_ttl: u64,

  /// Upper bound on the initial connection attempt, in milliseconds
  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  /// Seconds between liveness probes once connected (0 = no probe)
  #[serde(default = "default_health_check_interval")]
  pub health_check_interval: u64,

  /// Seconds between expired-entry sweeps of the fallback store (0 = lazy expiry only)
  #[serde(default = "default_sweep_interval")]
  pub sweep_interval: u64,

  /// Encoding used for cached values
  #[serde(default)]
  pub codec: ValueCodec,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_port() -> u16 {
  6379
}

fn default_ttl() -> u64 {
  3600 // 1 hour
}

fn default_connect_timeout_ms() -> u64 {
  5000
}

fn default_health_check_interval() -> u64 {
  5
}

fn default_sweep_interval() -> u64 {
  60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      host: default_host(),
      port: default_port(),
      password: None,
      database: 0,
      tls_enabled: false,
      default_ttl: default_ttl(),
      connect_timeout_ms: default_connect_timeout_ms(),
      health_check_interval: default_health_check_interval(),
      sweep_interval: default_sweep_interval(),
      codec: ValueCodec::default(),
    }
  }
}

impl CacheConfig {
  /// Build a configuration from the process environment
  pub fn from_env() -> Self {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  /// Build a configuration from an arbitrary variable lookup.
  ///
  /// Unset variables keep their defaults. Values that fail to parse are logged
  /// and also keep their defaults.
  pub fn from_lookup<F>(lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();
    config.apply_lookup(lookup);
    config
  }

  /// Override fields of an existing configuration from a variable lookup
  pub fn apply_lookup<F>(&mut self, lookup: F)
  where
    F: Fn(&str) -> Option<String>,
  {
    let read = |name: &str| {
      lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    };

    if let Some(v) = read("REDIS_ENABLED") {
      self.enabled = parse_or_keep("REDIS_ENABLED", &v, self.enabled, parse_bool);
    }
    if let Some(v) = read("REDIS_HOST") {
      self.host = v;
    }
    if let Some(v) = read("REDIS_PORT") {
      self.port = parse_or_keep("REDIS_PORT", &v, self.port, |s| s.parse().ok());
    }
    if let Some(v) = read("REDIS_PASSWORD") {
      self.password = Some(v);
    }
    if let Some(v) = read("REDIS_DB") {
      self.database = parse_or_keep("REDIS_DB", &v, self.database, |s| s.parse().ok());
    }
    if let Some(v) = read("REDIS_TLS") {
      self.tls_enabled = parse_or_keep("REDIS_TLS", &v, self.tls_enabled, parse_bool);
    }
    if let Some(v) = read("CACHE_DEFAULT_TTL") {
      self.default_ttl = parse_or_keep("CACHE_DEFAULT_TTL", &v, self.default_ttl, |s| {
        s.parse().ok()
      });
    }
    if let Some(v) = read("REDIS_CONNECT_TIMEOUT") {
      self.connect_timeout_ms = parse_or_keep(
        "REDIS_CONNECT_TIMEOUT",
        &v,
        self.connect_timeout_ms,
        |s| s.parse().ok(),
      );
    }
    if let Some(v) = read("REDIS_HEALTH_CHECK_INTERVAL") {
      self.health_check_interval = parse_or_keep(
        "REDIS_HEALTH_CHECK_INTERVAL",
        &v,
        self.health_check_interval,
        |s| s.parse().ok(),
      );
    }
    if let Some(v) = read("CACHE_SWEEP_INTERVAL") {
      self.sweep_interval = parse_or_keep("CACHE_SWEEP_INTERVAL", &v, self.sweep_interval, |s| {
        s.parse().ok()
      });
    }
    if let Some(v) = read("CACHE_CODEC") {
      self.codec = parse_or_keep("CACHE_CODEC", &v, self.codec, |s| {
        ValueCodec::from_str(s).ok()
      });
    }
  }

  /// Load configuration from a YAML file, expanding `$VAR` references
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    let expanded = expand_env_vars(&content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["afrikcache.yaml", "afrikcache.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading cache config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  /// Generate Redis connection URL
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", urlencoding::encode(pwd)),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }

  /// `host:port` of the external store, without credentials
  pub fn endpoint(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  /// TTL applied by `Cache::set` when none is given, capped at `MAX_TTL`
  pub fn default_ttl(&self) -> Option<Duration> {
    if self.default_ttl > 0 {
      Some(Duration::from_secs(self.default_ttl).min(MAX_TTL))
    } else {
      None
    }
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn health_check_interval(&self) -> Option<Duration> {
    (self.health_check_interval > 0).then(|| Duration::from_secs(self.health_check_interval))
  }

  pub fn sweep_interval(&self) -> Option<Duration> {
    (self.sweep_interval > 0).then(|| Duration::from_secs(self.sweep_interval))
  }
}

fn parse_bool(s: &str) -> Option<bool> {
  match s.to_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}

fn parse_or_keep<T, F>(name: &str, raw: &str, current: T, parse: F) -> T
where
  T: std::fmt::Debug,
  F: Fn(&str) -> Option<T>,
{
  match parse(raw) {
    Some(v) => v,
    None => {
      tracing::warn!("Ignoring invalid {}={:?}, keeping {:?}", name, raw, current);
      current
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name| map.get(name).cloned()
  }

  #[test]
  fn test_defaults() {
    let config = CacheConfig::default();
    assert!(!config.enabled);
    assert_eq!(config.host, "localhost");
    assert_eq!(config.port, 6379);
    assert_eq!(config.default_ttl(), Some(Duration::from_secs(3600)));
    assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    assert_eq!(config.codec, ValueCodec::Json);
  }

  #[test]
  fn test_from_lookup_overrides() {
    let config = CacheConfig::from_lookup(lookup(&[
      ("REDIS_ENABLED", "true"),
      ("REDIS_HOST", "cache.internal"),
      ("REDIS_PORT", "6380"),
      ("REDIS_PASSWORD", "s3cret"),
      ("REDIS_DB", "2"),
      ("CACHE_DEFAULT_TTL", "0"),
      ("REDIS_CONNECT_TIMEOUT", "250"),
      ("CACHE_CODEC", "msgpack"),
    ]));

    assert!(config.enabled);
    assert_eq!(config.host, "cache.internal");
    assert_eq!(config.port, 6380);
    assert_eq!(config.password.as_deref(), Some("s3cret"));
    assert_eq!(config.database, 2);
    assert_eq!(config.default_ttl(), None);
    assert_eq!(config.connect_timeout(), Duration::from_millis(250));
    assert_eq!(config.codec, ValueCodec::MessagePack);
  }

  #[test]
  fn test_invalid_values_keep_defaults() {
    let config = CacheConfig::from_lookup(lookup(&[
      ("REDIS_ENABLED", "maybe"),
      ("REDIS_PORT", "not-a-port"),
      ("CACHE_CODEC", "xml"),
      ("REDIS_HOST", "   "),
    ]));

    assert!(!config.enabled);
    assert_eq!(config.port, 6379);
    assert_eq!(config.codec, ValueCodec::Json);
    assert_eq!(config.host, "localhost");
  }

  #[test]
  fn test_connection_url() {
    let mut config = CacheConfig::default();
    assert_eq!(config.connection_url(), "redis://localhost:6379/0");

    config.password = Some("pw".to_string());
    config.tls_enabled = true;
    config.database = 3;
    assert_eq!(config.connection_url(), "rediss://:pw@localhost:6379/3");
    assert_eq!(config.endpoint(), "localhost:6379");
  }

  #[test]
  fn test_zero_intervals_disable_tasks() {
    let config = CacheConfig::from_lookup(lookup(&[
      ("REDIS_HEALTH_CHECK_INTERVAL", "0"),
      ("CACHE_SWEEP_INTERVAL", "0"),
    ]));
    assert_eq!(config.health_check_interval(), None);
    assert_eq!(config.sweep_interval(), None);
  }

  #[test]
  fn test_connection_url_encodes_password() {
    let config = CacheConfig {
      password: Some("p@ss/w#rd:1".to_string()),
      ..CacheConfig::default()
    };
    let url = config.connection_url();
    assert_eq!(url, "redis://:p%40ss%2Fw%23rd%3A1@localhost:6379/0");

    let info = redis::IntoConnectionInfo::into_connection_info(url.as_str()).unwrap();
    assert_eq!(info.redis.password.as_deref(), Some("p@ss/w#rd:1"));
    assert_eq!(info.redis.db, 0);
  }

  #[test]
  fn test_huge_default_ttl_is_clamped() {
    let config = CacheConfig {
      default_ttl: u64::MAX,
      ..CacheConfig::default()
    };
    assert_eq!(config.default_ttl(), Some(MAX_TTL));
  }

  #[test]
  fn test_expand_env_vars_keeps_non_ascii() {
    let out = expand_env_vars("# Lagos café cluster, prix $ 5\nhost: ${AFRIKCACHE_SURELY_UNSET_VAR}é");
    assert_eq!(out, "# Lagos café cluster, prix $ 5\nhost: é");
  }

  #[test]
  fn test_expand_env_vars_unterminated_brace() {
    assert_eq!(expand_env_vars("pw: ${ABC"), "pw: ${ABC");
  }

  #[test]
  fn test_expand_env_vars_unset() {
    let out = expand_env_vars("host: ${AFRIKCACHE_SURELY_UNSET_VAR}x");
    assert_eq!(out, "host: x");
  }
}
