use afrikmode_cache::cache::{Cache, CacheConfig};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "afrikcache", about = "AfrikMode cache operations", version)]
struct Args {
  /// YAML config file (defaults to ./afrikcache.yaml when present)
  #[arg(short, long)]
  config: Option<String>,
  /// Use the external store even if REDIS_ENABLED is unset
  #[arg(long)]
  store: bool,
  #[arg(short = 'H', long)]
  host: Option<String>,
  #[arg(short, long)]
  port: Option<u16>,
  #[arg(long)]
  password: Option<String>,
  #[arg(long)]
  db: Option<u8>,
  #[arg(long, default_value = "warn")]
  log_level: String,
  #[command(subcommand)]
  action: CacheAction,
}

#[derive(Subcommand)]
enum CacheAction {
  /// Get a value by key
  Get {
    /// The cache key
    key: String,
  },
  /// Set a value with optional TTL
  Set {
    /// The cache key
    key: String,
    /// The value to store (JSON; anything else is stored as a string)
    value: String,
    /// TTL in seconds (0 = no expiry, omitted = configured default)
    #[arg(short, long)]
    ttl: Option<u64>,
  },
  /// Delete a key
  Del {
    /// The cache key
    key: String,
  },
  /// Check whether a key exists
  Exists {
    /// The cache key
    key: String,
  },
  /// List keys matching a pattern
  Keys {
    /// Pattern to match (e.g., "product:*")
    #[arg(default_value = "*")]
    pattern: String,
  },
  /// Flush all keys
  Flush,
  /// Show connection and cache statistics
  Stats,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();

  // Config: explicit path > auto-detect > defaults, then env, then flags
  let mut config = if let Some(path) = &args.config {
    CacheConfig::from_file(path)?
  } else {
    CacheConfig::find_and_load()?.unwrap_or_default()
  };
  config.apply_lookup(|name| std::env::var(name).ok());

  if args.store {
    config.enabled = true;
  }
  if let Some(host) = args.host {
    config.host = host;
  }
  if let Some(port) = args.port {
    config.port = port;
  }
  if let Some(password) = args.password {
    config.password = Some(password);
  }
  if let Some(db) = args.db {
    config.database = db;
  }
  // One-shot process, no need for background probing
  config.health_check_interval = 0;
  config.sweep_interval = 0;

  let cache = Cache::connect(&config).await;
  let result = run(&cache, &args.action).await;
  cache.shutdown().await;
  result
}

async fn run(cache: &Cache, action: &CacheAction) -> Result<(), anyhow::Error> {
  match action {
    CacheAction::Get { key } => match cache.get::<serde_json::Value>(key).await {
      Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
      None => println!("(nil)"),
    },
    CacheAction::Set { key, value, ttl } => {
      let value: serde_json::Value =
        serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.clone()));
      let stored = match ttl {
        Some(secs) => {
          cache
            .set_with_ttl(key, &value, Duration::from_secs(*secs))
            .await?
        }
        None => cache.set(key, &value).await?,
      };
      println!("{}", if stored { "OK" } else { "(not stored)" });
    }
    CacheAction::Del { key } => println!("(integer) {}", cache.del(key).await as u8),
    CacheAction::Exists { key } => println!("(integer) {}", cache.exists(key).await as u8),
    CacheAction::Keys { pattern } => {
      let mut keys = cache.keys(pattern).await;
      keys.sort();
      if keys.is_empty() {
        println!("(empty array)");
      }
      for (i, key) in keys.iter().enumerate() {
        println!("{}) \"{}\"", i + 1, key);
      }
    }
    CacheAction::Flush => {
      cache.flush_all().await;
      println!("OK");
    }
    CacheAction::Stats => {
      let stats = cache.stats().await;
      println!("{}", serde_json::to_string_pretty(&stats)?);
    }
  }
  Ok(())
}
