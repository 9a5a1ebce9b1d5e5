//! Cache layer with graceful degradation
//!
//! Provides a single facade over:
//! - an external Redis store, used while it is reachable
//! - an in-memory fallback that serves every call otherwise
//! - a connection manager that decides between the two
//!
//! Callers never see connectivity errors; an unreachable store looks like a
//! cold cache.

mod codec;
pub mod config;
mod connection;
mod entry;
mod events;
mod facade;
mod memory;
pub mod proxy;
mod store;

pub use codec::{CodecError, ValueCodec};
pub use config::CacheConfig;
pub use connection::{ConnectionManager, ConnectionSnapshot};
pub use entry::CacheEntry;
pub use events::{ConnectionEvent, ConnectionState, StateChange};
pub use facade::{Cache, CacheError, CacheHealth, CacheMode, CacheStatus};
pub use memory::{run_expiration_task, InMemoryCacheStore};
pub use proxy::RedisProxyClient;
pub use store::{CacheStore, CacheStoreError, StoreStats};
