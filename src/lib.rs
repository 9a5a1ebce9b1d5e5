//! Cache layer for the AfrikMode marketplace backend.
//!
//! Build one [`cache::Cache`] at startup with [`cache::Cache::connect`] and
//! hand the `Arc<Cache>` to whatever needs it.

pub mod cache;

pub use cache::{Cache, CacheConfig, CacheError, CacheStatus};
