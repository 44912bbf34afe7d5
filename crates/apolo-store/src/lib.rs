//! Storage layer for the Apolo rating engine
//!
//! Everything persistent goes through the [`KvStore`] trait from apolo-core,
//! implemented by an in-process [`MemoryStore`] and a Redis-backed
//! [`RedisStore`]. On top of it:
//!
//! - [`Catalog`] - typed catalog cache, destination reverse index, action
//!   plan bindings and the task queue
//! - [`AccountStore`] - account persistence
//! - [`StoreCdrSink`] - CDR sink
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use apolo_store::{Catalog, CacheMode, MemoryStore};
//! use apolo_core::models::Timing;
//!
//! # tokio_test::block_on(async {
//! let catalog = Catalog::new(Arc::new(MemoryStore::new()), Duration::from_secs(5));
//! let missing = catalog.find::<Timing>("t1", "PEAK", CacheMode::UseCache).await.unwrap();
//! assert!(missing.is_none());
//! # });
//! ```

pub mod accounts;
pub mod bindings;
pub mod catalog;
pub mod cdrs;
pub mod keys;
pub mod memory;
pub mod redis_store;

use std::sync::Arc;

use apolo_core::config::StorageConfig;
use apolo_core::error::AppError;
use apolo_core::traits::KvStore;
use tracing::info;

pub use accounts::AccountStore;
pub use catalog::{CacheMode, Catalog};
pub use cdrs::StoreCdrSink;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Open the backend selected by `storage.backend`
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn KvStore>, AppError> {
    match config.backend.as_str() {
        "memory" => {
            info!("Using in-memory storage");
            Ok(Arc::new(MemoryStore::new()))
        }
        "redis" => {
            info!("Using Redis storage at {}", config.redis_url);
            let store = RedisStore::new(&config.redis_url).await?;
            store.ping().await?;
            Ok(Arc::new(store))
        }
        other => Err(AppError::Config(format!("unknown storage backend: {}", other))),
    }
}
