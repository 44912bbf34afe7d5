//! Redis key/value backend
//!
//! Provides the shared storage implementation using Redis with connection
//! pooling. Values are JSON strings; destination indexes and plan bindings
//! use Redis sets and the task queue is a Redis list.
//!
//! # Example
//!
//! ```no_run
//! use apolo_store::RedisStore;
//! use apolo_core::traits::KvStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RedisStore::new("redis://127.0.0.1:6379").await?;
//!     store.set("acc:t1:1001", "{}").await?;
//!     assert!(store.exists("acc:t1:1001").await?);
//!     Ok(())
//! }
//! ```

use apolo_core::error::AppError;
use apolo_core::traits::KvStore;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use tracing::{debug, error, warn};

/// Redis store with connection pooling
///
/// Wraps a Redis ConnectionManager to provide efficient, multiplexed access
/// to Redis. All operations are async and return Results with AppError.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Create a new Redis store
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Errors
    ///
    /// Returns `AppError::StorageConnection` if the connection fails
    pub async fn new(url: &str) -> Result<Self, AppError> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::StorageConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::StorageConnection(format!("Connection failed: {}", e))
        })?;

        debug!("Redis connection established successfully");
        Ok(Self { manager })
    }

    /// Flush all keys from the current database
    ///
    /// # Warning
    ///
    /// This operation is destructive. Use only in tests.
    #[cfg(test)]
    pub async fn flush_db(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    /// Convert RedisError to AppError
    fn map_redis_error(err: RedisError) -> AppError {
        match err.kind() {
            redis::ErrorKind::IoError => {
                error!("Redis I/O error: {}", err);
                AppError::StorageConnection(format!("I/O error: {}", err))
            }
            redis::ErrorKind::TypeError => {
                warn!("Redis type error: {}", err);
                AppError::Storage(format!("Type mismatch: {}", err))
            }
            _ => {
                error!("Redis error: {}", err);
                AppError::Storage(err.to_string())
            }
        }
    }
}

/// Escape glob metacharacters so a key prefix matches literally
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        debug!("GET {}", key);
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(Self::map_redis_error)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        debug!("SET {}", key);
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await.map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, AppError> {
        debug!("SETNX {}", key);
        let mut conn = self.manager.clone();
        conn.set_nx(key, value).await.map_err(Self::map_redis_error)
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        debug!("DEL {}", key);
        let mut conn = self.manager.clone();
        let deleted: i32 = conn.del(key).await.map_err(Self::map_redis_error)?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        conn.exists(key).await.map_err(Self::map_redis_error)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        debug!("KEYS {}*", prefix);
        let mut conn = self.manager.clone();
        let mut keys: Vec<String> = redis::cmd("KEYS")
            .arg(glob_escape(prefix))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        keys.sort();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, AppError> {
        debug!("SADD {} {}", key, member);
        let mut conn = self.manager.clone();
        let added: i32 = conn
            .sadd(key, member)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, AppError> {
        debug!("SREM {} {}", key, member);
        let mut conn = self.manager.clone();
        let removed: i32 = conn
            .srem(key, member)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        let mut members: Vec<String> = conn.smembers(key).await.map_err(Self::map_redis_error)?;
        members.sort();
        Ok(members)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), AppError> {
        debug!("RPUSH {}", key);
        let mut conn = self.manager.clone();
        let _: i64 = conn.rpush(key, value).await.map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, AppError> {
        debug!("LPOP {}", key);
        let mut conn = self.manager.clone();
        conn.lpop(key, None).await.map_err(Self::map_redis_error)
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Redis ping failed: {}", e);
                AppError::StorageConnection(format!("Ping failed: {}", e))
            })?;
        Ok(())
    }
}
