//! CDR sink backed by the key/value store

use std::sync::Arc;

use apolo_core::error::AppError;
use apolo_core::models::Cdr;
use apolo_core::traits::{CdrSink, KvStore};
use apolo_core::AppResult;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::keys;

#[derive(Clone)]
pub struct StoreCdrSink {
    store: Arc<dyn KvStore>,
}

impl StoreCdrSink {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get_cdr(&self, cdr_id: &str) -> AppResult<Option<Cdr>> {
        match self.store.get(&keys::cdr_key(cdr_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CdrSink for StoreCdrSink {
    async fn set_cdr(&self, cdr: &Cdr, allow_update: bool) -> Result<(), AppError> {
        let key = keys::cdr_key(&cdr.cdr_id);
        let json = serde_json::to_string(cdr)?;
        if allow_update {
            self.store.set(&key, &json).await?;
        } else if !self.store.set_nx(&key, &json).await? {
            warn!("Refusing to overwrite CDR {}", cdr.cdr_id);
            return Err(AppError::Storage(format!("cdr {} already exists", cdr.cdr_id)));
        }
        debug!("Stored CDR {}", cdr.cdr_id);
        Ok(())
    }
}
