//! Catalog store
//!
//! Typed, write-through cached access to catalog entities on top of a
//! [`KvStore`]. Entities are cached per `{kind}:{tenant}:{key}` as shared
//! immutable values; mutations go to storage first and only then invalidate
//! the cached copy. Keys known to be absent are remembered for a short
//! negative TTL so repeated misses stay off storage.
//!
//! The catalog also owns the destination reverse index (prefix code to
//! destination names), the action plan bindings and the task queue.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use apolo_core::error::AppError;
use apolo_core::filter::Filter;
use apolo_core::models::{Destination, RatingPlan, RatingProfile};
use apolo_core::traits::{CatalogEntity, KvStore};
use apolo_core::AppResult;
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument};

use crate::keys;

/// How a read interacts with the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve from cache, load and cache on miss
    #[default]
    UseCache,
    /// Read storage, leave the cache untouched
    SkipCache,
    /// Read storage and replace the cached entry
    Refresh,
}

enum Cached {
    Hit(Arc<dyn Any + Send + Sync>),
    Miss(Instant),
}

pub struct Catalog {
    store: Arc<dyn KvStore>,
    cache: RwLock<HashMap<String, Cached>>,
    negative_ttl: Duration,
    reverse_index: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl Catalog {
    pub fn new(store: Arc<dyn KvStore>, negative_ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            negative_ttl,
            reverse_index: RwLock::new(HashMap::new()),
        }
    }

    /// Underlying storage
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn cached<E: CatalogEntity>(&self, key: &str) -> Option<Result<Arc<E>, ()>> {
        let cache = self.cache.read();
        match cache.get(key)? {
            Cached::Hit(value) => Arc::clone(value).downcast::<E>().ok().map(Ok),
            Cached::Miss(at) if at.elapsed() < self.negative_ttl => Some(Err(())),
            Cached::Miss(_) => None,
        }
    }

    async fn load<E: CatalogEntity>(&self, key: &str) -> AppResult<Option<E>> {
        let Some(json) = self.store.get(key).await? else {
            return Ok(None);
        };
        let entity = serde_json::from_str::<E>(&json).map_err(|e| {
            error!("Failed to deserialize {}: {}", key, e);
            AppError::Serialization(format!("{}: {}", key, e))
        })?;
        Ok(Some(entity))
    }

    /// Entity by tenant and key, `None` when absent
    pub async fn find<E: CatalogEntity>(
        &self,
        tenant: &str,
        key: &str,
        mode: CacheMode,
    ) -> AppResult<Option<Arc<E>>> {
        let storage_key = keys::entity_key(E::KIND, tenant, key);
        if mode == CacheMode::UseCache {
            match self.cached::<E>(&storage_key) {
                Some(Ok(hit)) => return Ok(Some(hit)),
                Some(Err(())) => return Ok(None),
                None => {}
            }
        }

        let loaded = self.load::<E>(&storage_key).await?.map(Arc::new);
        if mode != CacheMode::SkipCache {
            let entry = match &loaded {
                Some(entity) => Cached::Hit(Arc::clone(entity) as Arc<dyn Any + Send + Sync>),
                None => Cached::Miss(Instant::now()),
            };
            self.cache.write().insert(storage_key, entry);
        }
        Ok(loaded)
    }

    /// Entity by tenant and key
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when the entity does not exist
    pub async fn get<E: CatalogEntity>(
        &self,
        tenant: &str,
        key: &str,
        mode: CacheMode,
    ) -> AppResult<Arc<E>> {
        self.find::<E>(tenant, key, mode)
            .await?
            .ok_or_else(|| AppError::NotFound(keys::entity_key(E::KIND, tenant, key)))
    }

    /// Persist an entity, then drop its cached copy
    #[instrument(skip(self, entity), fields(kind = E::KIND, key = %entity.key()))]
    pub async fn set<E: CatalogEntity>(&self, entity: &E) -> AppResult<()> {
        entity.validate()?;
        let storage_key = keys::entity_key(E::KIND, entity.tenant(), &entity.key());
        let json = serde_json::to_string(entity)?;
        self.store.set(&storage_key, &json).await?;
        self.cache.write().remove(&storage_key);
        debug!("Stored {}", storage_key);
        Ok(())
    }

    pub async fn remove<E: CatalogEntity>(&self, tenant: &str, key: &str) -> AppResult<bool> {
        let storage_key = keys::entity_key(E::KIND, tenant, key);
        let removed = self.store.delete(&storage_key).await?;
        self.cache.write().remove(&storage_key);
        Ok(removed)
    }

    /// Snapshot of the entities matching `filter`
    ///
    /// Entities are matched on their serialized fields. `tenant = None`
    /// walks every tenant.
    pub async fn iterate<E: CatalogEntity>(
        &self,
        tenant: Option<&str>,
        filter: &Filter,
    ) -> AppResult<Vec<Arc<E>>> {
        let prefix = match tenant {
            Some(t) => keys::entity_prefix(E::KIND, t),
            None => format!("{}:", E::KIND),
        };
        let mut out = Vec::new();
        for key in self.store.keys(&prefix).await? {
            let Some(entity) = self.load::<E>(&key).await? else {
                continue;
            };
            if !filter.is_empty() && !filter.matches(&serde_json::to_value(&entity)?) {
                continue;
            }
            out.push(Arc::new(entity));
        }
        Ok(out)
    }

    /// Load every rating plan and profile of `tenants` into the cache
    ///
    /// An empty tenant list loads all tenants.
    #[instrument(skip(self))]
    pub async fn precache(&self, tenants: &[String]) -> AppResult<usize> {
        let mut count = 0;
        let scopes: Vec<Option<&str>> = if tenants.is_empty() {
            vec![None]
        } else {
            tenants.iter().map(|t| Some(t.as_str())).collect()
        };
        let all = Filter::default();
        for scope in scopes {
            for plan in self.iterate::<RatingPlan>(scope, &all).await? {
                self.cache_entity(plan);
                count += 1;
            }
            for profile in self.iterate::<RatingProfile>(scope, &all).await? {
                self.cache_entity(profile);
                count += 1;
            }
        }
        info!("Precached {} rating entities", count);
        Ok(count)
    }

    fn cache_entity<E: CatalogEntity>(&self, entity: Arc<E>) {
        let storage_key = keys::entity_key(E::KIND, entity.tenant(), &entity.key());
        self.cache
            .write()
            .insert(storage_key, Cached::Hit(entity as Arc<dyn Any + Send + Sync>));
    }

    /// Drop every cached entity and destination lookup
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        self.reverse_index.write().clear();
    }

    // ==================== Destinations ====================

    /// Bind a prefix code to a destination name
    pub async fn set_destination(&self, dest: &Destination) -> AppResult<()> {
        self.store
            .sadd(&keys::destination_key(&dest.tenant, &dest.name), &dest.code)
            .await?;
        let reverse_key = keys::reverse_destination_key(&dest.tenant, &dest.code);
        self.store.sadd(&reverse_key, &dest.name).await?;
        self.reverse_index.write().remove(&reverse_key);
        Ok(())
    }

    /// Replace every code bound to `name`
    pub async fn replace_destination(&self, tenant: &str, name: &str, codes: &[String]) -> AppResult<()> {
        self.remove_destinations(tenant, None, Some(name)).await?;
        for code in codes {
            self.set_destination(&Destination::new(tenant, code, name))
                .await?;
        }
        Ok(())
    }

    /// Unbind codes from names
    ///
    /// With both parts the single pair is removed; with only a name every
    /// code of that name; with only a code every name of that code.
    pub async fn remove_destinations(
        &self,
        tenant: &str,
        code: Option<&str>,
        name: Option<&str>,
    ) -> AppResult<()> {
        let pairs: Vec<(String, String)> = match (code, name) {
            (Some(c), Some(n)) => vec![(c.to_string(), n.to_string())],
            (None, Some(n)) => self
                .destination_codes(tenant, n)
                .await?
                .into_iter()
                .map(|c| (c, n.to_string()))
                .collect(),
            (Some(c), None) => self
                .store
                .smembers(&keys::reverse_destination_key(tenant, c))
                .await?
                .into_iter()
                .map(|n| (c.to_string(), n))
                .collect(),
            (None, None) => {
                return Err(AppError::MandatoryMissing("destination code or name".to_string()))
            }
        };
        for (c, n) in pairs {
            self.store.srem(&keys::destination_key(tenant, &n), &c).await?;
            let reverse_key = keys::reverse_destination_key(tenant, &c);
            self.store.srem(&reverse_key, &n).await?;
            self.reverse_index.write().remove(&reverse_key);
        }
        Ok(())
    }

    /// Codes bound to a destination name
    pub async fn destination_codes(&self, tenant: &str, name: &str) -> AppResult<Vec<String>> {
        self.store
            .smembers(&keys::destination_key(tenant, name))
            .await
    }

    /// Destination names bound to a prefix code, cached until the next update
    pub async fn destination_names(&self, tenant: &str, code: &str) -> AppResult<Arc<Vec<String>>> {
        let reverse_key = keys::reverse_destination_key(tenant, code);
        if let Some(names) = self.reverse_index.read().get(&reverse_key) {
            return Ok(Arc::clone(names));
        }
        let names = Arc::new(self.store.smembers(&reverse_key).await?);
        self.reverse_index
            .write()
            .insert(reverse_key, Arc::clone(&names));
        Ok(names)
    }
}
