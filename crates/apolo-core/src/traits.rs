//! Common traits for storage backends and catalog entities
//!
//! Defines the key/value abstraction every store is built on and the
//! identity of the catalog entity kinds.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::AppError;
use crate::models::{
    ActionGroup, ActionPlan, ActionTriggerGroup, Cdr, DestinationRate, Rate, RatingPlan,
    RatingProfile, SharedGroup, Timing,
};

/// Key/value storage with sets and lists
///
/// Values are JSON strings; keys are built by the store's key helpers.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get value by key
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    /// Set value
    async fn set(&self, key: &str, value: &str) -> Result<(), AppError>;

    /// Set value only when the key is absent, returns true when written
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, AppError>;

    /// Delete value by key
    async fn delete(&self, key: &str) -> Result<bool, AppError>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool, AppError>;

    /// Keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, AppError>;

    /// Add to set
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, AppError>;

    /// Remove from set
    async fn srem(&self, key: &str, member: &str) -> Result<bool, AppError>;

    /// Set members, sorted
    async fn smembers(&self, key: &str) -> Result<Vec<String>, AppError>;

    /// Append to list
    async fn rpush(&self, key: &str, value: &str) -> Result<(), AppError>;

    /// Pop the list head
    async fn lpop(&self, key: &str) -> Result<Option<String>, AppError>;

    /// Check the backend is reachable
    async fn ping(&self) -> Result<(), AppError>;
}

/// A catalog entity addressed by tenant and key
pub trait CatalogEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Storage kind, used as the key prefix
    const KIND: &'static str;

    fn tenant(&self) -> &str;

    /// Key within the tenant
    fn key(&self) -> String;

    /// Reject entities that must not be stored
    fn validate(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Destination for call detail records
#[async_trait]
pub trait CdrSink: Send + Sync {
    /// Store a record; an existing one is only replaced with `allow_update`
    async fn set_cdr(&self, cdr: &Cdr, allow_update: bool) -> Result<(), AppError>;
}

macro_rules! named_entity {
    ($ty:ty, $kind:expr) => {
        named_entity!($ty, $kind, |_entity: &$ty| Ok(()));
    };
    ($ty:ty, $kind:expr, $validate:expr) => {
        impl CatalogEntity for $ty {
            const KIND: &'static str = $kind;

            fn tenant(&self) -> &str {
                &self.tenant
            }

            fn key(&self) -> String {
                self.name.clone()
            }

            fn validate(&self) -> Result<(), AppError> {
                let check: fn(&$ty) -> Result<(), AppError> = $validate;
                check(self)
            }
        }
    };
}

named_entity!(Timing, "tim");
named_entity!(Rate, "rt");
named_entity!(DestinationRate, "dr");
named_entity!(RatingPlan, "rpl", RatingPlan::validate);
named_entity!(SharedGroup, "shg");
named_entity!(ActionGroup, "act");
named_entity!(ActionTriggerGroup, "atr", |group: &ActionTriggerGroup| {
    group.triggers.iter().try_for_each(|at| at.validate())
});
named_entity!(ActionPlan, "apl");

impl CatalogEntity for RatingProfile {
    const KIND: &'static str = "rpf";

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn key(&self) -> String {
        RatingProfile::profile_key(&self.direction, &self.category, &self.subject)
    }
}
