//! Account store
//!
//! Accounts are stored whole as JSON under `acc:{tenant}:{name}`. Balance
//! dirty marks are transient and never persisted.

use std::sync::Arc;

use apolo_core::error::AppError;
use apolo_core::models::Account;
use apolo_core::traits::KvStore;
use apolo_core::AppResult;
use tracing::{debug, error, instrument};

use crate::keys;

#[derive(Clone)]
pub struct AccountStore {
    store: Arc<dyn KvStore>,
}

impl AccountStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Account by tenant and name, `None` when absent
    pub async fn find_account(&self, tenant: &str, name: &str) -> AppResult<Option<Account>> {
        let key = keys::account_key(tenant, name);
        let Some(json) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let account = serde_json::from_str(&json).map_err(|e| {
            error!("Failed to deserialize account {}: {}", key, e);
            AppError::Serialization(format!("{}: {}", key, e))
        })?;
        Ok(Some(account))
    }

    /// Account by tenant and name
    ///
    /// # Errors
    ///
    /// Returns `AppError::AccountNotFound` when the account does not exist
    pub async fn get_account(&self, tenant: &str, name: &str) -> AppResult<Account> {
        self.find_account(tenant, name)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(format!("{}:{}", tenant, name)))
    }

    #[instrument(skip(self, account), fields(account = %account.full_id()))]
    pub async fn set_account(&self, account: &Account) -> AppResult<()> {
        let json = serde_json::to_string(account)?;
        self.store
            .set(&keys::account_key(&account.tenant, &account.name), &json)
            .await?;
        debug!("Saved account");
        Ok(())
    }

    pub async fn remove_account(&self, tenant: &str, name: &str) -> AppResult<bool> {
        self.store.delete(&keys::account_key(tenant, name)).await
    }

    /// Account names of a tenant, sorted
    pub async fn account_names(&self, tenant: &str) -> AppResult<Vec<String>> {
        let prefix = format!("{}:{}:", keys::ACCOUNT_PREFIX, tenant);
        Ok(self
            .store
            .keys(&prefix)
            .await?
            .iter()
            .filter_map(|k| keys::suffix(k, &prefix).map(str::to_string))
            .collect())
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use apolo_core::models::Balance;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_account_round_trip() {
        let accounts = AccountStore::new(Arc::new(MemoryStore::new()));
        assert!(accounts
            .get_account("t1", "1001")
            .await
            .unwrap_err()
            .is_not_found());

        let mut acc = Account::new("t1", "1001");
        let mut b = Balance::new("minutes", dec!(60));
        b.dirty = true;
        acc.balance_map.insert("*voice".into(), vec![b]);
        accounts.set_account(&acc).await.unwrap();

        let loaded = accounts.get_account("t1", "1001").await.unwrap();
        assert_eq!(loaded.balances("*voice")[0].value, dec!(60));
        assert!(!loaded.has_dirty_balances());
        assert_eq!(accounts.account_names("t1").await.unwrap(), vec!["1001"]);

        assert!(accounts.remove_account("t1", "1001").await.unwrap());
        assert!(accounts.find_account("t1", "1001").await.unwrap().is_none());
        assert!(accounts.ping().await.is_ok());
    }
}
