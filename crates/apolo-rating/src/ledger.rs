//! Unit-of-work state for debits
//!
//! A ledger holds every account a debit may touch (the caller plus the
//! members of its shared groups) together with their triggers. Balances are
//! addressed through [`BalanceRef`]s so shared-group debits never alias
//! another account's data. Only touched accounts are written back on commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use apolo_core::constants::MONETARY;
use apolo_core::models::{Account, ActionTrigger, Balance, BalanceRef, CounterEvent, SharedGroup};
use apolo_core::AppResult;
use apolo_store::{AccountStore, CacheMode, Catalog};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use crate::triggers::{load_triggers, QueuedTrigger};

pub struct Ledger {
    tenant: String,
    now: DateTime<Utc>,
    accounts: BTreeMap<String, Account>,
    triggers: BTreeMap<String, Arc<Vec<ActionTrigger>>>,
    shared_groups: BTreeMap<String, Arc<SharedGroup>>,
    touched: BTreeSet<String>,
    fired: Vec<QueuedTrigger>,
}

impl Ledger {
    pub fn new(tenant: &str, now: DateTime<Utc>) -> Self {
        Self {
            tenant: tenant.to_string(),
            now,
            accounts: BTreeMap::new(),
            triggers: BTreeMap::new(),
            shared_groups: BTreeMap::new(),
            touched: BTreeSet::new(),
            fired: Vec::new(),
        }
    }

    /// Load `names` with their triggers and every shared group they use
    ///
    /// Missing accounts are skipped; the caller decides whether that is an
    /// error.
    pub async fn load(
        catalog: &Catalog,
        accounts: &AccountStore,
        tenant: &str,
        names: &[String],
        now: DateTime<Utc>,
    ) -> AppResult<Self> {
        let mut ledger = Self::new(tenant, now);
        for name in names {
            if ledger.accounts.contains_key(name) {
                continue;
            }
            let Some(account) = accounts.find_account(tenant, name).await? else {
                debug!("Account {}:{} not found while loading ledger", tenant, name);
                continue;
            };
            let triggers = load_triggers(catalog, &account).await?;
            ledger.insert(account, triggers);
        }
        let groups: BTreeSet<String> = ledger
            .accounts
            .values()
            .flat_map(Account::shared_group_names)
            .collect();
        for group in groups {
            match catalog.find::<SharedGroup>(tenant, &group, CacheMode::UseCache).await? {
                Some(sg) => {
                    ledger.shared_groups.insert(group, sg);
                }
                None => warn!("Shared group {}:{} not found", tenant, group),
            }
        }
        Ok(ledger)
    }

    pub fn insert(&mut self, account: Account, triggers: Vec<ActionTrigger>) {
        self.triggers.insert(account.name.clone(), Arc::new(triggers));
        self.accounts.insert(account.name.clone(), account);
    }

    pub fn insert_shared_group(&mut self, group: Arc<SharedGroup>) {
        self.shared_groups.insert(group.name.clone(), group);
    }

    /// Copy for quoting: balances only, no trigger state
    pub fn dry_clone(&self) -> Self {
        Self {
            tenant: self.tenant.clone(),
            now: self.now,
            accounts: self
                .accounts
                .iter()
                .map(|(name, acc)| (name.clone(), acc.dry_clone()))
                .collect(),
            triggers: BTreeMap::new(),
            shared_groups: self.shared_groups.clone(),
            touched: BTreeSet::new(),
            fired: Vec::new(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn account(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    pub fn account_mut(&mut self, name: &str) -> Option<&mut Account> {
        self.touched.insert(name.to_string());
        self.accounts.get_mut(name)
    }

    pub fn take_account(&mut self, name: &str) -> Option<Account> {
        self.accounts.remove(name)
    }

    pub fn shared_group(&self, name: &str) -> Option<&SharedGroup> {
        self.shared_groups.get(name).map(Arc::as_ref)
    }

    pub fn balance(&self, bref: &BalanceRef) -> Option<&Balance> {
        self.accounts.get(&bref.account)?.balance(&bref.tor, &bref.uuid)
    }

    pub fn balance_mut(&mut self, bref: &BalanceRef) -> Option<&mut Balance> {
        let account = self.accounts.get_mut(&bref.account)?;
        self.touched.insert(bref.account.clone());
        account.balance_mut(&bref.tor, &bref.uuid)
    }

    /// Reference to the `*default` money balance of `account`, created when missing
    pub fn default_money(&mut self, account: &str) -> Option<BalanceRef> {
        let acc = self.accounts.get_mut(account)?;
        self.touched.insert(account.to_string());
        let uuid = acc.default_money_balance_mut().uuid.clone();
        Some(BalanceRef {
            account: account.to_string(),
            tor: MONETARY.to_string(),
            uuid,
        })
    }

    /// Feed the counters of `account` and evaluate its triggers
    ///
    /// Returns the unique ids of the triggers that fired; they are also
    /// queued for execution after commit.
    pub fn count(
        &mut self,
        account: &str,
        amount: Decimal,
        tor: &str,
        event: &CounterEvent,
        bref: Option<&BalanceRef>,
    ) -> Vec<String> {
        let balance = bref.and_then(|b| self.balance(b)).cloned();
        let triggers = self.triggers.get(account).cloned().unwrap_or_default();
        let now = self.now;
        let Some(acc) = self.accounts.get_mut(account) else {
            return Vec::new();
        };
        self.touched.insert(account.to_string());
        acc.count_units(amount, tor, event, balance.as_ref());
        let fired = acc.evaluate_triggers(&triggers, None, now);
        self.queue(account, &fired);
        fired
    }

    fn queue(&mut self, account: &str, fired: &[String]) {
        for unique_id in fired {
            self.fired.push(QueuedTrigger {
                tenant: self.tenant.clone(),
                account: account.to_string(),
                unique_id: unique_id.clone(),
            });
        }
    }

    /// Names of the accounts changed so far
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.touched.iter().map(String::as_str)
    }

    /// Evaluate balance triggers, round and save every touched account
    ///
    /// Every touched account is settled in memory before the first write.
    /// Writes stop at the first storage failure; the accounts already saved
    /// are logged with the error. Expired balances are dropped here, never
    /// while a debit is still walking.
    ///
    /// Returns the triggers fired during the unit of work, in firing order.
    pub async fn commit(mut self, store: &AccountStore, decimals: u32) -> AppResult<Vec<QueuedTrigger>> {
        let touched: Vec<String> = self.touched.iter().cloned().collect();
        let now = self.now;
        for name in &touched {
            let triggers = self.triggers.get(name).cloned().unwrap_or_default();
            let Some(account) = self.accounts.get_mut(name) else {
                continue;
            };
            let fired = account.evaluate_triggers(&triggers, None, now);
            account.remove_expired_balances(now);
            account.flush_balances(decimals);
            self.queue(name, &fired);
        }

        let mut written: Vec<&str> = Vec::with_capacity(touched.len());
        for name in &touched {
            let Some(account) = self.accounts.get(name) else {
                continue;
            };
            if let Err(e) = store.set_account(account).await {
                error!(
                    "Commit on {} failed at {} after saving {:?}: {}",
                    self.tenant, name, written, e
                );
                return Err(e);
            }
            written.push(name);
        }
        debug!("Committed {} accounts, {} triggers queued", written.len(), self.fired.len());
        Ok(self.fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apolo_core::filter::Filter;
    use apolo_core::models::ThresholdType;
    use apolo_core::traits::KvStore;
    use apolo_core::AppError;
    use async_trait::async_trait;
    use chrono::Duration;
    use apolo_core::utils::string_map;
    use apolo_store::MemoryStore;
    use rust_decimal_macros::dec;

    fn account_with_money(name: &str, value: Decimal) -> (Account, String) {
        let mut acc = Account::new("t1", name);
        let b = Balance::new("main", value);
        let uuid = b.uuid.clone();
        acc.balance_map.insert(MONETARY.to_string(), vec![b]);
        (acc, uuid)
    }

    #[tokio::test]
    async fn test_commit_saves_touched_only() {
        let store = AccountStore::new(Arc::new(MemoryStore::new()));
        let (rif, uuid) = account_with_money("rif", dec!(10));
        let (dan, _) = account_with_money("dan", dec!(5));
        let mut ledger = Ledger::new("t1", Utc::now());
        ledger.insert(rif, vec![]);
        ledger.insert(dan, vec![]);

        let bref = BalanceRef {
            account: "rif".into(),
            tor: MONETARY.into(),
            uuid,
        };
        ledger.balance_mut(&bref).unwrap().substract_value(dec!(2.1234567));
        assert_eq!(ledger.touched().collect::<Vec<_>>(), vec!["rif"]);
        ledger.commit(&store, 4).await.unwrap();

        let saved = store.get_account("t1", "rif").await.unwrap();
        assert_eq!(saved.balances(MONETARY)[0].value, dec!(7.8765));
        assert!(store.find_account("t1", "dan").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_count_queues_fired_triggers() {
        let store = AccountStore::new(Arc::new(MemoryStore::new()));
        let mut at = ActionTrigger::new("tr1", ThresholdType::MaxEventCounter, dec!(2), "TOPUP");
        at.tor = MONETARY.to_string();
        at.filter = Filter::default();
        let (mut rif, _) = account_with_money("rif", dec!(10));
        rif.init_counters(std::slice::from_ref(&at));
        rif.init_trigger_records(std::slice::from_ref(&at));

        let mut ledger = Ledger::new("t1", Utc::now());
        ledger.insert(rif, vec![at]);
        let event = CounterEvent {
            categories: string_map(&["call"]),
            ..Default::default()
        };
        assert!(ledger.count("rif", dec!(1), MONETARY, &event, None).is_empty());
        assert_eq!(ledger.count("rif", dec!(1), MONETARY, &event, None), vec!["tr1".to_string()]);

        let fired = ledger.commit(&store, 6).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].account, "rif");
        let saved = store.get_account("t1", "rif").await.unwrap();
        assert!(saved.trigger_records["tr1"].executed);
    }

    #[tokio::test]
    async fn test_expired_balances_dropped_on_commit() {
        let store = AccountStore::new(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        let (mut rif, _) = account_with_money("rif", dec!(10));
        let mut old = Balance::new("old", dec!(3));
        old.expiration_date = Some(now - Duration::hours(1));
        let old_ref = BalanceRef {
            account: "rif".into(),
            tor: MONETARY.into(),
            uuid: old.uuid.clone(),
        };
        rif.balance_map.get_mut(MONETARY).unwrap().push(old);

        let mut ledger = Ledger::new("t1", now);
        ledger.insert(rif, vec![]);
        ledger.count("rif", dec!(1), MONETARY, &CounterEvent::default(), None);
        assert!(ledger.balance(&old_ref).is_some());

        ledger.commit(&store, 6).await.unwrap();
        let saved = store.get_account("t1", "rif").await.unwrap();
        assert_eq!(saved.balances(MONETARY).len(), 1);
        assert_eq!(saved.balances(MONETARY)[0].id, "main");
    }

    /// Memory store refusing writes to keys containing `fail_on`
    struct FailingStore {
        inner: MemoryStore,
        fail_on: String,
    }

    #[async_trait]
    impl KvStore for FailingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
            if key.contains(&self.fail_on) {
                return Err(AppError::Storage(format!("write refused: {}", key)));
            }
            self.inner.set(key, value).await
        }
        async fn set_nx(&self, key: &str, value: &str) -> Result<bool, AppError> {
            self.inner.set_nx(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<bool, AppError> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool, AppError> {
            self.inner.exists(key).await
        }
        async fn keys(&self, prefix: &str) -> Result<Vec<String>, AppError> {
            self.inner.keys(prefix).await
        }
        async fn sadd(&self, key: &str, member: &str) -> Result<bool, AppError> {
            self.inner.sadd(key, member).await
        }
        async fn srem(&self, key: &str, member: &str) -> Result<bool, AppError> {
            self.inner.srem(key, member).await
        }
        async fn smembers(&self, key: &str) -> Result<Vec<String>, AppError> {
            self.inner.smembers(key).await
        }
        async fn rpush(&self, key: &str, value: &str) -> Result<(), AppError> {
            self.inner.rpush(key, value).await
        }
        async fn lpop(&self, key: &str) -> Result<Option<String>, AppError> {
            self.inner.lpop(key).await
        }
        async fn ping(&self) -> Result<(), AppError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_commit_stops_at_failed_write() {
        let store = AccountStore::new(Arc::new(FailingStore {
            inner: MemoryStore::new(),
            fail_on: ":rif".into(),
        }));
        let (rif, rif_uuid) = account_with_money("rif", dec!(10));
        let (dan, dan_uuid) = account_with_money("dan", dec!(5));
        let mut ledger = Ledger::new("t1", Utc::now());
        ledger.insert(rif, vec![]);
        ledger.insert(dan, vec![]);
        for (account, uuid) in [("rif", rif_uuid), ("dan", dan_uuid)] {
            let bref = BalanceRef {
                account: account.into(),
                tor: MONETARY.into(),
                uuid,
            };
            ledger.balance_mut(&bref).unwrap().substract_value(dec!(1));
        }

        let err = ledger.commit(&store, 6).await.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        let saved = store.get_account("t1", "dan").await.unwrap();
        assert_eq!(saved.balances(MONETARY)[0].value, dec!(4));
        assert!(store.find_account("t1", "rif").await.unwrap().is_none());
    }

    #[test]
    fn test_default_money_created() {
        let mut ledger = Ledger::new("t1", Utc::now());
        ledger.insert(Account::new("t1", "rif"), vec![]);
        let bref = ledger.default_money("rif").unwrap();
        assert_eq!(ledger.balance(&bref).unwrap().id, "*default");
        assert!(ledger.default_money("nobody").is_none());
    }
}
