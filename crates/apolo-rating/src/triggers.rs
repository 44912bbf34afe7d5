//! Trigger execution
//!
//! Debits and actions only mark triggers as fired; the [`TriggerProcessor`]
//! runs their action groups afterwards, one account at a time under the
//! guardian. Triggers fired while executing are appended to the queue and
//! drained breadth-first, bounded by [`RECURSION_MAX_DEPTH`] generations.

use std::sync::Arc;
use std::time::Duration;

use apolo_core::constants::RECURSION_MAX_DEPTH;
use apolo_core::filter::Filter;
use apolo_core::models::{Account, ActionGroup, ActionTrigger, ActionTriggerGroup, StatsSnapshot};
use apolo_core::utils::{concat_key, included_keys};
use apolo_core::{AppError, AppResult};
use apolo_store::{AccountStore, CacheMode, Catalog};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::actions::{ActionContext, ActionRuntime};
use crate::guardian::Guardian;

/// A fired account trigger waiting for its actions to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTrigger {
    pub tenant: String,
    pub account: String,
    pub unique_id: String,
}

/// Triggers of every group attached to `account`, heaviest first
///
/// Missing groups are skipped with a warning.
pub async fn load_triggers(catalog: &Catalog, account: &Account) -> AppResult<Vec<ActionTrigger>> {
    let mut triggers = Vec::new();
    for group_id in included_keys(&account.trigger_ids) {
        match catalog
            .find::<ActionTriggerGroup>(&account.tenant, &group_id, CacheMode::UseCache)
            .await?
        {
            Some(group) => triggers.extend(group.triggers.iter().cloned()),
            None => warn!("Trigger group {}:{} not found", account.tenant, group_id),
        }
    }
    triggers.sort_by(|a, b| b.weight.cmp(&a.weight));
    Ok(triggers)
}

pub struct TriggerProcessor {
    catalog: Arc<Catalog>,
    accounts: Arc<AccountStore>,
    guardian: Arc<Guardian>,
    runtime: Arc<ActionRuntime>,
    lock_timeout: Option<Duration>,
    decimals: u32,
}

impl TriggerProcessor {
    pub fn new(
        catalog: Arc<Catalog>,
        accounts: Arc<AccountStore>,
        guardian: Arc<Guardian>,
        runtime: Arc<ActionRuntime>,
        lock_timeout: Option<Duration>,
        decimals: u32,
    ) -> Self {
        Self {
            catalog,
            accounts,
            guardian,
            runtime,
            lock_timeout,
            decimals,
        }
    }

    pub fn runtime(&self) -> &Arc<ActionRuntime> {
        &self.runtime
    }

    /// Execute `queue` and everything it fires, breadth-first
    ///
    /// Failures are logged and do not stop the drain. Returns the number of
    /// trigger executions attempted.
    #[instrument(skip_all, fields(queued = queue.len()))]
    pub async fn drain(&self, queue: Vec<QueuedTrigger>) -> usize {
        let mut current = queue;
        let mut executed = 0;
        for depth in 0..RECURSION_MAX_DEPTH {
            if current.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for item in &current {
                executed += 1;
                match self.execute(item, Utc::now()).await {
                    Ok(fired) => next.extend(fired),
                    Err(e) => error!(
                        "Trigger {} on {}:{} failed: {}",
                        item.unique_id, item.tenant, item.account, e
                    ),
                }
            }
            debug!("Trigger generation {} fired {} more", depth, next.len());
            current = next;
        }
        if !current.is_empty() {
            warn!("Dropping {} triggers past the depth limit", current.len());
        }
        executed
    }

    /// Run the actions of one fired trigger
    ///
    /// The account is saved afterwards unless an action removed it. A failed
    /// action group, or a recurrent trigger, leaves the trigger ready to fire
    /// again.
    ///
    /// # Errors
    ///
    /// - `AppError::AccountNotFound` when the account vanished
    /// - `AppError::AccountDisabled` for disabled accounts
    /// - the first failing action's error, after the account is saved
    pub async fn execute(&self, item: &QueuedTrigger, now: DateTime<Utc>) -> AppResult<Vec<QueuedTrigger>> {
        let key = concat_key(&[&item.tenant, &item.account]);
        self.guardian
            .guard(&[key], self.lock_timeout, || self.execute_locked(item, now))
            .await
    }

    async fn execute_locked(&self, item: &QueuedTrigger, now: DateTime<Utc>) -> AppResult<Vec<QueuedTrigger>> {
        let mut account = self
            .accounts
            .find_account(&item.tenant, &item.account)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(concat_key(&[&item.tenant, &item.account])))?;
        let triggers = load_triggers(&self.catalog, &account).await?;
        let Some(at) = triggers.iter().find(|t| t.unique_id == item.unique_id).cloned() else {
            warn!("Trigger {} no longer attached to {}", item.unique_id, account.full_id());
            return Ok(Vec::new());
        };

        let record = account
            .trigger_records
            .entry(at.unique_id.clone())
            .or_insert_with(|| at.record());
        if record.recurrent && record.is_sleeping(at.min_sleep, now) {
            debug!("Trigger {} sleeping", at.unique_id);
            record.executed = false;
            self.accounts.set_account(&account).await?;
            return Ok(Vec::new());
        }
        if account.disabled {
            record.executed = false;
            self.accounts.set_account(&account).await?;
            return Err(AppError::AccountDisabled(account.full_id()));
        }
        record.last_execution_time = Some(now);

        let result = match self
            .catalog
            .find::<ActionGroup>(&item.tenant, &at.actions_id, CacheMode::UseCache)
            .await?
        {
            Some(group) => {
                let actions = group.sorted_actions();
                let mut ctx = ActionContext::for_account(&mut account, &triggers, now);
                self.runtime.execute(&mut ctx, &actions).await
            }
            None => Err(AppError::NotFound(format!("actions {}", at.actions_id))),
        };

        let fired = match &result {
            Ok(outcome) if outcome.account_removed => return Ok(Vec::new()),
            Ok(outcome) => outcome.fired.clone(),
            Err(_) => Vec::new(),
        };
        if let Some(record) = account.trigger_records.get_mut(&at.unique_id) {
            if result.is_err() || record.recurrent {
                record.executed = false;
            }
        }
        account.flush_balances(self.decimals);
        self.accounts.set_account(&account).await?;
        result?;

        info!("Executed trigger {} on {}", at.unique_id, account.full_id());
        Ok(fired
            .into_iter()
            .map(|unique_id| QueuedTrigger {
                tenant: item.tenant.clone(),
                account: item.account.clone(),
                unique_id,
            })
            .collect())
    }

    /// Evaluate the QoS triggers of a stats snapshot and run the fired ones
    ///
    /// The snapshot records the executions. With an account the actions run
    /// on it under the guardian and it is saved afterwards; otherwise they
    /// run detached with the snapshot only.
    ///
    /// # Errors
    ///
    /// Returns the first action group error; later triggers are not run.
    #[instrument(skip(self, snapshot), fields(queue = %snapshot.id))]
    pub async fn execute_stats_triggers(
        &self,
        snapshot: &mut StatsSnapshot,
        account: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<String>> {
        let fired = snapshot.evaluate_triggers(now);
        let mut ran = Vec::new();
        let mut follow_up = Vec::new();
        for at in &fired {
            let group = self
                .catalog
                .get::<ActionGroup>(&snapshot.tenant, &at.actions_id, CacheMode::UseCache)
                .await?;
            let actions = group.sorted_actions();
            let stats: &StatsSnapshot = snapshot;
            match account {
                Some(name) => {
                    let key = concat_key(&[&stats.tenant, name]);
                    let more = self
                        .guardian
                        .guard(&[key], self.lock_timeout, || async {
                            let mut acc = self.accounts.get_account(&stats.tenant, name).await?;
                            let triggers = load_triggers(&self.catalog, &acc).await?;
                            let mut ctx = ActionContext::for_account(&mut acc, &triggers, now);
                            ctx.stats = Some(stats);
                            let outcome = self.runtime.execute(&mut ctx, &actions).await?;
                            if !outcome.account_removed {
                                acc.flush_balances(self.decimals);
                                self.accounts.set_account(&acc).await?;
                            }
                            Ok(outcome.fired)
                        })
                        .await?;
                    follow_up.extend(more.into_iter().map(|unique_id| QueuedTrigger {
                        tenant: stats.tenant.clone(),
                        account: name.to_string(),
                        unique_id,
                    }));
                }
                None => {
                    let mut ctx = ActionContext::detached(&stats.tenant, Some(stats), now);
                    self.runtime.execute(&mut ctx, &actions).await?;
                }
            }
            ran.push(at.unique_id.clone());
        }
        if !follow_up.is_empty() {
            self.drain(follow_up).await;
        }
        Ok(ran)
    }

    /// Clear the executed flag of the account triggers selected by `filter`
    /// and evaluate them again, running whatever fires
    pub async fn reset_triggers(
        &self,
        tenant: &str,
        account: &str,
        filter: Option<&Filter>,
    ) -> AppResult<usize> {
        let key = concat_key(&[tenant, account]);
        let fired = self
            .guardian
            .guard(&[key], self.lock_timeout, || async {
                let mut acc = self.accounts.get_account(tenant, account).await?;
                let triggers = load_triggers(&self.catalog, &acc).await?;
                acc.reset_trigger_records(filter);
                let now = Utc::now();
                let fired = acc.evaluate_triggers(&triggers, filter, now);
                acc.remove_expired_balances(now);
                self.accounts.set_account(&acc).await?;
                Ok(fired)
            })
            .await?;
        let queue = fired
            .into_iter()
            .map(|unique_id| QueuedTrigger {
                tenant: tenant.to_string(),
                account: account.to_string(),
                unique_id,
            })
            .collect();
        Ok(self.drain(queue).await)
    }

    /// Attach trigger groups to an account, initialising counters and records
    pub async fn attach_triggers(&self, tenant: &str, account: &str, groups: &[String]) -> AppResult<()> {
        let key = concat_key(&[tenant, account]);
        self.guardian
            .guard(&[key], self.lock_timeout, || async {
                let mut acc = self.accounts.get_account(tenant, account).await?;
                for group in groups {
                    self.catalog
                        .get::<ActionTriggerGroup>(tenant, group, CacheMode::UseCache)
                        .await?;
                    acc.trigger_ids.insert(group.clone(), true);
                }
                let triggers = load_triggers(&self.catalog, &acc).await?;
                acc.init_counters(&triggers);
                acc.init_trigger_records(&triggers);
                self.accounts.set_account(&acc).await
            })
            .await
    }
}
