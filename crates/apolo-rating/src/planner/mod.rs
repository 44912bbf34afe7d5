//! Action planner
//!
//! Runs the action groups of scheduled plan timings on every bound account,
//! and the one-off tasks queued for `*asap` timings when an account is bound
//! to a plan.

mod scheduler;

pub use scheduler::Scheduler;

use std::sync::Arc;
use std::time::Duration;

use apolo_core::models::{Action, ActionGroup, ActionPlan, ActionPlanBinding, ActionTiming, Task};
use apolo_core::utils::concat_key;
use apolo_core::{AppError, AppResult};
use apolo_store::{AccountStore, CacheMode, Catalog};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::actions::{requires_account, ActionContext};
use crate::guardian::Guardian;
use crate::triggers::{load_triggers, QueuedTrigger, TriggerProcessor};

/// How a timing came out of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingStatus {
    /// Ran, possibly with failures on some accounts; keep scheduling it
    Executed,
    /// Refers to an unknown action kind; never schedule it again
    Unschedulable,
}

pub struct ActionPlanner {
    catalog: Arc<Catalog>,
    accounts: Arc<AccountStore>,
    guardian: Arc<Guardian>,
    triggers: Arc<TriggerProcessor>,
    lock_timeout: Option<Duration>,
    decimals: u32,
}

impl ActionPlanner {
    pub fn new(
        catalog: Arc<Catalog>,
        accounts: Arc<AccountStore>,
        guardian: Arc<Guardian>,
        triggers: Arc<TriggerProcessor>,
        lock_timeout: Option<Duration>,
        decimals: u32,
    ) -> Self {
        Self {
            catalog,
            accounts,
            guardian,
            triggers,
            lock_timeout,
            decimals,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Bind `account` to `plan` and queue a task per `*asap` timing
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` when the plan does not exist
    /// - `AppError::AccountNotFound` when the account does not exist
    #[instrument(skip(self))]
    pub async fn bind_account(&self, tenant: &str, account: &str, plan: &str) -> AppResult<usize> {
        let ap = self
            .catalog
            .get::<ActionPlan>(tenant, plan, CacheMode::UseCache)
            .await?;
        if self.accounts.find_account(tenant, account).await?.is_none() {
            return Err(AppError::AccountNotFound(concat_key(&[tenant, account])));
        }
        self.catalog
            .set_action_plan_binding(&ActionPlanBinding::new(tenant, account, plan))
            .await?;

        let mut queued = 0;
        for timing in ap.asap_timings() {
            self.catalog
                .push_task(&Task::new(tenant, account, &timing.actions_id))
                .await?;
            queued += 1;
        }
        info!("Bound {}:{} to plan {} ({} asap tasks)", tenant, account, plan, queued);
        Ok(queued)
    }

    pub async fn unbind_account(&self, tenant: &str, account: &str, plan: &str) -> AppResult<()> {
        self.catalog
            .remove_action_plan_binding(&ActionPlanBinding::new(tenant, account, plan))
            .await
    }

    async fn actions(&self, tenant: &str, actions_id: &str) -> AppResult<Vec<Action>> {
        let group = self
            .catalog
            .get::<ActionGroup>(tenant, actions_id, CacheMode::UseCache)
            .await?;
        Ok(group.sorted_actions())
    }

    /// Run a queued task on its account
    #[instrument(skip(self, task), fields(account = %task.account, actions = %task.actions_id))]
    pub async fn execute_task(&self, task: &Task) -> AppResult<()> {
        let actions = self.actions(&task.tenant, &task.actions_id).await?;
        let fired = self
            .run_on_account(&task.tenant, &task.account, &actions, Utc::now())
            .await?;
        self.triggers.drain(fired).await;
        Ok(())
    }

    /// Run one timing of `plan` on every bound account
    ///
    /// Accounts are processed one at a time under the guardian; a failing
    /// account is logged and left unsaved. Without bindings only the actions
    /// that need no account run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when the action group is missing
    #[instrument(skip(self, timing), fields(actions = %timing.actions_id))]
    pub async fn execute_timing(
        &self,
        tenant: &str,
        plan: &str,
        timing: &ActionTiming,
        now: DateTime<Utc>,
    ) -> AppResult<TimingStatus> {
        let actions = self.actions(tenant, &timing.actions_id).await?;
        if let Some(bad) = actions.iter().find(|a| a.kind().is_err()) {
            warn!("Timing {} of {} uses unknown action {}", timing.uuid, plan, bad.action_type);
            return Ok(TimingStatus::Unschedulable);
        }

        let bound = self.catalog.bindings_for_plan(tenant, plan).await?;
        if bound.is_empty() {
            let accountless: Vec<Action> = actions
                .into_iter()
                .filter(|a| a.kind().map(|k| !requires_account(k)).unwrap_or(false))
                .collect();
            let mut ctx = ActionContext::detached(tenant, None, now);
            if let Err(e) = self.triggers.runtime().execute(&mut ctx, &accountless).await {
                error!("Plan {} without accounts failed: {}", plan, e);
            }
            return Ok(TimingStatus::Executed);
        }

        let mut fired = Vec::new();
        for account in &bound {
            match self.run_on_account(tenant, account, &actions, now).await {
                Ok(more) => fired.extend(more),
                Err(e) => error!("Plan {} on {}:{} failed: {}", plan, tenant, account, e),
            }
        }
        debug!("Plan {} ran on {} accounts", plan, bound.len());
        self.triggers.drain(fired).await;
        Ok(TimingStatus::Executed)
    }

    /// Execute `actions` on one account and save it on success
    async fn run_on_account(
        &self,
        tenant: &str,
        name: &str,
        actions: &[Action],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<QueuedTrigger>> {
        let key = concat_key(&[tenant, name]);
        self.guardian
            .guard(&[key], self.lock_timeout, || async {
                let mut account = self.accounts.get_account(tenant, name).await?;
                let triggers = load_triggers(&self.catalog, &account).await?;
                let mut ctx = ActionContext::for_account(&mut account, &triggers, now);
                let outcome = self.triggers.runtime().execute(&mut ctx, actions).await?;
                if outcome.account_removed {
                    return Ok(Vec::new());
                }
                account.flush_balances(self.decimals);
                self.accounts.set_account(&account).await?;
                Ok(outcome
                    .fired
                    .into_iter()
                    .map(|unique_id| QueuedTrigger {
                        tenant: tenant.to_string(),
                        account: name.to_string(),
                        unique_id,
                    })
                    .collect())
            })
            .await
    }
}
