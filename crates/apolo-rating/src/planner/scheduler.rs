//! Plan scheduler
//!
//! Keeps every schedulable plan timing in a priority queue ordered by next
//! start time, heavier timings first on ties. `reload` runs the queued
//! `*asap` tasks and rebuilds the queue from the catalog.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use apolo_core::filter::Filter;
use apolo_core::models::{ActionPlan, ActionTiming};
use apolo_core::AppResult;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use super::{ActionPlanner, TimingStatus};

#[derive(Debug, Clone)]
struct Due {
    at: DateTime<Utc>,
    tenant: String,
    plan: String,
    timing: ActionTiming,
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Due {}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Due {
    // max-heap: the earliest start, then the heaviest timing, pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| self.timing.weight.cmp(&other.timing.weight))
    }
}

pub struct Scheduler {
    planner: Arc<ActionPlanner>,
    queue: Mutex<BinaryHeap<Due>>,
    /// Timings referring to unknown actions, by uuid
    unschedulable: Mutex<HashSet<String>>,
    reload_signal: Notify,
    shutdown_tx: watch::Sender<bool>,
    task_concurrency: usize,
}

impl Scheduler {
    pub fn new(planner: Arc<ActionPlanner>, task_concurrency: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            planner,
            queue: Mutex::new(BinaryHeap::new()),
            unschedulable: Mutex::new(HashSet::new()),
            reload_signal: Notify::new(),
            shutdown_tx,
            task_concurrency: task_concurrency.max(1),
        }
    }

    /// Number of timings waiting
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Start of the next due timing
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue.lock().peek().map(|d| d.at)
    }

    /// Ask a running scheduler to reload
    pub fn signal_reload(&self) {
        self.reload_signal.notify_one();
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run pending tasks, then rebuild the queue from every stored plan
    ///
    /// `*asap`, unschedulable and obsolete timings are left out. Returns the
    /// number of queued timings.
    pub async fn reload(&self) -> AppResult<usize> {
        let catalog = Arc::clone(self.planner.catalog());
        let mut tasks = Vec::new();
        while let Some(task) = catalog.pop_task().await? {
            tasks.push(task);
        }
        if !tasks.is_empty() {
            info!("Executing {} queued tasks", tasks.len());
        }
        let planner = &self.planner;
        stream::iter(tasks)
            .for_each_concurrent(self.task_concurrency, |task| async move {
                if let Err(e) = planner.execute_task(&task).await {
                    error!("Task {} for {}:{} failed: {}", task.uuid, task.tenant, task.account, e);
                }
            })
            .await;

        let plans = catalog
            .iterate::<ActionPlan>(None, &Filter::default())
            .await?;
        let now = Utc::now();
        let skip = self.unschedulable.lock().clone();
        let mut heap = BinaryHeap::new();
        for plan in plans {
            for timing in &plan.action_timings {
                if timing.is_asap() || skip.contains(&timing.uuid) {
                    continue;
                }
                let mut timing = timing.clone();
                timing.reset_start_cache();
                match timing.next_start(now) {
                    Some(at) => heap.push(Due {
                        at,
                        tenant: plan.tenant.clone(),
                        plan: plan.name.clone(),
                        timing,
                    }),
                    None => debug!("Timing {} of {} is obsolete", timing.uuid, plan.name),
                }
            }
        }
        let count = heap.len();
        *self.queue.lock() = heap;
        info!("Scheduler loaded {} timings", count);
        Ok(count)
    }

    /// Execute every timing due at `now` and queue their next starts
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let mut due = Vec::new();
        {
            let mut queue = self.queue.lock();
            while queue.peek().map(|d| d.at <= now).unwrap_or(false) {
                if let Some(item) = queue.pop() {
                    due.push(item);
                }
            }
        }

        let executed = due.len();
        for mut item in due {
            match self
                .planner
                .execute_timing(&item.tenant, &item.plan, &item.timing, now)
                .await
            {
                Ok(TimingStatus::Unschedulable) => {
                    self.unschedulable.lock().insert(item.timing.uuid.clone());
                    continue;
                }
                Ok(TimingStatus::Executed) => {}
                Err(e) => error!("Timing {} of {} failed: {}", item.timing.uuid, item.plan, e),
            }
            item.timing.reset_start_cache();
            if let Some(next) = item.timing.next_start(item.at) {
                item.at = next;
                self.queue.lock().push(item);
            }
        }
        executed
    }

    /// Loop until [`Scheduler::shutdown`], sleeping until the next due
    /// timing or a reload signal
    pub async fn run(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if let Err(e) = self.reload().await {
            error!("Initial scheduler load failed: {}", e);
        }
        loop {
            let wait = match self.next_due() {
                Some(at) => (at - Utc::now()).to_std().unwrap_or_default(),
                None => std::time::Duration::from_secs(3600),
            };
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = self.reload_signal.notified() => {
                    if let Err(e) = self.reload().await {
                        warn!("Scheduler reload failed: {}", e);
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    self.run_due(Utc::now()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apolo_core::constants::MONETARY;
    use apolo_core::models::{Account, Action, ActionGroup, ActionKind, Balance, RITiming};
    use apolo_store::{AccountStore, Catalog, MemoryStore, StoreCdrSink};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    use crate::actions::ActionRuntime;
    use crate::fixtures::TENANT;
    use crate::guardian::Guardian;
    use crate::settings::ActionSettings;
    use crate::triggers::TriggerProcessor;

    async fn setup() -> (Arc<AccountStore>, Arc<ActionPlanner>) {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(Catalog::new(store.clone(), Duration::from_millis(100)));
        let accounts = Arc::new(AccountStore::new(store.clone()));
        let guardian = Arc::new(Guardian::new());
        let runtime = Arc::new(
            ActionRuntime::new(
                catalog.clone(),
                accounts.clone(),
                Arc::new(StoreCdrSink::new(store)),
                ActionSettings::default(),
            )
            .unwrap(),
        );
        let triggers = Arc::new(TriggerProcessor::new(
            catalog.clone(),
            accounts.clone(),
            guardian.clone(),
            runtime,
            None,
            6,
        ));
        let planner = Arc::new(ActionPlanner::new(
            catalog.clone(),
            accounts.clone(),
            guardian,
            triggers,
            None,
            6,
        ));

        let mut acc = Account::new(TENANT, "rif");
        acc.balance_map
            .insert(MONETARY.into(), vec![Balance::new("main", dec!(10))]);
        accounts.set_account(&acc).await.unwrap();
        catalog
            .set(&ActionGroup {
                tenant: TENANT.into(),
                name: "TOPUP5".into(),
                actions: vec![Action::new(
                    ActionKind::Topup,
                    MONETARY,
                    r#"{"Balance":{"ID":"main","Value":5}}"#,
                )],
            })
            .await
            .unwrap();
        (accounts, planner)
    }

    fn daily() -> RITiming {
        RITiming {
            start_time: "06:00:00".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_due_ordering() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let item = |at, weight| Due {
            at,
            tenant: TENANT.into(),
            plan: "P".into(),
            timing: ActionTiming::new(daily(), "A", weight),
        };
        let mut heap = BinaryHeap::new();
        heap.push(item(t0 + ChronoDuration::hours(1), dec!(50)));
        heap.push(item(t0, dec!(10)));
        heap.push(item(t0, dec!(20)));
        assert_eq!(heap.pop().map(|d| d.timing.weight), Some(dec!(20)));
        assert_eq!(heap.pop().map(|d| d.timing.weight), Some(dec!(10)));
        assert_eq!(heap.pop().map(|d| d.timing.weight), Some(dec!(50)));
    }

    #[tokio::test]
    async fn test_reload_runs_asap_tasks_and_queues_timings() {
        let (accounts, planner) = setup().await;
        let plan = ActionPlan {
            tenant: TENANT.into(),
            name: "MONTHLY".into(),
            action_timings: vec![
                ActionTiming::new(RITiming::asap(), "TOPUP5", dec!(10)),
                ActionTiming::new(daily(), "TOPUP5", dec!(10)),
            ],
        };
        planner.catalog().set(&plan).await.unwrap();
        assert_eq!(planner.bind_account(TENANT, "rif", "MONTHLY").await.unwrap(), 1);

        let scheduler = Scheduler::new(planner, 2);
        assert_eq!(scheduler.reload().await.unwrap(), 1);
        let acc = accounts.get_account(TENANT, "rif").await.unwrap();
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(15));
        assert!(scheduler.next_due().map(|at| at > Utc::now()).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_run_due_reschedules() {
        let (accounts, planner) = setup().await;
        let plan = ActionPlan {
            tenant: TENANT.into(),
            name: "DAILY".into(),
            action_timings: vec![ActionTiming::new(daily(), "TOPUP5", dec!(10))],
        };
        planner.catalog().set(&plan).await.unwrap();
        planner.bind_account(TENANT, "rif", "DAILY").await.unwrap();

        let scheduler = Scheduler::new(planner, 1);
        scheduler.reload().await.unwrap();
        let first = scheduler.next_due().unwrap();
        assert_eq!(scheduler.run_due(first).await, 1);
        assert_eq!(scheduler.next_due(), Some(first + ChronoDuration::days(1)));
        let acc = accounts.get_account(TENANT, "rif").await.unwrap();
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(15));
    }

    #[tokio::test]
    async fn test_unknown_action_is_dropped() {
        let (_, planner) = setup().await;
        planner
            .catalog()
            .set(&ActionGroup {
                tenant: TENANT.into(),
                name: "BROKEN".into(),
                actions: vec![Action {
                    action_type: "*teleport".into(),
                    ..Default::default()
                }],
            })
            .await
            .unwrap();
        let plan = ActionPlan {
            tenant: TENANT.into(),
            name: "BAD".into(),
            action_timings: vec![ActionTiming::new(daily(), "BROKEN", dec!(0))],
        };
        planner.catalog().set(&plan).await.unwrap();

        let scheduler = Scheduler::new(planner, 1);
        assert_eq!(scheduler.reload().await.unwrap(), 1);
        let due = scheduler.next_due().unwrap();
        scheduler.run_due(due).await;
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.reload().await.unwrap(), 0);
    }
}
