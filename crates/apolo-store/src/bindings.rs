//! Action plan bindings and the task queue
//!
//! Bindings are kept as two mirrored sets so they can be enumerated both by
//! plan and by account.

use apolo_core::models::{ActionPlanBinding, Task};
use apolo_core::AppResult;
use tracing::debug;

use crate::catalog::Catalog;
use crate::keys;

impl Catalog {
    pub async fn set_action_plan_binding(&self, binding: &ActionPlanBinding) -> AppResult<()> {
        self.store()
            .sadd(
                &keys::plan_bindings_key(&binding.tenant, &binding.plan),
                &binding.account,
            )
            .await?;
        self.store()
            .sadd(
                &keys::account_plans_key(&binding.tenant, &binding.account),
                &binding.plan,
            )
            .await?;
        debug!("Bound {} to plan {}", binding.account, binding.plan);
        Ok(())
    }

    pub async fn remove_action_plan_binding(&self, binding: &ActionPlanBinding) -> AppResult<()> {
        self.store()
            .srem(
                &keys::plan_bindings_key(&binding.tenant, &binding.plan),
                &binding.account,
            )
            .await?;
        self.store()
            .srem(
                &keys::account_plans_key(&binding.tenant, &binding.account),
                &binding.plan,
            )
            .await?;
        Ok(())
    }

    /// Drop every binding of an account
    pub async fn remove_action_plan_bindings(&self, tenant: &str, account: &str) -> AppResult<()> {
        for plan in self.plans_for_account(tenant, account).await? {
            self.remove_action_plan_binding(&ActionPlanBinding::new(tenant, account, &plan))
                .await?;
        }
        Ok(())
    }

    /// Accounts bound to a plan
    pub async fn bindings_for_plan(&self, tenant: &str, plan: &str) -> AppResult<Vec<String>> {
        self.store()
            .smembers(&keys::plan_bindings_key(tenant, plan))
            .await
    }

    /// Plans bound to an account
    pub async fn plans_for_account(&self, tenant: &str, account: &str) -> AppResult<Vec<String>> {
        self.store()
            .smembers(&keys::account_plans_key(tenant, account))
            .await
    }

    // ==================== Tasks ====================

    pub async fn push_task(&self, task: &Task) -> AppResult<()> {
        let json = serde_json::to_string(task)?;
        self.store().rpush(keys::TASKS_KEY, &json).await
    }

    /// Oldest pending task
    pub async fn pop_task(&self) -> AppResult<Option<Task>> {
        match self.store().lpop(keys::TASKS_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn catalog() -> Catalog {
        Catalog::new(Arc::new(MemoryStore::new()), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_bindings_both_ways() {
        let catalog = catalog();
        catalog
            .set_action_plan_binding(&ActionPlanBinding::new("t1", "1001", "PLAN_A"))
            .await
            .unwrap();
        catalog
            .set_action_plan_binding(&ActionPlanBinding::new("t1", "1001", "PLAN_B"))
            .await
            .unwrap();
        catalog
            .set_action_plan_binding(&ActionPlanBinding::new("t1", "1002", "PLAN_A"))
            .await
            .unwrap();

        assert_eq!(
            catalog.bindings_for_plan("t1", "PLAN_A").await.unwrap(),
            vec!["1001", "1002"]
        );
        assert_eq!(
            catalog.plans_for_account("t1", "1001").await.unwrap(),
            vec!["PLAN_A", "PLAN_B"]
        );

        catalog.remove_action_plan_bindings("t1", "1001").await.unwrap();
        assert!(catalog.plans_for_account("t1", "1001").await.unwrap().is_empty());
        assert_eq!(
            catalog.bindings_for_plan("t1", "PLAN_A").await.unwrap(),
            vec!["1002"]
        );
    }

    #[tokio::test]
    async fn test_task_queue_fifo() {
        let catalog = catalog();
        let first = Task::new("t1", "1001", "TOPUP");
        let second = Task::new("t1", "1002", "TOPUP");
        catalog.push_task(&first).await.unwrap();
        catalog.push_task(&second).await.unwrap();
        assert_eq!(catalog.pop_task().await.unwrap(), Some(first));
        assert_eq!(catalog.pop_task().await.unwrap(), Some(second));
        assert_eq!(catalog.pop_task().await.unwrap(), None);
    }
}
