//! Action plans
//!
//! Plans schedule action groups on timings. Accounts are attached to plans
//! through [`ActionPlanBinding`]s; timings marked `*asap` are turned into
//! [`Task`]s and executed by the scheduler as soon as the binding is made.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::timing::RITiming;
use crate::utils::{concat_key, gen_uuid};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionTiming {
    pub uuid: String,
    pub timing: RITiming,
    pub actions_id: String,
    #[serde(default)]
    pub weight: Decimal,
    #[serde(skip)]
    next_start_cache: Option<DateTime<Utc>>,
}

impl ActionTiming {
    pub fn new(timing: RITiming, actions_id: &str, weight: Decimal) -> Self {
        Self {
            uuid: gen_uuid(),
            timing,
            actions_id: actions_id.to_string(),
            weight,
            next_start_cache: None,
        }
    }

    pub fn is_asap(&self) -> bool {
        self.timing.is_asap()
    }

    /// Next start after `now`, computed once and then cached
    pub fn next_start(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.next_start_cache.is_none() {
            self.next_start_cache = self.timing.next_start(now);
        }
        self.next_start_cache
    }

    pub fn reset_start_cache(&mut self) {
        self.next_start_cache = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionPlan {
    pub tenant: String,
    pub name: String,
    pub action_timings: Vec<ActionTiming>,
}

impl ActionPlan {
    pub fn asap_timings(&self) -> impl Iterator<Item = &ActionTiming> {
        self.action_timings.iter().filter(|at| at.is_asap())
    }
}

/// Attachment of an account to an action plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionPlanBinding {
    pub tenant: String,
    pub account: String,
    pub plan: String,
}

impl ActionPlanBinding {
    pub fn new(tenant: &str, account: &str, plan: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            account: account.to_string(),
            plan: plan.to_string(),
        }
    }

    pub fn key(&self) -> String {
        concat_key(&[&self.account, &self.plan])
    }
}

/// Deferred execution of an action group for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub uuid: String,
    pub tenant: String,
    pub account: String,
    pub actions_id: String,
}

impl Task {
    pub fn new(tenant: &str, account: &str, actions_id: &str) -> Self {
        Self {
            uuid: gen_uuid(),
            tenant: tenant.to_string(),
            account: account.to_string(),
            actions_id: actions_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[test]
    fn test_next_start_is_cached() {
        let mut at = ActionTiming::new(
            RITiming {
                start_time: "10:00:00".into(),
                ..Default::default()
            },
            "TOPUP",
            dec!(10),
        );
        let now = Utc.with_ymd_and_hms(2014, 3, 4, 9, 0, 0).unwrap();
        let first = at.next_start(now);
        assert_eq!(first, Some(Utc.with_ymd_and_hms(2014, 3, 4, 10, 0, 0).unwrap()));
        // still the cached value even though `now` moved past it
        assert_eq!(at.next_start(now + Duration::hours(3)), first);
        at.reset_start_cache();
        assert_eq!(
            at.next_start(now + Duration::hours(3)),
            Some(Utc.with_ymd_and_hms(2014, 3, 5, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_asap_timings() {
        let plan = ActionPlan {
            tenant: "t1".into(),
            name: "AP".into(),
            action_timings: vec![
                ActionTiming::new(RITiming::asap(), "A", dec!(10)),
                ActionTiming::new(RITiming::always(), "B", dec!(10)),
            ],
        };
        assert_eq!(plan.asap_timings().count(), 1);
        assert_eq!(ActionPlanBinding::new("t1", "rif", "AP").key(), "rif:AP");
    }
}
