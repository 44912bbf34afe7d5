//! Stats queue snapshots
//!
//! Quality-of-service metrics computed by an external stats service and
//! handed to the engine to evaluate QoS triggers and feed stats actions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trigger::{ActionTrigger, ActionTriggerRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatsSnapshot {
    pub tenant: String,
    pub id: String,
    /// Metric values keyed by metric id (`ASR`, `ACD`, ...); for `DDC` the
    /// keys of `metric_keys` hold the distinct destinations
    #[serde(default)]
    pub metrics: BTreeMap<String, Decimal>,
    /// Distinct values seen by count metrics such as `DDC`
    #[serde(default)]
    pub metric_keys: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<ActionTrigger>,
    #[serde(default)]
    pub trigger_records: BTreeMap<String, ActionTriggerRecord>,
    /// Items currently in the queue
    #[serde(default)]
    pub queued_items: u32,
}

impl StatsSnapshot {
    pub fn metric(&self, name: &str) -> Option<Decimal> {
        self.metrics.get(name).copied()
    }

    /// Fire the QoS triggers crossed by the current metrics
    ///
    /// Triggers with a `min_queued_items` above the queue length are skipped;
    /// executed non-recurrent triggers stay silent until reset.
    pub fn evaluate_triggers(&mut self, now: DateTime<Utc>) -> Vec<ActionTrigger> {
        let mut fired = Vec::new();
        for at in &self.triggers {
            let Some(metric) = at.threshold_type.stats_metric() else {
                continue;
            };
            if at.is_expired_at(now) || !at.is_active_at(now) {
                continue;
            }
            if self.queued_items < at.min_queued_items {
                continue;
            }
            let record = self
                .trigger_records
                .entry(at.unique_id.clone())
                .or_insert_with(|| at.record());
            if record.executed && !record.recurrent {
                continue;
            }
            if record.recurrent && record.is_sleeping(at.min_sleep, now) {
                continue;
            }
            let Some(value) = self.metrics.get(metric).copied() else {
                continue;
            };
            if at.threshold_type.is_crossed(value, at.threshold_value) {
                record.executed = true;
                record.last_execution_time = Some(now);
                fired.push(at.clone());
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trigger::ThresholdType;
    use rust_decimal_macros::dec;

    #[test]
    fn test_min_asr_fires_once() {
        let mut at = ActionTrigger::new("asr", ThresholdType::MinAsr, dec!(50), "NOTIFY");
        at.min_queued_items = 2;
        let mut snap = StatsSnapshot {
            tenant: "t1".into(),
            id: "Q1".into(),
            metrics: [("ASR".to_string(), dec!(40))].into_iter().collect(),
            triggers: vec![at],
            queued_items: 1,
            ..Default::default()
        };
        let now = Utc::now();
        assert!(snap.evaluate_triggers(now).is_empty());
        snap.queued_items = 5;
        assert_eq!(snap.evaluate_triggers(now).len(), 1);
        assert!(snap.evaluate_triggers(now).is_empty());
    }
}
