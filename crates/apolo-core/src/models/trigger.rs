//! Action triggers
//!
//! A trigger watches an account (counters, balances, expiry) or a stats
//! queue (QoS metrics) and runs an action group when its threshold is hit.
//! Execution state lives in per-account [`ActionTriggerRecord`]s so the
//! trigger definitions can be shared by many accounts.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::counter::CounterType;
use crate::error::AppError;
use crate::filter::{FieldValue, Filter, Queryable};
use crate::utils::dates::duration_serde;
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThresholdType {
    #[serde(rename = "*min_event_counter")]
    MinEventCounter,
    #[serde(rename = "*max_event_counter")]
    MaxEventCounter,
    #[serde(rename = "*min_balance_counter")]
    MinBalanceCounter,
    #[serde(rename = "*max_balance_counter")]
    MaxBalanceCounter,
    #[serde(rename = "*min_balance")]
    MinBalance,
    #[serde(rename = "*max_balance")]
    MaxBalance,
    #[serde(rename = "*balance_expired")]
    BalanceExpired,
    #[serde(rename = "*min_asr")]
    MinAsr,
    #[serde(rename = "*max_asr")]
    MaxAsr,
    #[serde(rename = "*min_acd")]
    MinAcd,
    #[serde(rename = "*max_acd")]
    MaxAcd,
    #[serde(rename = "*min_tcd")]
    MinTcd,
    #[serde(rename = "*max_tcd")]
    MaxTcd,
    #[serde(rename = "*min_acc")]
    MinAcc,
    #[serde(rename = "*max_acc")]
    MaxAcc,
    #[serde(rename = "*min_tcc")]
    MinTcc,
    #[serde(rename = "*max_tcc")]
    MaxTcc,
    #[serde(rename = "*min_pdd")]
    MinPdd,
    #[serde(rename = "*max_pdd")]
    MaxPdd,
    #[serde(rename = "*min_ddc")]
    MinDdc,
    #[serde(rename = "*max_ddc")]
    MaxDdc,
}

impl ThresholdType {
    /// Counter kind backing counter thresholds
    pub fn counter_type(self) -> Option<CounterType> {
        match self {
            ThresholdType::MinEventCounter | ThresholdType::MaxEventCounter => {
                Some(CounterType::Event)
            }
            ThresholdType::MinBalanceCounter | ThresholdType::MaxBalanceCounter => {
                Some(CounterType::Balance)
            }
            _ => None,
        }
    }

    /// True for thresholds crossed from below
    pub fn is_max(self) -> bool {
        matches!(
            self,
            ThresholdType::MaxEventCounter
                | ThresholdType::MaxBalanceCounter
                | ThresholdType::MaxBalance
                | ThresholdType::MaxAsr
                | ThresholdType::MaxAcd
                | ThresholdType::MaxTcd
                | ThresholdType::MaxAcc
                | ThresholdType::MaxTcc
                | ThresholdType::MaxPdd
                | ThresholdType::MaxDdc
        )
    }

    /// Stats metric watched by QoS thresholds
    pub fn stats_metric(self) -> Option<&'static str> {
        let metric = match self {
            ThresholdType::MinAsr | ThresholdType::MaxAsr => "ASR",
            ThresholdType::MinAcd | ThresholdType::MaxAcd => "ACD",
            ThresholdType::MinTcd | ThresholdType::MaxTcd => "TCD",
            ThresholdType::MinAcc | ThresholdType::MaxAcc => "ACC",
            ThresholdType::MinTcc | ThresholdType::MaxTcc => "TCC",
            ThresholdType::MinPdd | ThresholdType::MaxPdd => "PDD",
            ThresholdType::MinDdc | ThresholdType::MaxDdc => "DDC",
            _ => return None,
        };
        Some(metric)
    }

    /// Compare an observed value against the threshold
    pub fn is_crossed(self, observed: Decimal, threshold: Decimal) -> bool {
        if self.is_max() {
            observed >= threshold
        } else {
            observed <= threshold
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdType::MinEventCounter => "*min_event_counter",
            ThresholdType::MaxEventCounter => "*max_event_counter",
            ThresholdType::MinBalanceCounter => "*min_balance_counter",
            ThresholdType::MaxBalanceCounter => "*max_balance_counter",
            ThresholdType::MinBalance => "*min_balance",
            ThresholdType::MaxBalance => "*max_balance",
            ThresholdType::BalanceExpired => "*balance_expired",
            ThresholdType::MinAsr => "*min_asr",
            ThresholdType::MaxAsr => "*max_asr",
            ThresholdType::MinAcd => "*min_acd",
            ThresholdType::MaxAcd => "*max_acd",
            ThresholdType::MinTcd => "*min_tcd",
            ThresholdType::MaxTcd => "*max_tcd",
            ThresholdType::MinAcc => "*min_acc",
            ThresholdType::MaxAcc => "*max_acc",
            ThresholdType::MinTcc => "*min_tcc",
            ThresholdType::MaxTcc => "*max_tcc",
            ThresholdType::MinPdd => "*min_pdd",
            ThresholdType::MaxPdd => "*max_pdd",
            ThresholdType::MinDdc => "*min_ddc",
            ThresholdType::MaxDdc => "*max_ddc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTrigger {
    pub unique_id: String,
    pub threshold_type: ThresholdType,
    pub threshold_value: Decimal,
    #[serde(default)]
    pub recurrent: bool,
    /// Minimum time between two executions of a recurrent trigger
    #[serde(with = "duration_serde", default = "Duration::zero")]
    pub min_sleep: Duration,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activation_date: Option<DateTime<Utc>>,
    /// TOR of the watched balances and counters
    #[serde(default)]
    pub tor: String,
    /// Selects counters or balances watched by the trigger
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub weight: Decimal,
    pub actions_id: String,
    /// Stats queues below this size do not fire QoS thresholds
    #[serde(default)]
    pub min_queued_items: u32,
}

impl ActionTrigger {
    pub fn new(unique_id: &str, threshold_type: ThresholdType, threshold_value: Decimal, actions_id: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            threshold_type,
            threshold_value,
            recurrent: false,
            min_sleep: Duration::zero(),
            expiration_date: None,
            activation_date: None,
            tor: String::new(),
            filter: Filter::default(),
            weight: Decimal::ZERO,
            actions_id: actions_id.to_string(),
            min_queued_items: 0,
        }
    }

    /// Active once the activation date has passed
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.activation_date.map(|a| now > a).unwrap_or(true)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.map(|e| now > e).unwrap_or(false)
    }

    /// Reject triggers that can never be evaluated
    ///
    /// Account thresholds need the TOR they watch and every filter must
    /// compile.
    pub fn validate(&self) -> AppResult<()> {
        if self.threshold_type.stats_metric().is_none() && self.tor.is_empty() {
            return Err(AppError::MandatoryMissing(format!(
                "trigger {}: tor",
                self.unique_id
            )));
        }
        Filter::compile(self.filter.as_str())?;
        if self.actions_id.is_empty() {
            return Err(AppError::MandatoryMissing(format!(
                "trigger {}: actions id",
                self.unique_id
            )));
        }
        Ok(())
    }

    pub fn record(&self) -> ActionTriggerRecord {
        ActionTriggerRecord {
            unique_id: self.unique_id.clone(),
            recurrent: self.recurrent,
            executed: false,
            expiration_date: self.expiration_date,
            activation_date: self.activation_date,
            last_execution_time: None,
        }
    }
}

impl Queryable for ActionTrigger {
    fn field(&self, name: &str) -> Option<FieldValue> {
        let v = match name {
            "UniqueID" => FieldValue::from(self.unique_id.as_str()),
            "ThresholdType" => FieldValue::from(self.threshold_type.as_str()),
            "ThresholdValue" => FieldValue::Dec(self.threshold_value),
            "Recurrent" => FieldValue::Bool(self.recurrent),
            "MinSleep" => FieldValue::Duration(self.min_sleep),
            "ExpirationDate" => FieldValue::Time(self.expiration_date),
            "ActivationDate" => FieldValue::Time(self.activation_date),
            "TOR" => FieldValue::from(self.tor.as_str()),
            "Weight" => FieldValue::Dec(self.weight),
            "ActionsID" => FieldValue::from(self.actions_id.as_str()),
            _ => return None,
        };
        Some(v)
    }
}

/// Trigger definitions grouped under one catalog name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionTriggerGroup {
    pub tenant: String,
    pub name: String,
    pub triggers: Vec<ActionTrigger>,
}

/// Per-account execution state of one trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionTriggerRecord {
    pub unique_id: String,
    #[serde(default)]
    pub recurrent: bool,
    #[serde(default)]
    pub executed: bool,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_execution_time: Option<DateTime<Utc>>,
}

impl ActionTriggerRecord {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.activation_date.map(|a| now > a).unwrap_or(true)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.map(|e| now > e).unwrap_or(false)
    }

    /// A recurrent trigger executed less than `min_sleep` ago must wait
    pub fn is_sleeping(&self, min_sleep: Duration, now: DateTime<Utc>) -> bool {
        if !self.recurrent || min_sleep <= Duration::zero() {
            return false;
        }
        self.last_execution_time
            .map(|last| now - last < min_sleep)
            .unwrap_or(false)
    }
}

impl Queryable for ActionTriggerRecord {
    fn field(&self, name: &str) -> Option<FieldValue> {
        let v = match name {
            "UniqueID" => FieldValue::from(self.unique_id.as_str()),
            "Recurrent" => FieldValue::Bool(self.recurrent),
            "Executed" => FieldValue::Bool(self.executed),
            "ExpirationDate" => FieldValue::Time(self.expiration_date),
            "ActivationDate" => FieldValue::Time(self.activation_date),
            "LastExecutionTime" => FieldValue::Time(self.last_execution_time),
            _ => return None,
        };
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_threshold_serde_and_kind() {
        let t: ThresholdType = serde_json::from_str("\"*max_event_counter\"").unwrap();
        assert_eq!(t, ThresholdType::MaxEventCounter);
        assert_eq!(t.counter_type(), Some(CounterType::Event));
        assert!(t.is_max());
        assert_eq!(ThresholdType::MinBalance.counter_type(), None);
        assert_eq!(ThresholdType::MaxAsr.stats_metric(), Some("ASR"));
        assert_eq!(ThresholdType::MinBalance.stats_metric(), None);
    }

    #[test]
    fn test_is_crossed() {
        assert!(ThresholdType::MaxEventCounter.is_crossed(dec!(30), dec!(30)));
        assert!(!ThresholdType::MaxEventCounter.is_crossed(dec!(29), dec!(30)));
        assert!(ThresholdType::MinBalance.is_crossed(dec!(2), dec!(2)));
        assert!(!ThresholdType::MinBalance.is_crossed(dec!(3), dec!(2)));
    }

    #[test]
    fn test_activation_and_expiry() {
        let now = Utc::now();
        let mut at = ActionTrigger::new("t1", ThresholdType::MaxBalance, dec!(10), "ACT");
        assert!(at.is_active_at(now));
        at.activation_date = Some(now + Duration::hours(1));
        assert!(!at.is_active_at(now));
        at.expiration_date = Some(now - Duration::hours(1));
        assert!(at.is_expired_at(now));
    }

    #[test]
    fn test_record_sleep() {
        let now = Utc::now();
        let mut rec = ActionTriggerRecord {
            unique_id: "t1".into(),
            recurrent: true,
            last_execution_time: Some(now - Duration::seconds(10)),
            ..Default::default()
        };
        assert!(rec.is_sleeping(Duration::minutes(1), now));
        assert!(!rec.is_sleeping(Duration::seconds(5), now));
        rec.recurrent = false;
        assert!(!rec.is_sleeping(Duration::minutes(1), now));
    }
}
