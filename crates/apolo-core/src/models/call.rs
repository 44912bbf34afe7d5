//! Call descriptors and call costs
//!
//! A [`CallDescriptor`] describes the usage to rate or debit; the engine
//! answers with a [`CallCost`] listing the rated time spans.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::timespan::{repeat_duration, Increment, TimeSpan};
use crate::constants::{OUT, VOICE};
use crate::error::AppError;
use crate::utils::concat_key;
use crate::utils::dates::duration_serde;
use crate::utils::decimal::{duration_secs, round_global};
use crate::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDescriptor {
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default)]
    pub category: String,
    pub tenant: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub destination: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    /// Position of this request inside a session, 0 for the first
    #[serde(default)]
    pub loop_index: u32,
    /// Elapsed session duration at `time_end`
    #[serde(default, with = "duration_serde")]
    pub duration_index: Duration,
    #[serde(default = "default_tor")]
    pub tor: String,
    /// Highest acceptable price per `max_rate_unit`, zero for no cap
    #[serde(default)]
    pub max_rate: Decimal,
    #[serde(default, with = "duration_serde")]
    pub max_rate_unit: Duration,
    #[serde(default)]
    pub max_cost_so_far: Decimal,
    /// Refuse partial funding instead of shortening the call
    #[serde(default)]
    pub force_duration: bool,
    #[serde(default)]
    pub deny_negative: bool,
}

fn default_direction() -> String {
    OUT.to_string()
}

fn default_tor() -> String {
    VOICE.to_string()
}

impl CallDescriptor {
    pub fn new(tenant: &str, account: &str, destination: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            direction: default_direction(),
            category: String::new(),
            tenant: tenant.to_string(),
            subject: String::new(),
            account: account.to_string(),
            destination: destination.to_string(),
            time_start: start,
            time_end: end,
            loop_index: 0,
            duration_index: end - start,
            tor: default_tor(),
            max_rate: Decimal::ZERO,
            max_rate_unit: Duration::zero(),
            max_cost_so_far: Decimal::ZERO,
            force_duration: false,
            deny_negative: false,
        }
    }

    pub fn duration(&self) -> Duration {
        self.time_end - self.time_start
    }

    /// Account charged, defaulting to the subject
    pub fn account_name(&self) -> &str {
        if self.account.is_empty() {
            &self.subject
        } else {
            &self.account
        }
    }

    /// Subject rated, defaulting to the account
    pub fn subject_name(&self) -> &str {
        if self.subject.is_empty() {
            &self.account
        } else {
            &self.subject
        }
    }

    /// `tenant:account`
    pub fn account_key(&self) -> String {
        concat_key(&[&self.tenant, self.account_name()])
    }

    /// Reject requests missing the fields every rating needs
    pub fn validate(&self) -> AppResult<()> {
        if self.tenant.is_empty() {
            return Err(AppError::MandatoryMissing("tenant".to_string()));
        }
        if self.account_name().is_empty() {
            return Err(AppError::MandatoryMissing("account".to_string()));
        }
        if self.destination.is_empty() {
            return Err(AppError::MandatoryMissing("destination".to_string()));
        }
        if self.time_end < self.time_start {
            return Err(AppError::InvalidInput(format!(
                "time end {} before time start {}",
                self.time_end, self.time_start
            )));
        }
        Ok(())
    }

    /// Duration index when none was given
    pub fn effective_duration_index(&self) -> Duration {
        if self.duration_index < self.duration() {
            self.duration()
        } else {
            self.duration_index
        }
    }

    pub fn create_call_cost(&self) -> CallCost {
        CallCost {
            direction: self.direction.clone(),
            category: self.category.clone(),
            tenant: self.tenant.clone(),
            subject: self.subject_name().to_string(),
            account: self.account_name().to_string(),
            destination: self.destination.clone(),
            tor: self.tor.clone(),
            deduct_connect_fee: self.loop_index == 0,
            ..Default::default()
        }
    }

    /// Price per second allowed by the max rate cap, if any
    pub fn max_rate_per_second(&self) -> Option<Decimal> {
        if self.max_rate.is_zero() {
            return None;
        }
        let unit = if self.max_rate_unit.is_zero() {
            Duration::seconds(1)
        } else {
            self.max_rate_unit
        };
        Some(self.max_rate / duration_secs(unit))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CallCost {
    pub direction: String,
    pub category: String,
    pub tenant: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    pub tor: String,
    pub cost: Decimal,
    #[serde(default)]
    pub timespans: Vec<TimeSpan>,
    /// Rated duration in seconds
    #[serde(default)]
    pub rated_usage: Decimal,
    #[serde(default)]
    pub max_cost_disconnect: bool,
    #[serde(default)]
    pub not_enough_credit: bool,
    #[serde(skip)]
    pub deduct_connect_fee: bool,
    #[serde(skip)]
    pub negative_connect_fee: bool,
}

impl CallCost {
    /// Connect fee of the first span's rate
    pub fn connect_fee(&self) -> Decimal {
        self.timespans
            .first()
            .and_then(|ts| ts.rate_interval.as_ref())
            .map(|ri| ri.rating.connect_fee())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn first_increment_mut(&mut self) -> Option<&mut Increment> {
        self.timespans.first_mut()?.increments.first_mut()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.timespans.first().map(|ts| ts.time_start)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.timespans.last().map(|ts| ts.time_end)
    }

    pub fn duration(&self) -> Duration {
        self.timespans
            .iter()
            .fold(Duration::zero(), |acc, ts| acc + ts.duration())
    }

    pub fn update_rated_usage(&mut self) -> Duration {
        let d = self.duration();
        self.rated_usage = duration_secs(d);
        d
    }

    /// Recompute the cost including the connect fee
    pub fn update_cost(&mut self, decimals: u32) {
        self.deduct_connect_fee = true;
        self.refresh_cost(decimals);
    }

    /// Recompute span costs and the total, keeping the connect fee policy
    pub fn refresh_cost(&mut self, decimals: u32) {
        let mut cost = if self.deduct_connect_fee {
            self.connect_fee()
        } else {
            Decimal::ZERO
        };
        for ts in self.timespans.iter_mut() {
            ts.cost = ts.calculate_cost(decimals);
            cost += ts.cost;
        }
        self.cost = round_global(cost, decimals);
    }

    pub fn is_paid(&self) -> bool {
        self.timespans.iter().all(|ts| ts.is_paid().0)
    }

    pub fn merge(&mut self, other: CallCost) {
        self.cost += other.cost;
        self.timespans.extend(other.timespans);
    }

    /// Cut the cost back to `used`, returning the increments to refund
    ///
    /// Spans past `used` are removed whole; the last partially used span is
    /// split on an increment boundary. Increments that only partly fit in
    /// the unused time are kept.
    pub fn split_refund(&mut self, used: Duration, decimals: u32) -> Vec<Increment> {
        let mut to_refund = self.duration() - used;
        let mut refunds = Vec::new();
        while to_refund > Duration::zero() {
            let Some(ts) = self.timespans.last_mut() else {
                break;
            };
            let span_duration = ts.duration();
            if to_refund >= span_duration {
                if let Some(ts) = self.timespans.pop() {
                    refunds.extend(ts.increments.into_iter().rev());
                }
                to_refund = to_refund - span_duration;
                continue;
            }
            let step = ts.increment_duration();
            let whole = super::timespan::count_increments(to_refund, step);
            if whole > 0 {
                let index = ts.increment_count() - whole + 1;
                if let Some(tail) = ts.split_by_increment(index) {
                    refunds.extend(tail.increments.into_iter().rev());
                }
            }
            break;
        }
        self.refresh_cost(decimals);
        self.update_rated_usage();
        refunds
    }

    /// Post-action trigger ids keyed by account, split at `split`
    ///
    /// Ids fired by increments starting before `split` are returned in the
    /// first map, the rest in the second.
    pub fn post_action_triggers(
        &self,
        split: Duration,
    ) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, Vec<String>>) {
        let mut executed: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut unexecuted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut so_far = Duration::zero();
        for inc in self.timespans.iter().flat_map(|ts| ts.increments.iter()) {
            for (idx, ids) in &inc.post_atids {
                let started = so_far + repeat_duration(inc.duration, idx.saturating_sub(1));
                let target = if started < split {
                    &mut executed
                } else {
                    &mut unexecuted
                };
                target
                    .entry(inc.balance_info.account_id.clone())
                    .or_default()
                    .extend(ids.iter().cloned());
            }
            so_far = so_far + inc.total_duration();
        }
        (executed, unexecuted)
    }
}
