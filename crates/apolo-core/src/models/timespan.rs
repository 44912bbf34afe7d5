//! Time spans and billing increments
//!
//! A call is rated as an ordered list of [`TimeSpan`]s, each bound to a single
//! [`RateInterval`]. Every span carries its billing increments in compressed
//! form: a group stands for `compress_factor` identical increments funded by
//! the same balances.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::rate::RateInterval;
use super::rating_plan::RatingInfo;
use crate::utils::dates::duration_serde;
use crate::utils::decimal::{round, RoundingMethod};

/// Unit balance that funded an increment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UnitInfo {
    pub uuid: String,
    pub id: String,
    /// Balance value after the debit
    pub value: Decimal,
    #[serde(default)]
    pub destination_id: String,
    /// Units consumed per increment
    pub consumed: Decimal,
    pub tor: String,
    #[serde(default)]
    pub rate_interval: Option<RateInterval>,
}

/// Monetary balance that funded an increment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MonetaryInfo {
    pub uuid: String,
    pub id: String,
    /// Balance value after the debit
    pub value: Decimal,
    #[serde(default)]
    pub rate_interval: Option<RateInterval>,
}

/// Provenance of an increment payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DebitInfo {
    #[serde(default)]
    pub unit: Option<UnitInfo>,
    #[serde(default)]
    pub monetary: Option<MonetaryInfo>,
    /// Name of the account owning the funding balances
    #[serde(default)]
    pub account_id: String,
}

impl DebitInfo {
    pub fn for_account(account: &str) -> Self {
        Self {
            account_id: account.to_string(),
            ..Default::default()
        }
    }

    /// Same funding balances, ignoring post-debit values
    pub fn same_source(&self, other: &DebitInfo) -> bool {
        self.account_id == other.account_id
            && self.unit.as_ref().map(|u| (&u.uuid, u.consumed))
                == other.unit.as_ref().map(|u| (&u.uuid, u.consumed))
            && self.monetary.as_ref().map(|m| &m.uuid) == other.monetary.as_ref().map(|m| &m.uuid)
    }
}

/// A group of identical billing increments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Increment {
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub cost: Decimal,
    #[serde(default)]
    pub balance_info: DebitInfo,
    pub compress_factor: u32,
    /// Trigger ids fired while paying, keyed by index within the group
    #[serde(default)]
    pub post_atids: BTreeMap<u32, Vec<String>>,
    #[serde(default)]
    pub paid: u32,
}

impl Increment {
    pub fn new(duration: Duration, cost: Decimal, compress_factor: u32) -> Self {
        Self {
            duration,
            cost,
            compress_factor,
            ..Default::default()
        }
    }

    pub fn total_cost(&self) -> Decimal {
        self.cost * Decimal::from(self.compress_factor)
    }

    pub fn total_duration(&self) -> Duration {
        repeat_duration(self.duration, self.compress_factor)
    }

    pub fn add_post_atids(&mut self, index: u32, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        self.post_atids.entry(index).or_default().extend(ids);
    }

    /// Append one paid increment, merging it into the last group when the
    /// funding source and cost are unchanged
    pub fn push_compressed(
        groups: &mut Vec<Increment>,
        duration: Duration,
        cost: Decimal,
        info: DebitInfo,
        post_atids: Vec<String>,
    ) {
        Self::push_run(groups, duration, cost, info, post_atids, 1);
    }

    /// Append `n` paid increments funded alike
    ///
    /// `post_atids` belong to the last increment of the run.
    pub fn push_run(
        groups: &mut Vec<Increment>,
        duration: Duration,
        cost: Decimal,
        info: DebitInfo,
        post_atids: Vec<String>,
        n: u32,
    ) {
        if n == 0 {
            return;
        }
        if let Some(last) = groups.last_mut() {
            if last.cost == cost && last.duration == duration && last.balance_info.same_source(&info) {
                if let Some(total) = last.compress_factor.checked_add(n) {
                    last.compress_factor = total;
                    last.paid = last.paid.saturating_add(n);
                    last.balance_info = info;
                    last.add_post_atids(total, post_atids);
                    return;
                }
            }
        }
        let mut inc = Increment::new(duration, cost, n);
        inc.paid = n;
        inc.balance_info = info;
        inc.add_post_atids(n, post_atids);
        groups.push(inc);
    }

    /// Split after `keep` increments, returning the tail group
    fn split_off(&mut self, keep: u32) -> Increment {
        let mut tail = self.clone();
        tail.compress_factor = self.compress_factor - keep;
        tail.paid = self.paid.saturating_sub(keep);
        tail.post_atids = self
            .post_atids
            .iter()
            .filter(|(idx, _)| **idx > keep)
            .map(|(idx, ids)| (idx - keep, ids.clone()))
            .collect();
        self.compress_factor = keep;
        self.paid = self.paid.min(keep);
        self.post_atids.retain(|idx, _| *idx <= keep);
        tail
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TimeSpan {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub cost: Decimal,
    #[serde(default)]
    pub rate_interval: Option<RateInterval>,
    /// Elapsed call duration at the end of this span
    #[serde(with = "duration_serde")]
    pub duration_index: Duration,
    #[serde(default)]
    pub increments: Vec<Increment>,
    /// Increments past this index were granted free by the max-cost policy
    #[serde(default)]
    pub max_cost_free_index: Option<u32>,
    #[serde(default)]
    pub matched_subject: String,
    #[serde(default)]
    pub matched_prefix: String,
    #[serde(default)]
    pub matched_dest_id: String,
    #[serde(default)]
    pub rating_plan_id: String,
    #[serde(skip)]
    pub rating_info: Option<Arc<RatingInfo>>,
}

impl TimeSpan {
    pub fn new(time_start: DateTime<Utc>, time_end: DateTime<Utc>) -> Self {
        Self {
            time_start,
            time_end,
            ..Default::default()
        }
    }

    pub fn duration(&self) -> Duration {
        self.time_end - self.time_start
    }

    /// Strictly inside the span
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t > self.time_start && t < self.time_end
    }

    pub fn set_rating_info(&mut self, info: Arc<RatingInfo>) {
        self.matched_subject = info.matched_subject.clone();
        self.matched_prefix = info.matched_prefix.clone();
        self.matched_dest_id = info.matched_dest_id.clone();
        self.rating_plan_id = info.rating_plan_id.clone();
        self.rating_info = Some(info);
    }

    fn copy_rating_info(&mut self, other: &TimeSpan) {
        self.matched_subject = other.matched_subject.clone();
        self.matched_prefix = other.matched_prefix.clone();
        self.matched_dest_id = other.matched_dest_id.clone();
        self.rating_plan_id = other.rating_plan_id.clone();
        self.rating_info = other.rating_info.clone();
    }

    /// Elapsed call duration at the start of this span
    pub fn group_start(&self) -> Duration {
        (self.duration_index - self.duration()).max(Duration::zero())
    }

    pub fn group_end(&self) -> Duration {
        self.duration_index
    }

    /// Cut the span at `t`, returning the tail
    ///
    /// The tail keeps the original duration index and the rating info; the
    /// head's index is reduced by the tail duration.
    pub fn split_at(&mut self, t: DateTime<Utc>) -> TimeSpan {
        let mut tail = TimeSpan::new(t, self.time_end);
        tail.copy_rating_info(self);
        tail.duration_index = self.duration_index;
        self.time_end = t;
        self.duration_index = (self.duration_index - tail.duration()).max(Duration::zero());
        tail
    }

    /// Split where a later rating activation starts inside the span
    pub fn split_by_rating_plan(&mut self, activation: DateTime<Utc>) -> Option<TimeSpan> {
        if !self.contains(activation) {
            return None;
        }
        Some(self.split_at(activation))
    }

    /// Split at the first midnight inside the span
    pub fn split_by_day(&mut self) -> Option<TimeSpan> {
        let next_midnight = self
            .time_start
            .date_naive()
            .succ_opt()?
            .and_time(NaiveTime::default())
            .and_utc();
        if next_midnight >= self.time_end {
            return None;
        }
        Some(self.split_at(next_midnight))
    }

    /// Attach `interval` unless the current one is preferable
    ///
    /// Preference order: higher weight, then the closest left margin to the
    /// span start, then the lower price. Intervals starting after the span
    /// start are never used.
    pub fn set_rate_interval(&mut self, interval: &RateInterval) {
        let other_distance = self.time_start - interval.timing.left_margin(self.time_start);
        if other_distance < Duration::zero() {
            return;
        }
        let replace = match &self.rate_interval {
            None => true,
            Some(own) if own.weight != interval.weight => own.weight < interval.weight,
            Some(own) => {
                let own_distance = self.time_start - own.timing.left_margin(self.time_start);
                if own_distance != other_distance {
                    own_distance > other_distance
                } else {
                    let gs = self.group_start();
                    let own_price = own.rate_parameters(gs).map(|p| p.0);
                    let other_price = interval.rate_parameters(gs).map(|p| p.0);
                    matches!((own_price, other_price), (Some(a), Some(b)) if b < a)
                }
            }
        };
        if replace {
            self.rate_interval = Some(interval.clone());
        }
    }

    /// Split the span against `interval`, returning the new tail if any
    ///
    /// Splits on the next rate group start inside the span first, then on the
    /// interval's right margin (start covered) or left margin (end covered).
    /// Data spans are never split by time of day.
    pub fn split_by_rate_interval(&mut self, interval: &RateInterval, data: bool) -> Option<TimeSpan> {
        let start_in = interval.contains(self.time_start, false);
        let end_in = interval.contains(self.time_end, true);
        if !start_in && !end_in {
            return None;
        }
        let mut slots: Vec<Duration> = interval.group_starts().collect();
        slots.sort();
        for group_start in slots {
            if self.group_start() < group_start && self.group_end() > group_start {
                self.set_rate_interval(interval);
                let split = self.time_start + (group_start - self.group_start());
                let mut tail = self.split_at(split);
                tail.set_rate_interval(interval);
                return Some(tail);
            }
        }
        if data {
            if start_in {
                self.set_rate_interval(interval);
            }
            return None;
        }
        if start_in && end_in {
            self.set_rate_interval(interval);
            return None;
        }
        if start_in {
            let split = interval.timing.right_margin(self.time_start);
            self.set_rate_interval(interval);
            if split <= self.time_start || split >= self.time_end {
                return None;
            }
            return Some(self.split_at(split));
        }
        let split = interval.timing.left_margin(self.time_start);
        if split <= self.time_start || split >= self.time_end {
            return None;
        }
        let mut tail = self.split_at(split);
        tail.set_rate_interval(interval);
        Some(tail)
    }

    /// Extend or round the span so it covers whole increments of `increment`
    pub fn round_to_duration(&mut self, increment: Duration) {
        let current = self.duration();
        let mut target = increment;
        if increment < current {
            target = round_up_duration(current, increment);
        }
        if target > current {
            self.time_end = self.time_start + target;
            self.duration_index = self.duration_index + (target - current);
        }
    }

    /// Build the compressed increment from the rate interval
    pub fn create_increments(&mut self, decimals: u32) {
        self.increments.clear();
        self.max_cost_free_index = None;
        let Some(interval) = &self.rate_interval else {
            return;
        };
        let group_start = self.group_start();
        let increment = interval
            .rate_parameters(group_start)
            .map(|(_, inc, _)| inc)
            .unwrap_or_else(|| Duration::seconds(1));
        let count = count_increments(self.duration(), increment);
        if count == 0 {
            self.cost = Decimal::ZERO;
            return;
        }
        let n = Decimal::from(count);
        let span_cost = interval.cost(self.duration(), group_start, decimals);
        let inc_cost = round(span_cost / n, decimals, RoundingMethod::Middle);
        self.increments.push(Increment::new(increment, inc_cost, count));
        self.cost = inc_cost * n;
    }

    /// Span cost from its increments, or from the interval when none exist
    pub fn calculate_cost(&self, decimals: u32) -> Decimal {
        if self.increments.is_empty() {
            return self
                .rate_interval
                .as_ref()
                .map(|ri| ri.cost(self.duration(), self.group_start(), decimals))
                .unwrap_or(Decimal::ZERO);
        }
        self.increments.iter().map(Increment::total_cost).sum()
    }

    pub fn increment_count(&self) -> u32 {
        self.increments.iter().map(|i| i.compress_factor).sum()
    }

    pub fn increment_duration(&self) -> Duration {
        self.increments
            .first()
            .map(|i| i.duration)
            .unwrap_or_else(Duration::zero)
    }

    /// Fully paid flag and the first unpaid increment index
    pub fn is_paid(&self) -> (bool, u32) {
        let count = self.increment_count();
        if count == 0 {
            return (false, 0);
        }
        let paid: u32 = self.increments.iter().map(|i| i.paid).sum();
        if paid < count {
            return (false, paid + 1);
        }
        (true, count)
    }

    /// Split before the 1-based increment `index`, returning the tail
    pub fn split_by_increment(&mut self, index: u32) -> Option<TimeSpan> {
        let keep = index.checked_sub(1)?;
        let count = self.increment_count();
        if keep == 0 || keep >= count {
            return None;
        }
        let split = self.time_start + repeat_duration(self.increment_duration(), keep);
        let mut tail = self.split_at(split);
        tail.rate_interval = self.rate_interval.clone();

        let mut remaining = keep;
        let mut head_groups = Vec::new();
        let mut tail_groups = Vec::new();
        for mut group in std::mem::take(&mut self.increments) {
            if remaining == 0 {
                tail_groups.push(group);
            } else if group.compress_factor <= remaining {
                remaining -= group.compress_factor;
                head_groups.push(group);
            } else {
                let rest = group.split_off(remaining);
                remaining = 0;
                head_groups.push(group);
                tail_groups.push(rest);
            }
        }
        self.increments = head_groups;
        tail.increments = tail_groups;
        if let Some(free) = self.max_cost_free_index {
            if free >= keep {
                tail.max_cost_free_index = Some(free - keep);
                self.max_cost_free_index = None;
            }
        }
        self.cost = self.increments.iter().map(Increment::total_cost).sum();
        tail.cost = tail.increments.iter().map(Increment::total_cost).sum();
        Some(tail)
    }
}

/// Number of whole increments in `duration`
pub fn count_increments(duration: Duration, increment: Duration) -> u32 {
    let (Some(d), Some(i)) = (duration.num_nanoseconds(), increment.num_nanoseconds()) else {
        return 0;
    };
    if i <= 0 || d <= 0 {
        return 0;
    }
    u32::try_from(d / i).unwrap_or(u32::MAX)
}

/// `d` repeated `n` times, saturating instead of wrapping
pub fn repeat_duration(d: Duration, n: u32) -> Duration {
    let times = i64::from(n);
    d.num_nanoseconds()
        .and_then(|ns| ns.checked_mul(times))
        .map(Duration::nanoseconds)
        .or_else(|| {
            d.num_milliseconds()
                .checked_mul(times)
                .map(Duration::milliseconds)
        })
        .unwrap_or_else(|| Duration::milliseconds(i64::MAX))
}

/// Round `d` up to a multiple of `step`
pub fn round_up_duration(d: Duration, step: Duration) -> Duration {
    let (Some(d_ns), Some(s_ns)) = (d.num_nanoseconds(), step.num_nanoseconds()) else {
        return d;
    };
    if s_ns <= 0 || d_ns % s_ns == 0 {
        return d;
    }
    Duration::nanoseconds((d_ns / s_ns + 1) * s_ns)
}

/// Drop the spans fully covered by the span at `index` and trim the next one
pub fn remove_overlapped_from(spans: &mut Vec<TimeSpan>, index: usize) {
    let Some(end) = spans.get(index).map(|ts| ts.time_end) else {
        return;
    };
    let mut i = index + 1;
    while i < spans.len() {
        if spans[i].time_end <= end {
            spans.remove(i);
        } else {
            if spans[i].time_start < end {
                spans[i].time_start = end;
            }
            break;
        }
    }
}
