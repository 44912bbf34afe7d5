//! Rating plans and rating profiles
//!
//! A [`RatingPlan`] stores deduplicated timing and rating tables and, per
//! destination code, the set of `(timing, rating, weight)` triples that apply.
//! A [`RatingProfile`] activates plans over time for a
//! `(direction, tenant, category, subject)` tuple.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::rate::{RIRate, RateInterval};
use super::timing::RITiming;
use crate::error::AppError;
use crate::utils::concat_key;
use crate::AppResult;

fn short_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}

/// Reference triple stored per destination code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DRate {
    pub timing: String,
    pub rating: String,
    pub weight: Decimal,
}

/// Rates bound to one destination code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DRateHelper {
    pub d_rate_keys: BTreeSet<String>,
    /// Destination name the code was bound through
    pub code_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RatingPlan {
    pub tenant: String,
    pub name: String,
    #[serde(default)]
    pub timings: BTreeMap<String, RITiming>,
    #[serde(default)]
    pub ratings: BTreeMap<String, RIRate>,
    #[serde(default)]
    pub d_rates: BTreeMap<String, DRate>,
    #[serde(default)]
    pub destination_rates: BTreeMap<String, DRateHelper>,
}

impl RatingPlan {
    pub fn new(tenant: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Bind rate intervals to a destination code
    ///
    /// Identical timings and ratings are stored once and shared between
    /// codes.
    pub fn add_rate_interval(&mut self, code: &str, code_name: &str, intervals: &[RateInterval]) {
        for ri in intervals {
            let timing_key = short_hash(&format!("{:?}", ri.timing));
            self.timings
                .entry(timing_key.clone())
                .or_insert_with(|| ri.timing.clone());

            let rating_key = short_hash(&ri.rating.stringify());
            self.ratings
                .entry(rating_key.clone())
                .or_insert_with(|| ri.rating.clone());

            let drate_key = short_hash(&format!("{}{}{}", timing_key, rating_key, ri.weight));
            self.d_rates.entry(drate_key.clone()).or_insert(DRate {
                timing: timing_key,
                rating: rating_key,
                weight: ri.weight,
            });

            let helper = self.destination_rates.entry(code.to_string()).or_default();
            helper.code_name = code_name.to_string();
            helper.d_rate_keys.insert(drate_key);
        }
    }

    /// Rate intervals bound to `code`, with the destination name
    pub fn rate_interval_list(&self, code: &str) -> Option<(Vec<RateInterval>, &str)> {
        let helper = self.destination_rates.get(code)?;
        let intervals = helper
            .d_rate_keys
            .iter()
            .filter_map(|key| self.d_rates.get(key))
            .filter_map(|dr| {
                let timing = self.timings.get(&dr.timing)?;
                let rating = self.ratings.get(&dr.rating)?;
                Some(RateInterval::new(timing.clone(), rating.clone(), dr.weight))
            })
            .collect();
        Some((intervals, helper.code_name.as_str()))
    }

    /// Codes whose weekday timings leave part of the week uncovered
    ///
    /// Timings restricted by calendar dates or starting after midnight are
    /// not considered when checking coverage.
    pub fn uncontinuous_codes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for (code, helper) in &self.destination_rates {
            let mut weekdays = BTreeSet::new();
            let mut blank = false;
            for key in &helper.d_rate_keys {
                let Some(timing) = self.d_rates.get(key).and_then(|dr| self.timings.get(&dr.timing))
                else {
                    continue;
                };
                if timing.is_blank() {
                    blank = true;
                    break;
                }
                if !timing.years.is_empty()
                    || !timing.months.is_empty()
                    || !timing.month_days.is_empty()
                {
                    continue;
                }
                if !timing.start_time.is_empty() && timing.start_time != "00:00:00" {
                    continue;
                }
                if timing.week_days.is_empty() {
                    blank = true;
                    break;
                }
                weekdays.extend(timing.week_days.iter().copied());
            }
            if !blank && (0..7).any(|d| !weekdays.contains(&d)) {
                out.push(code.as_str());
            }
        }
        out
    }

    /// Reject plans the engine cannot rate consistently
    pub fn validate(&self) -> AppResult<()> {
        if let Some(code) = self.uncontinuous_codes().first() {
            return Err(AppError::RatingPlanInvalid(format!(
                "{}: destination {} is not covered for the whole week",
                self.name, code
            )));
        }
        for (key, rating) in &self.ratings {
            if let Some(slot) = rating.first_unsane_slot() {
                return Err(AppError::RatingPlanInvalid(format!(
                    "{}: rating {} has an unsane slot starting at {}s",
                    self.name,
                    key,
                    slot.group_interval_start.num_seconds()
                )));
            }
        }
        for (key, timing) in &self.timings {
            if timing.mixes_calendar_and_weekdays() {
                return Err(AppError::RatingPlanInvalid(format!(
                    "{}: timing {} mixes calendar dates with weekdays",
                    self.name, key
                )));
            }
        }
        Ok(())
    }
}

/// One time-versioned plan activation of a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingPlanActivation {
    pub activation_time: DateTime<Utc>,
    pub rating_plan_id: String,
    #[serde(default)]
    pub fallback_subjects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RatingProfile {
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub activations: Vec<RatingPlanActivation>,
}

impl RatingProfile {
    /// `direction:tenant:category:subject`
    pub fn full_id(&self) -> String {
        concat_key(&[&self.direction, &self.tenant, &self.category, &self.subject])
    }

    /// Key within the tenant: `direction:category:subject`
    pub fn profile_key(direction: &str, category: &str, subject: &str) -> String {
        concat_key(&[direction, category, subject])
    }

    /// Activations overlapping `[start, end)`, oldest first
    ///
    /// Includes the last activation at or before `start` and every later
    /// activation before `end`.
    pub fn active_for_call(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&RatingPlanActivation> {
        let mut sorted: Vec<&RatingPlanActivation> = self.activations.iter().collect();
        sorted.sort_by_key(|a| a.activation_time);

        let first = sorted
            .iter()
            .rposition(|a| a.activation_time <= start)
            .unwrap_or(0);
        sorted
            .into_iter()
            .skip(first)
            .take_while(|a| a.activation_time < end)
            .collect()
    }
}

/// Rating data resolved for one segment of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RatingInfo {
    pub matched_subject: String,
    pub rating_plan_id: String,
    pub matched_prefix: String,
    pub matched_dest_id: String,
    pub activation_time: DateTime<Utc>,
    #[serde(default)]
    pub rate_intervals: Vec<RateInterval>,
    #[serde(default)]
    pub fallback_subjects: Vec<String>,
}

impl RatingInfo {
    /// True when the segment can be rated
    pub fn is_rated(&self) -> bool {
        !self.rate_intervals.is_empty()
    }
}
