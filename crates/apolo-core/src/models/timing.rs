//! Timing model
//!
//! A [`Timing`] is the catalog record describing when a rate or an action
//! applies: optional sets of years, months, month days and weekdays plus a
//! time of day. Inside rating plans and action plans it is carried as a
//! [`RITiming`], which adds the end of the daily window and the time
//! arithmetic used by the rating engine and the scheduler.
//!
//! Weekdays are numbered from Sunday (0) to Saturday (6). All calendar
//! evaluation is done in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::ASAP;

/// Catalog timing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Timing {
    pub tenant: String,
    pub name: String,
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default)]
    pub months: Vec<u32>,
    #[serde(default)]
    pub month_days: Vec<u32>,
    #[serde(default)]
    pub week_days: Vec<u32>,
    /// `HH:MM:SS`, blank for midnight or `*asap`
    #[serde(default)]
    pub start_time: String,
}

/// Timing as embedded in rating plans and action plans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RITiming {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default)]
    pub months: Vec<u32>,
    #[serde(default)]
    pub month_days: Vec<u32>,
    #[serde(default)]
    pub week_days: Vec<u32>,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
}

impl From<&Timing> for RITiming {
    fn from(t: &Timing) -> Self {
        Self {
            id: t.name.clone(),
            years: t.years.clone(),
            months: t.months.clone(),
            month_days: t.month_days.clone(),
            week_days: t.week_days.clone(),
            start_time: t.start_time.clone(),
            end_time: String::new(),
        }
    }
}

fn time_of_day(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap_or_default()
}

fn at_time(date: NaiveDate, tod: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(tod))
}

impl RITiming {
    /// A timing that is active all the time
    pub fn always() -> Self {
        Self {
            start_time: "00:00:00".to_string(),
            ..Default::default()
        }
    }

    /// Timing of an action to run as soon as possible
    pub fn asap() -> Self {
        Self {
            start_time: ASAP.to_string(),
            ..Default::default()
        }
    }

    pub fn is_asap(&self) -> bool {
        self.start_time == ASAP
    }

    /// True when no calendar restriction and no daily window is set
    pub fn is_blank(&self) -> bool {
        self.years.is_empty()
            && self.months.is_empty()
            && self.month_days.is_empty()
            && self.week_days.is_empty()
            && (self.start_time.is_empty() || self.start_time == "00:00:00")
            && self.end_time.is_empty()
    }

    /// Start of the daily window on the day of `t`
    pub fn left_margin(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let tod = if self.start_time.is_empty() || self.is_asap() {
            NaiveTime::default()
        } else {
            time_of_day(&self.start_time)
        };
        at_time(t.date_naive(), tod)
    }

    /// End of the daily window on the day of `t`; the next midnight when unset
    pub fn right_margin(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        if self.end_time.is_empty() {
            return at_time(t.date_naive(), NaiveTime::default()) + Duration::days(1);
        }
        at_time(t.date_naive(), time_of_day(&self.end_time)) + Duration::seconds(1)
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        (self.years.is_empty() || self.years.contains(&date.year()))
            && (self.months.is_empty() || self.months.contains(&date.month()))
            && (self.month_days.is_empty() || self.month_days.contains(&date.day()))
            && (self.week_days.is_empty()
                || self
                    .week_days
                    .contains(&date.weekday().num_days_from_sunday()))
    }

    /// True when `t` falls inside the timing
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        if !self.matches_day(t.date_naive()) {
            return false;
        }
        let tod = t.time().with_nanosecond(0).unwrap_or_else(|| t.time());
        if !self.start_time.is_empty() && !self.is_asap() && tod < time_of_day(&self.start_time) {
            return false;
        }
        if !self.end_time.is_empty() && tod > time_of_day(&self.end_time) {
            return false;
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    /// Containment used when splitting spans
    ///
    /// With `end_time` set an instant exactly at midnight is treated as the
    /// last second of the previous day.
    pub fn contains(&self, t: DateTime<Utc>, end_time: bool) -> bool {
        let t = if end_time && t.time() == NaiveTime::default() {
            t - Duration::seconds(1)
        } else {
            t
        };
        self.is_active_at(t)
    }

    /// First instant strictly after `now` at which the timing starts
    ///
    /// Unset fields are normalized first: a blank start time means midnight,
    /// years without months mean January and months without month days mean
    /// the first of the month. Returns `None` for `*asap` timings or when no
    /// match exists within the searched horizon.
    pub fn next_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_asap() {
            return None;
        }
        let mut timing = self.clone();
        if timing.start_time.is_empty() {
            timing.start_time = "00:00:00".to_string();
        }
        if !timing.years.is_empty() && timing.months.is_empty() {
            timing.months.push(1);
        }
        if !timing.months.is_empty() && timing.month_days.is_empty() {
            timing.month_days.push(1);
        }
        let tod = time_of_day(&timing.start_time);

        let horizon_years = timing
            .years
            .iter()
            .max()
            .map(|y| (y - now.year()).max(0) + 1)
            .unwrap_or(5);
        let max_days = i64::from(horizon_years) * 366 + 1;

        let mut date = now.date_naive();
        for _ in 0..=max_days {
            if timing.matches_day(date) {
                let candidate = at_time(date, tod);
                if candidate > now {
                    return Some(candidate);
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// Years, months or month days combined with weekdays
    pub fn mixes_calendar_and_weekdays(&self) -> bool {
        (!self.years.is_empty() || !self.months.is_empty() || !self.month_days.is_empty())
            && !self.week_days.is_empty()
    }
}
