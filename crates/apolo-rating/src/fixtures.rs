//! Catalog builders shared by the unit tests

use std::sync::Arc;
use std::time::Duration as StdDuration;

use apolo_core::models::{
    RIRate, RITiming, RateInterval, RateSlot, RatingPlan, RatingPlanActivation, RatingProfile,
};
use apolo_store::{Catalog, MemoryStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;

pub const TENANT: &str = "t1";

pub fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::new(
        Arc::new(MemoryStore::new()),
        StdDuration::from_millis(100),
    ))
}

/// 2013-10-21 (a Monday) at the given time
pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2013, 10, 21, h, m, s).unwrap()
}

pub fn interval(price: Decimal, unit_secs: i64, increment_secs: i64) -> RateInterval {
    RateInterval::new(
        RITiming::always(),
        RIRate::with_slots(vec![RateSlot::new(
            Duration::zero(),
            price,
            Duration::seconds(unit_secs),
            Duration::seconds(increment_secs),
        )]),
        Decimal::ZERO,
    )
}

/// Store a plan binding `intervals` to each `(code, name)`
pub async fn store_plan(
    catalog: &Catalog,
    name: &str,
    codes: &[(&str, &str)],
    intervals: &[RateInterval],
) {
    let mut plan = RatingPlan::new(TENANT, name);
    for (code, dest) in codes {
        plan.add_rate_interval(code, dest, intervals);
    }
    catalog.set(&plan).await.unwrap();
}

/// Store a `*out` call profile for `subject`
pub async fn store_profile(catalog: &Catalog, subject: &str, activations: &[(DateTime<Utc>, &str, &[&str])]) {
    let profile = RatingProfile {
        direction: "*out".into(),
        tenant: TENANT.into(),
        category: "call".into(),
        subject: subject.into(),
        activations: activations
            .iter()
            .map(|(time, plan, fallbacks)| RatingPlanActivation {
                activation_time: *time,
                rating_plan_id: plan.to_string(),
                fallback_subjects: fallbacks.iter().map(|s| s.to_string()).collect(),
            })
            .collect(),
    };
    catalog.set(&profile).await.unwrap();
}
