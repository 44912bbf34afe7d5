//! Cost engine
//!
//! Splits a call window into time spans, one per applicable rate interval,
//! and prices every span with a compressed billing increment. The split runs
//! in a fixed order: rating plan activation, day boundary (voice only), rate
//! interval and rate group, then a rounding pass that stretches spans to
//! whole increments.

use std::sync::Arc;

use apolo_core::constants::VOICE;
use apolo_core::models::timespan::remove_overlapped_from;
use apolo_core::models::{CallCost, CallDescriptor, RatingInfo, TimeSpan};
use apolo_core::{AppError, AppResult};
use apolo_store::Catalog;
use tracing::{debug, instrument};

use crate::resolver::RatingResolver;
use crate::settings::RatingSettings;

pub struct CostEngine {
    resolver: RatingResolver,
    settings: RatingSettings,
}

impl CostEngine {
    pub fn new(catalog: Arc<Catalog>, settings: RatingSettings) -> Self {
        Self {
            resolver: RatingResolver::new(catalog, settings.clone()),
            settings,
        }
    }

    pub fn settings(&self) -> &RatingSettings {
        &self.settings
    }

    /// Price `cd` without touching any account
    ///
    /// # Errors
    ///
    /// - `AppError::MandatoryMissing` / `AppError::InvalidInput` for malformed
    ///   descriptors
    /// - `AppError::UnauthorizedDestination` when the window cannot be rated
    /// - `AppError::RatingPlanInvalid` when a span finds no rate interval
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn get_cost(&self, cd: &CallDescriptor) -> AppResult<CallCost> {
        cd.validate()?;
        let mut cd = cd.clone();
        cd.duration_index = cd.effective_duration_index();

        let infos = self.resolver.resolve(&cd).await?;
        let spans = split_in_timespans(&cd, infos, self.settings.rounding_decimals)?;

        let mut cc = cd.create_call_cost();
        cc.timespans = spans;
        cc.refresh_cost(self.settings.rounding_decimals);
        cc.update_rated_usage();
        debug!("Rated {}s at {}", cc.rated_usage, cc.cost);
        Ok(cc)
    }
}

/// Split the window of `cd` into priced spans
///
/// `infos` must be continuous over the window, oldest activation first.
pub fn split_in_timespans(
    cd: &CallDescriptor,
    infos: Vec<RatingInfo>,
    decimals: u32,
) -> AppResult<Vec<TimeSpan>> {
    let infos: Vec<Arc<RatingInfo>> = infos.into_iter().map(Arc::new).collect();
    let first = infos
        .iter()
        .rposition(|info| info.activation_time <= cd.time_start)
        .unwrap_or(0);
    let Some(first_info) = infos.get(first) else {
        return Err(AppError::UnauthorizedDestination(cd.destination.clone()));
    };

    let mut head = TimeSpan::new(cd.time_start, cd.time_end);
    head.duration_index = cd.duration_index;
    head.set_rating_info(Arc::clone(first_info));
    let mut spans = vec![head];

    // 1. rating plan activations
    for info in infos.iter().skip(first + 1) {
        let Some(last) = spans.last_mut() else {
            break;
        };
        if let Some(mut tail) = last.split_by_rating_plan(info.activation_time) {
            tail.set_rating_info(Arc::clone(info));
            spans.push(tail);
        }
    }

    // 2. day boundaries
    if cd.tor == VOICE {
        let mut i = 0;
        while i < spans.len() {
            if let Some(tail) = spans[i].split_by_day() {
                spans.insert(i + 1, tail);
            }
            i += 1;
        }
    }

    // 3. rate intervals and rate groups
    let data = cd.tor != VOICE;
    let mut i = 0;
    while i < spans.len() {
        let Some(info) = spans[i].rating_info.clone() else {
            return Err(AppError::RatingPlanInvalid(format!(
                "no rating info for span starting {}",
                spans[i].time_start
            )));
        };
        let mut intervals = info.rate_intervals.clone();
        intervals.sort_by(|a, b| b.weight.cmp(&a.weight));

        let mut split = false;
        for interval in &intervals {
            if let Some(tail) = spans[i].split_by_rate_interval(interval, data) {
                spans.insert(i + 1, tail);
                split = true;
                break;
            }
        }
        if split {
            // the shortened head may now fit other intervals
            continue;
        }
        if spans[i].rate_interval.is_none() {
            return Err(AppError::RatingPlanInvalid(format!(
                "{}: no rate interval for {} at {}",
                info.rating_plan_id, info.matched_prefix, spans[i].time_start
            )));
        }
        i += 1;
    }

    // 4. whole increments
    if cd.duration() > chrono::Duration::zero() {
        let mut i = 0;
        while i < spans.len() {
            let increment = spans[i]
                .rate_interval
                .as_ref()
                .and_then(|ri| ri.rate_parameters(spans[i].group_start()))
                .map(|(_, increment, _)| increment);
            if let Some(increment) = increment {
                let end = spans[i].time_end;
                spans[i].round_to_duration(increment);
                if spans[i].time_end > end {
                    remove_overlapped_from(&mut spans, i);
                }
            }
            i += 1;
        }
    }

    for ts in spans.iter_mut() {
        ts.create_increments(decimals);
    }
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{at, catalog, interval, store_plan, store_profile, TENANT};
    use apolo_core::models::{RIRate, RITiming, RateInterval, RateSlot};
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn info(activation: chrono::DateTime<chrono::Utc>, intervals: Vec<RateInterval>) -> RatingInfo {
        RatingInfo {
            matched_subject: "*out:t1:call:rif".into(),
            rating_plan_id: "RP".into(),
            matched_prefix: "07".into(),
            matched_dest_id: "NAT".into(),
            activation_time: activation,
            rate_intervals: intervals,
            fallback_subjects: vec![],
        }
    }

    fn timed(start: &str, end: &str, price: Decimal, weight: Decimal) -> RateInterval {
        let mut ri = interval(price, 1, 1);
        ri.timing = RITiming {
            start_time: start.into(),
            end_time: end.into(),
            ..Default::default()
        };
        ri.weight = weight;
        ri
    }

    fn cd(start: chrono::DateTime<chrono::Utc>, end: chrono::DateTime<chrono::Utc>) -> CallDescriptor {
        let mut cd = CallDescriptor::new(TENANT, "rif", "0723", start, end);
        cd.category = "call".into();
        cd
    }

    #[test]
    fn test_single_span() {
        let spans = split_in_timespans(
            &cd(at(10, 0, 0), at(10, 2, 0)),
            vec![info(at(0, 0, 0), vec![interval(dec!(1), 60, 60)])],
            6,
        )
        .unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].cost, dec!(2));
        assert_eq!(spans[0].increments[0].compress_factor, 2);
        assert_eq!(spans[0].increments[0].duration, Duration::seconds(60));
    }

    #[test]
    fn test_peak_offpeak_split() {
        let peak = timed("08:00:00", "18:59:59", dec!(0.2), dec!(10));
        let off = timed("19:00:00", "", dec!(0.1), dec!(10));
        let spans = split_in_timespans(
            &cd(at(18, 59, 30), at(19, 0, 30)),
            vec![info(at(0, 0, 0), vec![peak, off])],
            6,
        )
        .unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].time_end, at(19, 0, 0));
        assert_eq!(spans[0].cost, dec!(6));
        assert_eq!(spans[1].cost, dec!(3));
    }

    #[test]
    fn test_boundary_end_not_split() {
        let peak = timed("08:00:00", "18:59:59", dec!(0.2), dec!(10));
        let off = timed("19:00:00", "", dec!(0.1), dec!(10));
        let spans = split_in_timespans(
            &cd(at(18, 59, 0), at(19, 0, 0)),
            vec![info(at(0, 0, 0), vec![peak, off])],
            6,
        )
        .unwrap();
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn test_group_interval_split() {
        let mut first = RateSlot::new(Duration::zero(), dec!(0.2), Duration::seconds(60), Duration::seconds(60));
        first.connect_fee = dec!(0.1);
        let second = RateSlot::new(Duration::seconds(60), dec!(0.6), Duration::seconds(60), Duration::seconds(1));
        let ri = RateInterval::new(RITiming::always(), RIRate::with_slots(vec![first, second]), Decimal::ZERO);
        let spans = split_in_timespans(
            &cd(at(10, 0, 0), at(10, 2, 0)),
            vec![info(at(0, 0, 0), vec![ri])],
            6,
        )
        .unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].cost, dec!(0.2));
        assert_eq!(spans[1].cost, dec!(0.6));
        assert_eq!(spans[1].increments[0].compress_factor, 60);
    }

    #[test]
    fn test_activation_split() {
        let spans = split_in_timespans(
            &cd(at(10, 0, 0), at(10, 2, 0)),
            vec![
                info(at(0, 0, 0), vec![interval(dec!(1), 60, 60)]),
                info(at(10, 1, 0), vec![interval(dec!(2), 60, 60)]),
            ],
            6,
        )
        .unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].cost, dec!(1));
        assert_eq!(spans[1].cost, dec!(2));
        assert_eq!(spans[1].time_start, at(10, 1, 0));
    }

    #[test]
    fn test_short_span_extended() {
        let spans = split_in_timespans(
            &cd(at(10, 0, 0), at(10, 0, 20)),
            vec![info(at(0, 0, 0), vec![interval(dec!(1), 60, 60)])],
            6,
        )
        .unwrap();
        assert_eq!(spans[0].time_end, at(10, 1, 0));
        assert_eq!(spans[0].duration_index, Duration::seconds(60));
        assert_eq!(spans[0].cost, dec!(1));
    }

    #[test]
    fn test_extension_trims_next_span() {
        let spans = split_in_timespans(
            &cd(at(10, 0, 0), at(10, 1, 30)),
            vec![
                info(at(0, 0, 0), vec![interval(dec!(1), 60, 60)]),
                info(at(10, 0, 30), vec![interval(dec!(1), 1, 1)]),
            ],
            6,
        )
        .unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].time_end, at(10, 1, 0));
        assert_eq!(spans[1].time_start, at(10, 1, 0));
        assert_eq!(spans[1].cost, dec!(30));
    }

    #[test]
    fn test_day_split() {
        let start = at(23, 59, 30);
        let spans = split_in_timespans(
            &cd(start, start + Duration::seconds(60)),
            vec![info(at(0, 0, 0), vec![interval(dec!(1), 1, 1)])],
            6,
        )
        .unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].duration(), Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_get_cost_with_connect_fee() {
        let catalog = catalog();
        let mut ri = interval(dec!(0.1), 1, 1);
        ri.rating.slots[0].connect_fee = dec!(0.15);
        store_plan(&catalog, "RP_NAT", &[("07", "NAT")], &[ri]).await;
        store_profile(&catalog, "rif", &[(at(0, 0, 0), "RP_NAT", &[])]).await;
        let engine = CostEngine::new(catalog, RatingSettings::default());

        let cc = engine.get_cost(&cd(at(10, 0, 0), at(10, 0, 10))).await.unwrap();
        assert_eq!(cc.cost, dec!(1.15));
        assert_eq!(cc.rated_usage, dec!(10));
        assert_eq!(cc.timespans[0].matched_dest_id, "NAT");

        let mut next = cd(at(10, 0, 10), at(10, 0, 20));
        next.loop_index = 1;
        assert_eq!(engine.get_cost(&next).await.unwrap().cost, dec!(1));
    }

    #[tokio::test]
    async fn test_get_cost_validates() {
        let engine = CostEngine::new(catalog(), RatingSettings::default());
        let mut bad = cd(at(10, 0, 0), at(10, 0, 10));
        bad.destination.clear();
        let err = engine.get_cost(&bad).await.unwrap_err();
        assert_eq!(err.error_code(), "mandatory_missing");
    }
}
