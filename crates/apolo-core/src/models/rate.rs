//! Rate models
//!
//! A [`Rate`] is an ordered list of [`RateSlot`]s. Each slot applies from a
//! group interval start, measured as elapsed call time, and prices usage as
//! `value` per `rate_unit`, billed in steps of `rate_increment`.
//!
//! A [`DestinationRate`] binds destination names to rates together with the
//! max-cost policy and an optional rounding override. Inside a rating plan
//! the pair (timing, rating) becomes a [`RateInterval`].

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::timing::RITiming;
use crate::utils::dates::duration_serde;
use crate::utils::decimal::{duration_ratio, duration_secs, round, RoundingMethod};

/// One price step of a rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RateSlot {
    #[serde(with = "duration_serde", default = "Duration::zero")]
    pub group_interval_start: Duration,
    pub value: Decimal,
    #[serde(with = "duration_serde", default = "Duration::zero")]
    pub rate_unit: Duration,
    #[serde(with = "duration_serde", default = "Duration::zero")]
    pub rate_increment: Duration,
    #[serde(default)]
    pub connect_fee: Decimal,
}

impl RateSlot {
    pub fn new(
        group_interval_start: Duration,
        value: Decimal,
        rate_unit: Duration,
        rate_increment: Duration,
    ) -> Self {
        Self {
            group_interval_start,
            value,
            rate_unit,
            rate_increment,
            connect_fee: Decimal::ZERO,
        }
    }
}

/// Catalog rate record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Rate {
    pub tenant: String,
    pub name: String,
    pub slots: Vec<RateSlot>,
}

/// What happens once a call reaches its max cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MaxCostStrategy {
    #[default]
    #[serde(rename = "")]
    None,
    /// Remaining increments are free
    #[serde(rename = "*free")]
    Free,
    /// The call is stopped
    #[serde(rename = "*disconnect")]
    Disconnect,
}

/// Binding of one destination name to a rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DestinationRateBinding {
    pub destination_name: String,
    pub rate_name: String,
    #[serde(default)]
    pub max_cost: Decimal,
    #[serde(default)]
    pub max_cost_strategy: MaxCostStrategy,
    #[serde(default)]
    pub rounding_method: Option<RoundingMethod>,
    #[serde(default)]
    pub rounding_decimals: Option<u32>,
}

/// Catalog destination rate record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DestinationRate {
    pub tenant: String,
    pub name: String,
    pub bindings: Vec<DestinationRateBinding>,
}

/// Rating data of an interval: slots plus the binding policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RIRate {
    pub slots: Vec<RateSlot>,
    #[serde(default)]
    pub max_cost: Decimal,
    #[serde(default)]
    pub max_cost_strategy: MaxCostStrategy,
    #[serde(default)]
    pub rounding_method: Option<RoundingMethod>,
    #[serde(default)]
    pub rounding_decimals: Option<u32>,
}

impl RIRate {
    /// Build from a catalog rate and its destination binding
    pub fn from_binding(rate: &Rate, binding: &DestinationRateBinding) -> Self {
        let mut slots = rate.slots.clone();
        slots.sort_by_key(|s| s.group_interval_start);
        Self {
            slots,
            max_cost: binding.max_cost,
            max_cost_strategy: binding.max_cost_strategy,
            rounding_method: binding.rounding_method,
            rounding_decimals: binding.rounding_decimals,
        }
    }

    pub fn with_slots(mut slots: Vec<RateSlot>) -> Self {
        slots.sort_by_key(|s| s.group_interval_start);
        Self {
            slots,
            ..Default::default()
        }
    }

    /// Connect fee charged once per call
    pub fn connect_fee(&self) -> Decimal {
        self.slots
            .first()
            .map(|s| s.connect_fee)
            .unwrap_or(Decimal::ZERO)
    }

    /// Stable identifier used to deduplicate ratings inside a plan
    pub fn stringify(&self) -> String {
        let mut out = format!(
            "{}{:?}{:?}{:?}",
            self.max_cost, self.max_cost_strategy, self.rounding_method, self.rounding_decimals
        );
        for s in &self.slots {
            out.push_str(&format!(
                "{}{}{}{}{}",
                s.group_interval_start.num_nanoseconds().unwrap_or_default(),
                s.value,
                s.rate_unit.num_nanoseconds().unwrap_or_default(),
                s.rate_increment.num_nanoseconds().unwrap_or_default(),
                s.connect_fee
            ));
        }
        out
    }

    /// First slot breaking plan sanity, if any
    ///
    /// Group starts must strictly increase and each one must be a multiple
    /// of the previous slot's increment. Units and increments must be set.
    pub fn first_unsane_slot(&self) -> Option<&RateSlot> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.rate_unit <= Duration::zero() || slot.rate_increment <= Duration::zero() {
                return Some(slot);
            }
            if let Some(next) = self.slots.get(i + 1) {
                if next.group_interval_start <= slot.group_interval_start {
                    return Some(next);
                }
                let inc = duration_secs(slot.rate_increment);
                if !(duration_secs(next.group_interval_start) % inc).is_zero() {
                    return Some(next);
                }
            }
        }
        None
    }
}

/// A timing paired with its rating and weight inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RateInterval {
    pub timing: RITiming,
    pub rating: RIRate,
    #[serde(default)]
    pub weight: Decimal,
}

impl RateInterval {
    pub fn new(timing: RITiming, rating: RIRate, weight: Decimal) -> Self {
        Self {
            timing,
            rating,
            weight,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>, end_time: bool) -> bool {
        self.timing.contains(t, end_time)
    }

    /// `(price, increment, unit)` of the slot active at `group_start`
    ///
    /// Unset increments and units default to one second.
    pub fn rate_parameters(&self, group_start: Duration) -> Option<(Decimal, Duration, Duration)> {
        let slot = self
            .rating
            .slots
            .iter()
            .rev()
            .find(|s| group_start >= s.group_interval_start)?;
        let one_sec = Duration::seconds(1);
        let increment = if slot.rate_increment.is_zero() {
            one_sec
        } else {
            slot.rate_increment
        };
        let unit = if slot.rate_unit.is_zero() {
            one_sec
        } else {
            slot.rate_unit
        };
        Some((slot.value, increment, unit))
    }

    /// Cost of `duration` billed at the slot active at `group_start`
    pub fn cost(&self, duration: Duration, group_start: Duration, default_decimals: u32) -> Decimal {
        match self.rate_parameters(group_start) {
            Some((price, _, unit)) => {
                let raw = duration_ratio(duration, unit) * price;
                self.round(raw, default_decimals)
            }
            None => Decimal::ZERO,
        }
    }

    /// Round with the interval's override or the global bankers' rule
    pub fn round(&self, value: Decimal, default_decimals: u32) -> Decimal {
        round(
            value,
            self.rating.rounding_decimals.unwrap_or(default_decimals),
            self.rating.rounding_method.unwrap_or_default(),
        )
    }

    /// Group interval starts of the rating slots, ascending
    pub fn group_starts(&self) -> impl Iterator<Item = Duration> + '_ {
        self.rating.slots.iter().map(|s| s.group_interval_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn two_step() -> RateInterval {
        let mut first = RateSlot::new(
            Duration::zero(),
            dec!(0.2),
            Duration::seconds(60),
            Duration::seconds(60),
        );
        first.connect_fee = dec!(0.1);
        let second = RateSlot::new(
            Duration::seconds(60),
            dec!(0.1),
            Duration::seconds(60),
            Duration::seconds(1),
        );
        RateInterval::new(
            RITiming::always(),
            RIRate::with_slots(vec![second, first]),
            dec!(0),
        )
    }

    #[test]
    fn test_rate_parameters_by_group() {
        let ri = two_step();
        let (price, inc, unit) = ri.rate_parameters(Duration::zero()).unwrap();
        assert_eq!(price, dec!(0.2));
        assert_eq!(inc, Duration::seconds(60));
        assert_eq!(unit, Duration::seconds(60));
        let (price, inc, _) = ri.rate_parameters(Duration::seconds(90)).unwrap();
        assert_eq!(price, dec!(0.1));
        assert_eq!(inc, Duration::seconds(1));
    }

    #[test]
    fn test_zero_unit_defaults_to_second() {
        let ri = RateInterval::new(
            RITiming::always(),
            RIRate::with_slots(vec![RateSlot::new(
                Duration::zero(),
                dec!(1),
                Duration::zero(),
                Duration::zero(),
            )]),
            dec!(0),
        );
        let (_, inc, unit) = ri.rate_parameters(Duration::zero()).unwrap();
        assert_eq!(inc, Duration::seconds(1));
        assert_eq!(unit, Duration::seconds(1));
    }

    #[test]
    fn test_interval_cost() {
        let ri = two_step();
        assert_eq!(ri.cost(Duration::seconds(60), Duration::zero(), 6), dec!(0.2));
        assert_eq!(ri.cost(Duration::seconds(30), Duration::seconds(60), 6), dec!(0.05));
        assert_eq!(ri.rating.connect_fee(), dec!(0.1));
    }

    #[test]
    fn test_rounding_override() {
        let mut ri = two_step();
        ri.rating.rounding_method = Some(RoundingMethod::Up);
        ri.rating.rounding_decimals = Some(2);
        assert_eq!(ri.cost(Duration::seconds(1), Duration::zero(), 6), dec!(0.01));
    }

    #[test]
    fn test_unsane_slots() {
        assert!(two_step().rating.first_unsane_slot().is_none());
        let bad = RIRate::with_slots(vec![
            RateSlot::new(
                Duration::zero(),
                dec!(1),
                Duration::seconds(60),
                Duration::seconds(60),
            ),
            RateSlot::new(
                Duration::seconds(90),
                dec!(1),
                Duration::seconds(60),
                Duration::seconds(1),
            ),
        ]);
        assert_eq!(
            bad.first_unsane_slot().map(|s| s.group_interval_start),
            Some(Duration::seconds(90))
        );
    }
}
