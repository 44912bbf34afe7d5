//! Decimal rounding and duration conversion
//!
//! All money and unit arithmetic runs on `rust_decimal::Decimal`. Durations
//! are converted to decimal seconds through integer nanoseconds so no binary
//! floating point is involved.

use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Rounding rule attached to a destination rate binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RoundingMethod {
    /// Towards positive infinity
    #[serde(rename = "*up")]
    Up,
    /// Towards negative infinity
    #[serde(rename = "*down")]
    Down,
    /// Half away from zero
    #[serde(rename = "*middle")]
    Middle,
    /// Half to even
    #[default]
    #[serde(rename = "*bankers")]
    Bankers,
}

impl RoundingMethod {
    fn strategy(self) -> RoundingStrategy {
        match self {
            RoundingMethod::Up => RoundingStrategy::ToPositiveInfinity,
            RoundingMethod::Down => RoundingStrategy::ToNegativeInfinity,
            RoundingMethod::Middle => RoundingStrategy::MidpointAwayFromZero,
            RoundingMethod::Bankers => RoundingStrategy::MidpointNearestEven,
        }
    }
}

/// Round `value` to `decimals` fractional digits using `method`
///
/// # Example
///
/// ```
/// use apolo_core::utils::decimal::{round, RoundingMethod};
/// use rust_decimal::Decimal;
///
/// let v = Decimal::new(12345, 4); // 1.2345
/// assert_eq!(round(v, 3, RoundingMethod::Bankers), Decimal::new(1234, 3));
/// assert_eq!(round(v, 3, RoundingMethod::Up), Decimal::new(1235, 3));
/// ```
pub fn round(value: Decimal, decimals: u32, method: RoundingMethod) -> Decimal {
    value
        .round_dp_with_strategy(decimals, method.strategy())
        .normalize()
}

/// Round using the global bankers' rule
pub fn round_global(value: Decimal, decimals: u32) -> Decimal {
    round(value, decimals, RoundingMethod::Bankers)
}

/// Duration expressed in decimal seconds
pub fn duration_secs(d: Duration) -> Decimal {
    let secs = Decimal::from(d.num_seconds());
    let nanos = Decimal::new(i64::from(d.subsec_nanos()), 9);
    (secs + nanos).normalize()
}

/// Decimal seconds converted back to a duration, truncated to nanoseconds
pub fn secs_to_duration(secs: Decimal) -> Duration {
    let nanos = (secs * Decimal::from(NANOS_PER_SEC)).trunc();
    match nanos.to_i64() {
        Some(n) => Duration::nanoseconds(n),
        None if secs.is_sign_negative() => Duration::nanoseconds(i64::MIN),
        None => Duration::nanoseconds(i64::MAX),
    }
}

/// Ratio of two durations as a decimal, zero when the divisor is zero
pub fn duration_ratio(num: Duration, den: Duration) -> Decimal {
    let den = duration_secs(den);
    if den.is_zero() {
        return Decimal::ZERO;
    }
    duration_secs(num) / den
}
