//! Value formulas used by top-up actions
//!
//! A formula spreads a periodic grant into equal increments, e.g. 70 units
//! per week applied daily gives 10 per execution.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dates::{days_in_month, days_in_year};

/// Method name of the incremental formula
pub const INCREMENTAL: &str = "*incremental";

/// Value computed either statically or by a named formula
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ValueFormula {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default, rename = "Static")]
    pub static_value: Decimal,
}

impl ValueFormula {
    /// A formula always yielding `value`
    pub fn fixed(value: Decimal) -> Self {
        Self {
            static_value: value,
            ..Default::default()
        }
    }

    /// Evaluate the formula now
    pub fn value(&self) -> Decimal {
        self.value_at(Utc::now())
    }

    /// Evaluate the formula at `now`
    ///
    /// Unknown methods and missing parameters evaluate to zero.
    pub fn value_at(&self, now: DateTime<Utc>) -> Decimal {
        match self.method.as_str() {
            "" => self.static_value,
            INCREMENTAL => self.incremental(now).unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        }
    }

    fn incremental(&self, now: DateTime<Utc>) -> Option<Decimal> {
        let units = match self.params.get("Units")? {
            Value::Number(n) => n.to_string().parse::<Decimal>().ok()?,
            Value::String(s) => s.parse::<Decimal>().ok()?,
            _ => return None,
        };
        let interval = self.params.get("Interval")?.as_str()?;
        let increment = self.params.get("Increment")?.as_str()?;

        let month_days = Decimal::from(days_in_month(now.year(), now.month()));
        let year_days = Decimal::from(days_in_year(now.year()));
        let divisor = match (increment, interval) {
            ("day", "week") => Decimal::from(7),
            ("day", "month") => month_days,
            ("day", "year") => year_days,
            ("hour", "day") => Decimal::from(24),
            ("hour", "month") => month_days * Decimal::from(24),
            ("hour", "year") => year_days * Decimal::from(24),
            ("minute", "hour") => Decimal::from(60),
            _ => return None,
        };
        Some(units / divisor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn incremental(units: Value, interval: &str, increment: &str) -> ValueFormula {
        let mut params = BTreeMap::new();
        params.insert("Units".to_string(), units);
        params.insert("Interval".to_string(), json!(interval));
        params.insert("Increment".to_string(), json!(increment));
        ValueFormula {
            method: INCREMENTAL.to_string(),
            params,
            static_value: Decimal::ZERO,
        }
    }

    #[test]
    fn test_static_value() {
        assert_eq!(ValueFormula::fixed(dec!(10)).value(), dec!(10));
    }

    #[test]
    fn test_incremental_formula() {
        let feb = Utc.with_ymd_and_hms(2023, 2, 10, 0, 0, 0).unwrap();
        assert_eq!(incremental(json!(70), "week", "day").value_at(feb), dec!(10));
        assert_eq!(incremental(json!(280), "month", "day").value_at(feb), dec!(10));
        assert_eq!(incremental(json!("48"), "day", "hour").value_at(feb), dec!(2));
        assert_eq!(incremental(json!(10), "decade", "day").value_at(feb), dec!(0));
    }

    #[test]
    fn test_formula_deserialize() {
        let f: ValueFormula = serde_json::from_str(
            r#"{"Method":"*incremental","Params":{"Units":730,"Interval":"year","Increment":"day"}}"#,
        )
        .unwrap();
        let t = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(f.value_at(t), dec!(2));
    }
}
