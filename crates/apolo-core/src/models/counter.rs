//! Unit counters
//!
//! Counters accumulate usage per TOR for counter-based triggers. Event
//! counters match the rated call, balance counters match the balance that
//! paid for it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::filter::{FieldValue, Filter, Queryable};
use crate::utils::StringMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CounterType {
    #[default]
    #[serde(rename = "*event")]
    Event,
    #[serde(rename = "*balance")]
    Balance,
}

/// One filtered accumulator inside a counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CounterFilter {
    /// Unique id of the trigger the counter was created for
    pub unique_id: String,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UnitCounter {
    #[serde(default)]
    pub counter_type: CounterType,
    #[serde(default)]
    pub counters: Vec<CounterFilter>,
}

impl UnitCounter {
    pub fn new(counter_type: CounterType) -> Self {
        Self {
            counter_type,
            counters: Vec::new(),
        }
    }

    /// True when a counter with the same filter already exists
    pub fn has_counter(&self, filter: &Filter) -> bool {
        self.counters.iter().any(|c| &c.filter == filter)
    }

    /// Copy values from an older counter of the same type
    ///
    /// Returns true when the older counter was of the same type.
    pub fn copy_values_from(&mut self, old: &UnitCounter) -> bool {
        if self.counter_type != old.counter_type {
            return false;
        }
        for c in &mut self.counters {
            if let Some(prev) = old.counters.iter().find(|o| o.filter == c.filter) {
                c.value = prev.value;
            }
        }
        true
    }

    pub fn reset(&mut self, filter: &Filter) {
        for c in &mut self.counters {
            if filter.is_empty() || filter == &c.filter {
                c.value = Decimal::ZERO;
            }
        }
    }
}

/// Call attributes matched by event counters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CounterEvent {
    pub categories: StringMap,
    pub directions: StringMap,
    pub destination_ids: StringMap,
}

impl Queryable for CounterEvent {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "Categories" => Some(FieldValue::from(&self.categories)),
            "Directions" => Some(FieldValue::from(&self.directions)),
            "DestinationIDs" => Some(FieldValue::from(&self.destination_ids)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::string_map;
    use rust_decimal_macros::dec;

    fn counter(value: Decimal, filter: &str) -> CounterFilter {
        CounterFilter {
            unique_id: "tr1".to_string(),
            filter: Filter::compile(filter).unwrap(),
            value,
        }
    }

    #[test]
    fn test_copy_values() {
        let mut old = UnitCounter::new(CounterType::Event);
        old.counters.push(counter(dec!(42), r#"{"DestinationIDs":{"$has":["NAT"]}}"#));
        let mut fresh = UnitCounter::new(CounterType::Event);
        fresh.counters.push(counter(dec!(0), r#"{"DestinationIDs":{"$has":["NAT"]}}"#));
        fresh.counters.push(counter(dec!(0), r#"{"DestinationIDs":{"$has":["RET"]}}"#));

        assert!(fresh.copy_values_from(&old));
        assert_eq!(fresh.counters[0].value, dec!(42));
        assert_eq!(fresh.counters[1].value, dec!(0));
        assert!(!fresh.copy_values_from(&UnitCounter::new(CounterType::Balance)));
    }

    #[test]
    fn test_reset_by_filter() {
        let mut uc = UnitCounter::new(CounterType::Balance);
        uc.counters.push(counter(dec!(5), r#"{"ID":"a"}"#));
        uc.counters.push(counter(dec!(7), r#"{"ID":"b"}"#));
        uc.reset(&Filter::compile(r#"{"ID":"a"}"#).unwrap());
        assert_eq!(uc.counters[0].value, dec!(0));
        assert_eq!(uc.counters[1].value, dec!(7));
        uc.reset(&Filter::default());
        assert_eq!(uc.counters[1].value, dec!(0));
    }

    #[test]
    fn test_event_fields() {
        let ev = CounterEvent {
            categories: string_map(&["call"]),
            directions: string_map(&["*out"]),
            destination_ids: string_map(&["NAT", "RET"]),
        };
        assert!(Filter::compile(r#"{"DestinationIDs":{"$has":["RET"]},"Categories":"call"}"#)
            .unwrap()
            .matches(&ev));
    }
}
