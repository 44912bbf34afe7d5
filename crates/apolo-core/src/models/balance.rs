//! Balance model
//!
//! Balances hold money or units for one type of record (TOR) inside an
//! account. They are addressed by a UUID that never changes and carry an
//! account-scoped ID chosen by the operator.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::timing::RITiming;
use crate::constants::{ANY, META_DEFAULT};
use crate::filter::{FieldValue, Queryable};
use crate::utils::{gen_uuid, included_keys, is_unrestricted, StringMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Balance {
    pub uuid: String,
    pub id: String,
    pub value: Decimal,
    #[serde(default)]
    pub directions: StringMap,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub weight: Decimal,
    #[serde(default)]
    pub destination_ids: StringMap,
    #[serde(default)]
    pub rating_subject: String,
    #[serde(default)]
    pub categories: StringMap,
    #[serde(default)]
    pub shared_groups: StringMap,
    #[serde(default)]
    pub timings: Vec<RITiming>,
    #[serde(default)]
    pub timing_ids: StringMap,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub blocker: bool,
    #[serde(default)]
    pub unlimited: bool,
    /// Unit conversion factor keyed by TOR
    #[serde(default)]
    pub factor: BTreeMap<String, Decimal>,
    /// Changed in the current unit of work
    #[serde(skip)]
    pub dirty: bool,
}

impl Balance {
    /// New balance with a fresh UUID
    pub fn new(id: &str, value: Decimal) -> Self {
        Self {
            uuid: gen_uuid(),
            id: id.to_string(),
            value,
            ..Default::default()
        }
    }

    /// The default monetary balance
    pub fn new_default() -> Self {
        Self::new(META_DEFAULT, Decimal::ZERO)
    }

    pub fn is_default(&self) -> bool {
        self.id == META_DEFAULT
    }

    pub fn add_value(&mut self, amount: Decimal) {
        self.set_value(self.value + amount);
    }

    /// Subtract `amount`; unlimited balances are never consumed
    pub fn substract_value(&mut self, amount: Decimal) {
        if self.unlimited {
            return;
        }
        self.set_value(self.value - amount);
    }

    pub fn set_value(&mut self, value: Decimal) {
        self.value = value;
        self.dirty = true;
    }

    /// Expired when the expiration falls within the next second
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date
            .map(|exp| exp <= now + Duration::seconds(1))
            .unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Active when no timing is attached or one of them is active at `t`
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        if self.disabled {
            return false;
        }
        self.timings.is_empty() || self.timings.iter().any(|timing| timing.is_active_at(t))
    }

    pub fn match_category(&self, category: &str) -> bool {
        is_unrestricted(&self.categories) || self.categories.get(category).copied().unwrap_or(false)
    }

    pub fn match_direction(&self, direction: &str) -> bool {
        is_unrestricted(&self.directions) || self.directions.get(direction).copied().unwrap_or(false)
    }

    pub fn has_destination(&self) -> bool {
        !is_unrestricted(&self.destination_ids)
    }

    pub fn shared_group_names(&self) -> Vec<String> {
        included_keys(&self.shared_groups)
    }

    /// Units consumed per second of usage for `tor`
    pub fn factor_for(&self, tor: &str) -> Decimal {
        self.factor
            .get(tor)
            .or_else(|| self.factor.get(ANY))
            .copied()
            .filter(|f| !f.is_zero())
            .unwrap_or(Decimal::ONE)
    }

    /// True when `other` describes the same balance identity
    pub fn same_identity(&self, other: &Balance) -> bool {
        (!self.uuid.is_empty() && self.uuid == other.uuid)
            || (!self.id.is_empty() && self.id == other.id)
    }

    /// Round the value to the global scale before persisting
    pub fn round_value(&mut self, decimals: u32) {
        self.value = crate::utils::decimal::round_global(self.value, decimals);
    }

    fn query_field(&self, name: &str) -> Option<FieldValue> {
        let v = match name {
            "UUID" => FieldValue::from(self.uuid.as_str()),
            "ID" => FieldValue::from(self.id.as_str()),
            "Value" => FieldValue::Dec(self.value),
            "Directions" => FieldValue::from(&self.directions),
            "ExpirationDate" => FieldValue::Time(self.expiration_date),
            "Weight" => FieldValue::Dec(self.weight),
            "DestinationIDs" => FieldValue::from(&self.destination_ids),
            "RatingSubject" => FieldValue::from(self.rating_subject.as_str()),
            "Categories" => FieldValue::from(&self.categories),
            "SharedGroups" => FieldValue::from(&self.shared_groups),
            "TimingIDs" => FieldValue::from(&self.timing_ids),
            "Disabled" => FieldValue::Bool(self.disabled),
            "Blocker" => FieldValue::Bool(self.blocker),
            "Unlimited" => FieldValue::Bool(self.unlimited),
            _ => return None,
        };
        Some(v)
    }
}

impl Queryable for Balance {
    fn field(&self, name: &str) -> Option<FieldValue> {
        self.query_field(name)
    }
}

/// A balance seen together with its TOR, as exposed to filters
#[derive(Debug, Clone, Copy)]
pub struct TypedBalance<'a> {
    pub tor: &'a str,
    pub balance: &'a Balance,
}

impl Queryable for TypedBalance<'_> {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "Type" => Some(FieldValue::from(self.tor)),
            _ => self.balance.query_field(name),
        }
    }
}

/// Stable reference to a balance inside an account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceRef {
    /// Account name within the tenant
    pub account: String,
    pub tor: String,
    pub uuid: String,
}

/// Summary line of a balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub uuid: String,
    pub id: String,
    #[serde(rename = "type")]
    pub tor: String,
    pub value: Decimal,
    pub disabled: bool,
}
