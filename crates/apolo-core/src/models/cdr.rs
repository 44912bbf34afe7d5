//! CDR (Call Detail Record) model
//!
//! Records written through the CDR sink, mostly by the `*cdrlog` action to
//! document balance top-ups and debits.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::utils::dates::duration_serde;

/// CDR (Call Detail Record)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Cdr {
    /// Unique identifier, derived from origin id and host
    pub cdr_id: String,

    /// Type of record (`*voice`, `*monetary`, ...)
    pub tor: String,

    /// Identifier assigned by the originator
    pub origin_id: String,

    /// Host that produced the record
    pub origin_host: String,

    /// Producer of the record (`*cdrlog` for actions)
    pub source: String,

    /// Request type such as `*prepaid`
    pub request_type: String,

    pub direction: String,

    pub tenant: String,

    pub category: String,

    /// Account charged
    pub account: String,

    pub subject: String,

    pub destination: String,

    /// Call setup timestamp
    pub setup_time: DateTime<Utc>,

    /// Call answer timestamp
    pub answer_time: DateTime<Utc>,

    /// Billable usage
    #[serde(with = "duration_serde")]
    pub usage: Duration,

    /// Fields without a dedicated column
    #[serde(default)]
    pub extra_fields: BTreeMap<String, String>,

    /// Total cost of the record
    pub cost: Decimal,

    /// Whether the cost was computed by the engine
    #[serde(default)]
    pub rated: bool,
}

impl Cdr {
    /// Stable id built from the origin id and host
    pub fn compute_id(origin_id: &str, origin_host: &str) -> String {
        let digest = Sha256::digest(format!("{}{}", origin_id, origin_host).as_bytes());
        digest.iter().take(20).map(|b| format!("{:02x}", b)).collect()
    }

    /// Assign a named field, falling back to the extra fields map
    ///
    /// Unparseable values for typed fields are kept as extra fields.
    pub fn set_field(&mut self, name: &str, value: &str) {
        match name {
            "TOR" => self.tor = value.to_string(),
            "OriginID" => self.origin_id = value.to_string(),
            "OriginHost" => self.origin_host = value.to_string(),
            "Source" => self.source = value.to_string(),
            "RequestType" => self.request_type = value.to_string(),
            "Direction" => self.direction = value.to_string(),
            "Tenant" => self.tenant = value.to_string(),
            "Category" => self.category = value.to_string(),
            "Account" => self.account = value.to_string(),
            "Subject" => self.subject = value.to_string(),
            "Destination" => self.destination = value.to_string(),
            "Cost" => match value.parse::<Decimal>() {
                Ok(cost) => self.cost = cost,
                Err(_) => {
                    self.extra_fields.insert(name.to_string(), value.to_string());
                }
            },
            _ => {
                self.extra_fields.insert(name.to_string(), value.to_string());
            }
        }
    }

    /// Billable seconds
    #[inline]
    pub fn usage_secs(&self) -> i64 {
        self.usage.num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_set_field() {
        let mut cdr = Cdr::default();
        cdr.set_field("Tenant", "t1");
        cdr.set_field("Cost", "12.5");
        cdr.set_field("BalanceID", "minutes");
        cdr.set_field("Cost", "n/a");
        assert_eq!(cdr.tenant, "t1");
        assert_eq!(cdr.cost, dec!(12.5));
        assert_eq!(cdr.extra_fields.get("BalanceID").map(String::as_str), Some("minutes"));
        assert_eq!(cdr.extra_fields.get("Cost").map(String::as_str), Some("n/a"));
    }

    #[test]
    fn test_compute_id_is_stable() {
        let a = Cdr::compute_id("abc", "127.0.0.1");
        assert_eq!(a, Cdr::compute_id("abc", "127.0.0.1"));
        assert_ne!(a, Cdr::compute_id("abd", "127.0.0.1"));
        assert_eq!(a.len(), 40);
    }
}
