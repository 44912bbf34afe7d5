//! Destination model
//!
//! A destination is a named group of dialed-number prefixes. The same code
//! may belong to several names (`+4917` is both `GERMANY` and
//! `GERMANY_MOBILE`).

use serde::{Deserialize, Serialize};

use crate::constants::DDC_DESTINATION_PREFIX;

/// One prefix code bound to a destination name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub tenant: String,
    pub code: String,
    pub name: String,
}

impl Destination {
    pub fn new(tenant: &str, code: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            code: code.to_string(),
            name: name.to_string(),
        }
    }

    /// Destinations rebuilt from stats metrics by `*set_ddestinations`
    pub fn is_dynamic(&self) -> bool {
        self.name.starts_with(DDC_DESTINATION_PREFIX)
    }
}

/// A `(code, name)` pair produced by the destination matcher
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationMatch {
    pub code: String,
    pub name: String,
}

impl DestinationMatch {
    pub fn new(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
        }
    }
}
