//! Shared groups
//!
//! Accounts in a shared group pool their balances tagged with the group
//! name. The order in which the pooled balances are consumed is decided by
//! a per-account [`SharingStrategy`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::ANY;
use crate::utils::StringMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SharingStrategy {
    #[serde(rename = "*lowest")]
    Lowest,
    #[serde(rename = "*highest")]
    Highest,
    #[serde(rename = "*mine_lowest")]
    MineLowest,
    #[serde(rename = "*mine_highest")]
    MineHighest,
    #[default]
    #[serde(rename = "*mine_random")]
    MineRandom,
    #[serde(rename = "*random")]
    Random,
}

impl SharingStrategy {
    /// Strategies that consume the caller's own balance first
    pub fn is_mine_first(self) -> bool {
        matches!(
            self,
            SharingStrategy::MineLowest | SharingStrategy::MineHighest | SharingStrategy::MineRandom
        )
    }
}

/// Sharing parameters of one member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SharingParameters {
    #[serde(default)]
    pub strategy: SharingStrategy,
    #[serde(default)]
    pub rating_subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SharedGroup {
    pub tenant: String,
    pub name: String,
    /// Parameters keyed by account name, `*any` applies to everyone else
    #[serde(default)]
    pub account_parameters: BTreeMap<String, SharingParameters>,
    /// Account names of the members
    #[serde(default)]
    pub member_ids: StringMap,
}

impl SharedGroup {
    pub fn new(tenant: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Parameters applying to `account`
    pub fn parameters_for(&self, account: &str) -> SharingParameters {
        self.account_parameters
            .get(account)
            .or_else(|| self.account_parameters.get(ANY))
            .cloned()
            .unwrap_or_default()
    }

    /// Register `account`, returns true when it was not a member yet
    pub fn add_member(&mut self, account: &str) -> bool {
        self.member_ids.insert(account.to_string(), true) != Some(true)
    }

    pub fn remove_member(&mut self, account: &str) -> bool {
        self.member_ids.remove(account).is_some()
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.member_ids
            .iter()
            .filter(|(_, included)| **included)
            .map(|(k, _)| k.as_str())
    }
}
