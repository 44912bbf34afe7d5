//! Actions and action groups
//!
//! An [`Action`] is one step of an action group: a kind, the TOR it works
//! on, an optional filter selecting balances and a JSON parameter blob whose
//! shape depends on the kind.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::balance::Balance;
use super::timing::RITiming;
use crate::error::AppError;
use crate::filter::Filter;
use crate::utils::dates::parse_date_at;
use crate::utils::formula::ValueFormula;
use crate::utils::{gen_uuid, string_map, StringMap};
use crate::AppResult;

/// Every action kind the runtime knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Log,
    ResetTriggers,
    SetRecurrent,
    UnsetRecurrent,
    AllowNegative,
    DenyNegative,
    ResetAccount,
    Topup,
    TopupReset,
    Debit,
    DebitReset,
    RemoveAccount,
    RemoveBalance,
    SetBalance,
    EnableAccount,
    DisableAccount,
    ResetCounters,
    CdrLog,
    CallUrl,
    CallUrlAsync,
    MailAsync,
    TransferMonetaryDefault,
    SetDdestinations,
    Rpc,
}

impl ActionKind {
    const ALL: [(ActionKind, &'static str); 24] = [
        (ActionKind::Log, "*log"),
        (ActionKind::ResetTriggers, "*reset_triggers"),
        (ActionKind::SetRecurrent, "*set_recurrent"),
        (ActionKind::UnsetRecurrent, "*unset_recurrent"),
        (ActionKind::AllowNegative, "*allow_negative"),
        (ActionKind::DenyNegative, "*deny_negative"),
        (ActionKind::ResetAccount, "*reset_account"),
        (ActionKind::Topup, "*topup"),
        (ActionKind::TopupReset, "*topup_reset"),
        (ActionKind::Debit, "*debit"),
        (ActionKind::DebitReset, "*debit_reset"),
        (ActionKind::RemoveAccount, "*remove_account"),
        (ActionKind::RemoveBalance, "*remove_balance"),
        (ActionKind::SetBalance, "*set_balance"),
        (ActionKind::EnableAccount, "*enable_account"),
        (ActionKind::DisableAccount, "*disable_account"),
        (ActionKind::ResetCounters, "*reset_counters"),
        (ActionKind::CdrLog, "*cdrlog"),
        (ActionKind::CallUrl, "*call_url"),
        (ActionKind::CallUrlAsync, "*call_url_async"),
        (ActionKind::MailAsync, "*mail_async"),
        (ActionKind::TransferMonetaryDefault, "*transfer_monetary_default"),
        (ActionKind::SetDdestinations, "*set_ddestinations"),
        (ActionKind::Rpc, "*rpc"),
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().find(|(_, name)| *name == s).map(|(k, _)| *k)
    }

    pub fn as_str(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(k, _)| *k == self)
            .map(|(_, name)| *name)
            .unwrap_or("")
    }

    /// Kinds that move balance value and are logged by `*cdrlog`
    pub fn is_balance_transfer(self) -> bool {
        matches!(
            self,
            ActionKind::Debit | ActionKind::DebitReset | ActionKind::Topup | ActionKind::TopupReset
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Action {
    /// Kind as stored in the catalog; unknown kinds are kept verbatim
    pub action_type: String,
    #[serde(default)]
    pub tor: String,
    #[serde(default)]
    pub params: String,
    /// Query over `{Type, balance fields}` that must match some balance
    #[serde(default)]
    pub exec_filter: Filter,
    /// Selects the balances the action works on
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub weight: Decimal,
}

impl Action {
    pub fn new(kind: ActionKind, tor: &str, params: &str) -> Self {
        Self {
            action_type: kind.as_str().to_string(),
            tor: tor.to_string(),
            params: params.to_string(),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> AppResult<ActionKind> {
        ActionKind::parse(&self.action_type)
            .ok_or_else(|| AppError::UnknownActionKind(self.action_type.clone()))
    }

    /// Parsed parameter object; blank params give the defaults
    pub fn parsed_params(&self) -> AppResult<ActionParams> {
        if self.params.trim().is_empty() || !self.params.trim_start().starts_with('{') {
            return Ok(ActionParams::default());
        }
        serde_json::from_str(&self.params)
            .map_err(|e| AppError::Parser(format!("action {} params: {}", self.action_type, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionGroup {
    pub tenant: String,
    pub name: String,
    pub actions: Vec<Action>,
}

impl ActionGroup {
    /// Actions ordered by weight, heaviest first
    pub fn sorted_actions(&self) -> Vec<Action> {
        let mut actions = self.actions.clone();
        actions.sort_by(|a, b| b.weight.cmp(&a.weight));
        actions
    }
}

/// Balance description carried in action params
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct BalanceSpec {
    #[serde(rename = "UUID", default)]
    pub uuid: Option<String>,
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub value: Option<Decimal>,
    #[serde(default)]
    pub directions: Option<Vec<String>>,
    #[serde(rename = "DestinationIDs", default)]
    pub destination_ids: Option<Vec<String>>,
    #[serde(default)]
    pub rating_subject: Option<String>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub shared_groups: Option<Vec<String>>,
    #[serde(default)]
    pub timing_tags: Option<Vec<String>>,
    #[serde(default)]
    pub expiry_time: Option<String>,
    #[serde(default)]
    pub weight: Option<Decimal>,
    #[serde(default)]
    pub blocker: Option<bool>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub unlimited: Option<bool>,
}

impl BalanceSpec {
    pub fn expiration_at(&self, now: DateTime<Utc>) -> AppResult<Option<DateTime<Utc>>> {
        match &self.expiry_time {
            Some(s) => parse_date_at(s, now),
            None => Ok(None),
        }
    }

    /// Copy every attribute set in this description, except the value, onto `b`
    ///
    /// `timings` are the catalog timings resolved from `TimingTags`.
    pub fn apply_to(&self, b: &mut Balance, timings: &[RITiming], now: DateTime<Utc>) -> AppResult<()> {
        if let Some(id) = &self.id {
            b.id = id.clone();
        }
        if let Some(d) = &self.directions {
            b.directions = string_map(d);
        }
        if let Some(d) = &self.destination_ids {
            b.destination_ids = string_map(d);
        }
        if let Some(rs) = &self.rating_subject {
            b.rating_subject = rs.clone();
        }
        if let Some(c) = &self.categories {
            b.categories = string_map(c);
        }
        if let Some(sg) = &self.shared_groups {
            b.shared_groups = string_map(sg);
        }
        if let Some(tags) = &self.timing_tags {
            b.timing_ids = string_map(tags);
            b.timings = timings.to_vec();
        }
        if self.expiry_time.is_some() {
            b.expiration_date = self.expiration_at(now)?;
        }
        if let Some(w) = self.weight {
            b.weight = w;
        }
        if let Some(v) = self.blocker {
            b.blocker = v;
        }
        if let Some(v) = self.disabled {
            b.disabled = v;
        }
        if let Some(v) = self.unlimited {
            b.unlimited = v;
        }
        b.dirty = true;
        Ok(())
    }

    /// True when every attribute set in this description agrees with `b`
    ///
    /// List attributes match when each listed entry is present in the
    /// balance with the same polarity; shared groups must be equal.
    pub fn matches(&self, b: &Balance) -> bool {
        if let Some(uuid) = &self.uuid {
            if !uuid.is_empty() && *uuid != b.uuid {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if !id.is_empty() && *id != b.id {
                return false;
            }
        }
        if self.weight.map(|w| w != b.weight).unwrap_or(false)
            || self.blocker.map(|v| v != b.blocker).unwrap_or(false)
            || self.disabled.map(|v| v != b.disabled).unwrap_or(false)
        {
            return false;
        }
        let subset = |wanted: &Option<Vec<String>>, have: &StringMap| {
            wanted
                .as_ref()
                .map(|w| string_map(w).iter().all(|(k, v)| have.get(k) == Some(v)))
                .unwrap_or(true)
        };
        if !subset(&self.destination_ids, &b.destination_ids)
            || !subset(&self.directions, &b.directions)
            || !subset(&self.categories, &b.categories)
            || !subset(&self.timing_tags, &b.timing_ids)
        {
            return false;
        }
        if let Some(sg) = &self.shared_groups {
            if string_map(sg) != b.shared_groups {
                return false;
            }
        }
        self.rating_subject
            .as_ref()
            .map(|rs| *rs == b.rating_subject)
            .unwrap_or(true)
    }

    /// New balance described here holding `value`
    pub fn to_balance(&self, value: Decimal, timings: &[RITiming], now: DateTime<Utc>) -> AppResult<Balance> {
        let mut b = Balance {
            uuid: self.uuid.clone().unwrap_or_else(gen_uuid),
            ..Default::default()
        };
        self.apply_to(&mut b, timings, now)?;
        b.set_value(value);
        Ok(b)
    }
}

/// Parameter object shared by balance actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ActionParams {
    #[serde(default)]
    pub balance: Option<BalanceSpec>,
    #[serde(default)]
    pub value_formula: Option<ValueFormula>,
    #[serde(default)]
    pub value_factor: Option<BTreeMap<String, Decimal>>,
    /// Field template overriding the default `*cdrlog` mapping
    #[serde(default)]
    pub cdr_log_template: Option<BTreeMap<String, String>>,
    /// Action-specific keys
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ActionParams {
    /// Value moved by the action: the formula when present, else the balance value
    pub fn value_at(&self, now: DateTime<Utc>) -> Decimal {
        match &self.value_formula {
            Some(f) => f.value_at(now),
            None => self
                .balance
                .as_ref()
                .and_then(|b| b.value)
                .unwrap_or(Decimal::ZERO),
        }
    }

    /// Balance spec, or an empty one selecting everything
    pub fn balance_spec(&self) -> BalanceSpec {
        self.balance.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[test]
    fn test_kind_roundtrip() {
        assert_eq!(ActionKind::parse("*topup_reset"), Some(ActionKind::TopupReset));
        assert_eq!(ActionKind::TopupReset.as_str(), "*topup_reset");
        assert_eq!(ActionKind::parse("*teleport"), None);
        let a = Action {
            action_type: "*teleport".into(),
            ..Default::default()
        };
        assert!(matches!(a.kind(), Err(AppError::UnknownActionKind(_))));
    }

    #[test]
    fn test_parse_params() {
        let a = Action::new(
            ActionKind::Topup,
            "*monetary",
            r#"{"Balance":{"ID":"b1","Value":10,"DestinationIDs":["NAT","!RET"],"Weight":20,"ExpiryTime":"+1h"},"Extra":"x"}"#,
        );
        let p = a.parsed_params().unwrap();
        let spec = p.balance_spec();
        assert_eq!(spec.id.as_deref(), Some("b1"));
        assert_eq!(p.value_at(Utc::now()), dec!(10));
        assert_eq!(p.extra.get("Extra"), Some(&Value::String("x".into())));

        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let b = spec.to_balance(dec!(10), &[], now).unwrap();
        assert_eq!(b.destination_ids.get("RET"), Some(&false));
        assert_eq!(b.weight, dec!(20));
        assert_eq!(b.expiration_date, Some(now + Duration::hours(1)));
        assert!(!b.uuid.is_empty());
    }

    #[test]
    fn test_spec_matches_balance() {
        let mut b = Balance::new("b1", dec!(5));
        b.destination_ids = string_map(&["NAT", "RET"]);
        b.weight = dec!(10);

        let spec: BalanceSpec =
            serde_json::from_str(r#"{"ID":"b1","DestinationIDs":["NAT"]}"#).unwrap();
        assert!(spec.matches(&b));
        let spec: BalanceSpec = serde_json::from_str(r#"{"DestinationIDs":["!NAT"]}"#).unwrap();
        assert!(!spec.matches(&b));
        let spec: BalanceSpec = serde_json::from_str(r#"{"Weight":20}"#).unwrap();
        assert!(!spec.matches(&b));
        assert!(BalanceSpec::default().matches(&b));
    }

    #[test]
    fn test_formula_overrides_value() {
        let a = Action::new(
            ActionKind::Topup,
            "*monetary",
            r#"{"Balance":{"Value":1},"ValueFormula":{"Method":"*incremental","Params":{"Units":70,"Interval":"week","Increment":"day"}}}"#,
        );
        assert_eq!(a.parsed_params().unwrap().value_at(Utc::now()), dec!(10));
    }

    #[test]
    fn test_blank_and_plain_params() {
        assert_eq!(
            Action::new(ActionKind::Log, "", "").parsed_params().unwrap(),
            ActionParams::default()
        );
        // urls and mail addresses are not JSON objects
        assert!(Action::new(ActionKind::CallUrl, "", "http://localhost/x")
            .parsed_params()
            .is_ok());
    }

    #[test]
    fn test_sorted_actions() {
        let mut light = Action::new(ActionKind::Log, "", "");
        light.weight = dec!(10);
        let mut heavy = Action::new(ActionKind::Topup, "", "");
        heavy.weight = dec!(20);
        let group = ActionGroup {
            tenant: "t1".into(),
            name: "G".into(),
            actions: vec![light, heavy],
        };
        assert_eq!(group.sorted_actions()[0].action_type, "*topup");
    }
}
