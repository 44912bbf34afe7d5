//! Account model
//!
//! An account owns balance chains keyed by TOR, the unit counters feeding
//! counter triggers, and per-trigger execution records. Accounts are created
//! on their first top-up and saved as a whole after every unit of work.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::balance::{Balance, BalanceSummary, TypedBalance};
use super::counter::{CounterEvent, CounterFilter, CounterType, UnitCounter};
use super::trigger::{ActionTrigger, ActionTriggerRecord, ThresholdType};
use crate::constants::MONETARY;
use crate::filter::Filter;
use crate::utils::{concat_key, StringMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Account {
    pub tenant: String,
    pub name: String,
    #[serde(default)]
    pub balance_map: BTreeMap<String, Vec<Balance>>,
    #[serde(default)]
    pub unit_counters: BTreeMap<String, Vec<UnitCounter>>,
    /// Action trigger groups attached to the account
    #[serde(default)]
    pub trigger_ids: StringMap,
    #[serde(default)]
    pub trigger_records: BTreeMap<String, ActionTriggerRecord>,
    #[serde(default)]
    pub allow_negative: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// Compact view of an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub tenant: String,
    pub name: String,
    pub balances: Vec<BalanceSummary>,
    pub allow_negative: bool,
    pub disabled: bool,
}

impl Account {
    pub fn new(tenant: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// `tenant:name`
    pub fn full_id(&self) -> String {
        concat_key(&[&self.tenant, &self.name])
    }

    pub fn balances(&self, tor: &str) -> &[Balance] {
        self.balance_map.get(tor).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn balance(&self, tor: &str, uuid: &str) -> Option<&Balance> {
        self.balances(tor).iter().find(|b| b.uuid == uuid)
    }

    pub fn balance_mut(&mut self, tor: &str, uuid: &str) -> Option<&mut Balance> {
        self.balance_map
            .get_mut(tor)?
            .iter_mut()
            .find(|b| b.uuid == uuid)
    }

    /// Locate a balance by UUID in any chain, returning its TOR too
    pub fn find_balance_mut(&mut self, uuid: &str) -> Option<(String, &mut Balance)> {
        self.balance_map.iter_mut().find_map(|(tor, chain)| {
            chain
                .iter_mut()
                .find(|b| b.uuid == uuid)
                .map(|b| (tor.clone(), b))
        })
    }

    /// The `*default` monetary balance, created when missing
    pub fn default_money_balance_mut(&mut self) -> &mut Balance {
        let chain = self.balance_map.entry(MONETARY.to_string()).or_default();
        let idx = match chain.iter().position(Balance::is_default) {
            Some(idx) => idx,
            None => {
                chain.push(Balance::new_default());
                chain.len() - 1
            }
        };
        &mut chain[idx]
    }

    pub fn default_money_value(&self) -> Decimal {
        self.balances(MONETARY)
            .iter()
            .find(|b| b.is_default())
            .map(|b| b.value)
            .unwrap_or(Decimal::ZERO)
    }

    /// Shared group names referenced by any balance
    pub fn shared_group_names(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .balance_map
            .values()
            .flatten()
            .flat_map(Balance::shared_group_names)
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    pub fn has_dirty_balances(&self) -> bool {
        self.balance_map.values().flatten().any(|b| b.dirty)
    }

    /// Round dirty values to the global scale and clear the dirty marks
    pub fn flush_balances(&mut self, decimals: u32) {
        for b in self.balance_map.values_mut().flatten() {
            if b.dirty {
                b.round_value(decimals);
                b.dirty = false;
            }
        }
    }

    /// True when some balance satisfies the `{Type, balance fields}` query
    pub fn matches_exec_filter(&self, filter: &Filter) -> bool {
        if filter.is_empty() {
            return true;
        }
        self.balance_map.iter().any(|(tor, chain)| {
            chain
                .iter()
                .any(|balance| filter.matches(&TypedBalance { tor, balance }))
        })
    }

    pub fn remove_expired_balances(&mut self, now: DateTime<Utc>) {
        for chain in self.balance_map.values_mut() {
            chain.retain(|b| !b.is_expired_at(now));
        }
    }

    pub fn all_balances_expired(&self, now: DateTime<Utc>) -> bool {
        self.balance_map
            .values()
            .flatten()
            .all(|b| b.is_expired_at(now))
    }

    /// Rebuild counters from the counter triggers, keeping existing values
    pub fn init_counters(&mut self, triggers: &[ActionTrigger]) {
        let old = std::mem::take(&mut self.unit_counters);
        for at in triggers {
            let Some(counter_type) = at.threshold_type.counter_type() else {
                continue;
            };
            let chain = self.unit_counters.entry(at.tor.clone()).or_default();
            let idx = match chain.iter().position(|uc| uc.counter_type == counter_type) {
                Some(idx) => idx,
                None => {
                    chain.push(UnitCounter::new(counter_type));
                    chain.len() - 1
                }
            };
            let uc = &mut chain[idx];
            if !uc.has_counter(&at.filter) {
                uc.counters.push(CounterFilter {
                    unique_id: at.unique_id.clone(),
                    filter: at.filter.clone(),
                    value: Decimal::ZERO,
                });
            }
        }
        for (tor, counters) in self.unit_counters.iter_mut() {
            let Some(old_counters) = old.get(tor) else {
                continue;
            };
            for uc in counters.iter_mut() {
                for old_uc in old_counters {
                    if uc.copy_values_from(old_uc) {
                        break;
                    }
                }
            }
        }
    }

    /// Keep a record per trigger, preserving existing execution state
    pub fn init_trigger_records(&mut self, triggers: &[ActionTrigger]) {
        let mut records = BTreeMap::new();
        for at in triggers {
            let rec = self
                .trigger_records
                .remove(&at.unique_id)
                .unwrap_or_else(|| at.record());
            records.insert(at.unique_id.clone(), rec);
        }
        self.trigger_records = records;
    }

    /// Add `amount` to the counters of `tor` matching the event or balance
    pub fn count_units(
        &mut self,
        amount: Decimal,
        tor: &str,
        event: &CounterEvent,
        balance: Option<&Balance>,
    ) {
        let Some(counters) = self.unit_counters.get_mut(tor) else {
            return;
        };
        for uc in counters.iter_mut() {
            for c in uc.counters.iter_mut() {
                let hit = match uc.counter_type {
                    CounterType::Event => c.filter.matches(event),
                    CounterType::Balance => balance
                        .map(|b| c.filter.matches(&TypedBalance { tor, balance: b }))
                        .unwrap_or(false),
                };
                if hit {
                    c.value += amount;
                }
            }
        }
    }

    pub fn reset_counters(&mut self, tor: &str, filter: &Filter) {
        for (key, counters) in self.unit_counters.iter_mut() {
            if !tor.is_empty() && key != tor {
                continue;
            }
            for uc in counters.iter_mut() {
                uc.reset(filter);
            }
        }
    }

    /// Evaluate triggers and mark the fired ones executed
    ///
    /// Returns the unique ids of the fired triggers in evaluation order. The
    /// caller runs their actions once the current unit of work commits.
    /// `filter`, when set, restricts evaluation to the matching triggers.
    /// Expired balances stay in place; callers drop them with
    /// [`Account::remove_expired_balances`] once the unit of work ends.
    pub fn evaluate_triggers(
        &mut self,
        triggers: &[ActionTrigger],
        filter: Option<&Filter>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut fired = Vec::new();
        for at in triggers {
            if at.is_expired_at(now) || !at.is_active_at(now) {
                continue;
            }
            if self
                .trigger_records
                .get(&at.unique_id)
                .map(|r| r.executed)
                .unwrap_or(false)
            {
                continue;
            }
            if let Some(f) = filter {
                if !f.matches(at) {
                    continue;
                }
            }
            if self.trigger_hit(at, now) {
                self.trigger_records
                    .entry(at.unique_id.clone())
                    .or_insert_with(|| at.record())
                    .executed = true;
                fired.push(at.unique_id.clone());
            }
        }
        fired
    }

    fn trigger_hit(&self, at: &ActionTrigger, now: DateTime<Utc>) -> bool {
        if let Some(counter_type) = at.threshold_type.counter_type() {
            return self.unit_counters.values().flatten().any(|uc| {
                uc.counter_type == counter_type
                    && uc.counters.iter().any(|c| {
                        c.filter == at.filter
                            && at.threshold_type.is_crossed(c.value, at.threshold_value)
                    })
            });
        }
        let matching = self
            .balances(&at.tor)
            .iter()
            .filter(|b| at.filter.matches(&TypedBalance { tor: &at.tor, balance: b }));
        match at.threshold_type {
            ThresholdType::BalanceExpired => matching.into_iter().any(|b| b.is_expired_at(now)),
            ThresholdType::MinBalance | ThresholdType::MaxBalance => {
                let chain: Vec<&Balance> = matching.collect();
                if !chain.iter().any(|b| b.dirty) {
                    return false;
                }
                let total: Decimal = chain.iter().map(|b| b.value).sum();
                at.threshold_type.is_crossed(total, at.threshold_value)
            }
            _ => false,
        }
    }

    /// Clear the executed flag of matching trigger records
    pub fn reset_trigger_records(&mut self, filter: Option<&Filter>) {
        for rec in self.trigger_records.values_mut() {
            if filter.map(|f| f.matches(&*rec)).unwrap_or(true) {
                rec.executed = false;
            }
        }
    }

    pub fn set_recurrent(&mut self, filter: Option<&Filter>, recurrent: bool) {
        for rec in self.trigger_records.values_mut() {
            if filter.map(|f| f.matches(&*rec)).unwrap_or(true) {
                rec.recurrent = recurrent;
            }
        }
    }

    /// Drop every balance chain
    pub fn reset_balances(&mut self) {
        self.balance_map.clear();
    }

    pub fn summary(&self) -> AccountSummary {
        let balances = self
            .balance_map
            .iter()
            .flat_map(|(tor, chain)| {
                chain.iter().map(move |b| BalanceSummary {
                    uuid: b.uuid.clone(),
                    id: b.id.clone(),
                    tor: tor.clone(),
                    value: b.value,
                    disabled: b.disabled,
                })
            })
            .collect();
        AccountSummary {
            tenant: self.tenant.clone(),
            name: self.name.clone(),
            balances,
            allow_negative: self.allow_negative,
            disabled: self.disabled,
        }
    }

    /// Copy of the account usable for dry runs
    pub fn dry_clone(&self) -> Account {
        Account {
            tenant: self.tenant.clone(),
            name: self.name.clone(),
            balance_map: self.balance_map.clone(),
            unit_counters: BTreeMap::new(),
            trigger_ids: StringMap::new(),
            trigger_records: BTreeMap::new(),
            allow_negative: self.allow_negative,
            disabled: self.disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::VOICE;
    use crate::utils::string_map;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn counter_trigger(id: &str, threshold: Decimal) -> ActionTrigger {
        let mut at = ActionTrigger::new(id, ThresholdType::MaxEventCounter, threshold, "ACT");
        at.tor = MONETARY.to_string();
        at.filter = Filter::compile(r#"{"DestinationIDs":{"$has":["NAT"]}}"#).unwrap();
        at
    }

    fn nat_event() -> CounterEvent {
        CounterEvent {
            categories: string_map(&["call"]),
            directions: string_map(&["*out"]),
            destination_ids: string_map(&["NAT"]),
        }
    }

    #[test]
    fn test_default_balance_created_once() {
        let mut acc = Account::new("t1", "rif");
        acc.default_money_balance_mut().add_value(dec!(5));
        acc.default_money_balance_mut().add_value(dec!(5));
        assert_eq!(acc.balances(MONETARY).len(), 1);
        assert_eq!(acc.default_money_value(), dec!(10));
        assert_eq!(acc.full_id(), "t1:rif");
    }

    #[test]
    fn test_counters_preserved_on_init() {
        let triggers = vec![counter_trigger("tr1", dec!(30)), counter_trigger("tr2", dec!(60))];
        let mut acc = Account::new("t1", "rif");
        acc.init_counters(&triggers);
        // both triggers share the filter, one counter slot
        assert_eq!(acc.unit_counters[MONETARY][0].counters.len(), 1);

        acc.count_units(dec!(20), MONETARY, &nat_event(), None);
        acc.init_counters(&triggers);
        assert_eq!(acc.unit_counters[MONETARY][0].counters[0].value, dec!(20));
    }

    #[test]
    fn test_counter_trigger_fires_once() {
        let triggers = vec![counter_trigger("tr1", dec!(30))];
        let mut acc = Account::new("t1", "rif");
        acc.init_counters(&triggers);
        acc.init_trigger_records(&triggers);
        let now = Utc::now();

        acc.count_units(dec!(20), MONETARY, &nat_event(), None);
        assert!(acc.evaluate_triggers(&triggers, None, now).is_empty());

        acc.count_units(dec!(10), MONETARY, &nat_event(), None);
        assert_eq!(acc.evaluate_triggers(&triggers, None, now), vec!["tr1".to_string()]);
        assert!(acc.trigger_records["tr1"].executed);
        assert!(acc.evaluate_triggers(&triggers, None, now).is_empty());

        acc.reset_trigger_records(None);
        assert_eq!(acc.evaluate_triggers(&triggers, None, now).len(), 1);
    }

    #[test]
    fn test_min_balance_needs_dirty_balance() {
        let mut at = ActionTrigger::new("low", ThresholdType::MinBalance, dec!(2), "ACT");
        at.tor = MONETARY.to_string();
        let triggers = vec![at];
        let mut acc = Account::new("t1", "rif");
        acc.balance_map
            .insert(MONETARY.to_string(), vec![Balance::new("b1", dec!(1))]);
        acc.init_trigger_records(&triggers);
        let now = Utc::now();
        assert!(acc.evaluate_triggers(&triggers, None, now).is_empty());
        acc.balance_map.get_mut(MONETARY).unwrap()[0].substract_value(dec!(0.5));
        assert_eq!(acc.evaluate_triggers(&triggers, None, now), vec!["low".to_string()]);
    }

    #[test]
    fn test_balance_expired_trigger_keeps_balance() {
        let mut at = ActionTrigger::new("exp", ThresholdType::BalanceExpired, dec!(0), "ACT");
        at.tor = VOICE.to_string();
        let triggers = vec![at];
        let now = Utc::now();
        let mut expired = Balance::new("old", dec!(10));
        expired.expiration_date = Some(now - Duration::hours(1));
        let mut acc = Account::new("t1", "rif");
        acc.balance_map
            .insert(VOICE.to_string(), vec![expired, Balance::new("new", dec!(5))]);
        assert_eq!(acc.evaluate_triggers(&triggers, None, now), vec!["exp".to_string()]);
        assert_eq!(acc.balances(VOICE).len(), 2);
        acc.remove_expired_balances(now);
        assert_eq!(acc.balances(VOICE).len(), 1);
        assert_eq!(acc.balances(VOICE)[0].id, "new");
    }

    #[test]
    fn test_exec_filter_and_summary() {
        let mut acc = Account::new("t1", "rif");
        acc.balance_map
            .insert(VOICE.to_string(), vec![Balance::new("minutes", dec!(100))]);
        let f = Filter::compile(r#"{"Type":"*voice","Value":{"$gte":100}}"#).unwrap();
        assert!(acc.matches_exec_filter(&f));
        let f = Filter::compile(r#"{"Type":"*monetary"}"#).unwrap();
        assert!(!acc.matches_exec_filter(&f));

        let s = acc.summary();
        assert_eq!(s.balances.len(), 1);
        assert_eq!(s.balances[0].tor, VOICE);
    }

    #[test]
    fn test_flush_rounds_dirty_balances() {
        let mut acc = Account::new("t1", "rif");
        acc.default_money_balance_mut().add_value(dec!(1.23456789));
        acc.flush_balances(4);
        assert_eq!(acc.default_money_value(), dec!(1.2346));
        assert!(!acc.has_dirty_balances());
    }
}
