//! Rating service
//!
//! [`Rater`] is the entry point used by session front-ends: pricing, debits
//! with trigger execution, session quoting and refunds. Every operation that
//! changes balances runs under the guardian, holding the keys of the charged
//! account and of every member of its shared groups.

use std::collections::BTreeSet;
use std::sync::Arc;

use apolo_core::constants::{META_DEFAULT, MONETARY, OUT};
use apolo_core::models::{BalanceRef, CallCost, CallDescriptor, CounterEvent, Increment, SharedGroup, StatsSnapshot};
use apolo_core::utils::concat_key;
use apolo_core::utils::decimal::{duration_secs, round_global};
use apolo_core::{AppError, AppResult};
use apolo_store::{AccountStore, CacheMode, Catalog};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use crate::candidates::{gather, CandidateQuery};
use crate::debit::{counter_event, DebitOptions, Debiter};
use crate::guardian::Guardian;
use crate::ledger::Ledger;
use crate::matcher::match_destination;
use crate::settings::RatingSettings;
use crate::timespans::CostEngine;
use crate::triggers::TriggerProcessor;

pub struct Rater {
    catalog: Arc<Catalog>,
    accounts: Arc<AccountStore>,
    guardian: Arc<Guardian>,
    engine: CostEngine,
    triggers: Arc<TriggerProcessor>,
}

impl Rater {
    pub fn new(
        catalog: Arc<Catalog>,
        accounts: Arc<AccountStore>,
        guardian: Arc<Guardian>,
        triggers: Arc<TriggerProcessor>,
        settings: RatingSettings,
    ) -> Self {
        Self {
            engine: CostEngine::new(catalog.clone(), settings),
            catalog,
            accounts,
            guardian,
            triggers,
        }
    }

    fn settings(&self) -> &RatingSettings {
        self.engine.settings()
    }

    pub fn triggers(&self) -> &Arc<TriggerProcessor> {
        &self.triggers
    }

    /// Price `cd` without touching any account
    pub async fn get_cost(&self, cd: &CallDescriptor) -> AppResult<CallCost> {
        self.engine.get_cost(cd).await
    }

    /// `account` followed by the members of its shared groups
    async fn related_accounts(&self, tenant: &str, account: &str) -> AppResult<Vec<String>> {
        let mut names = vec![account.to_string()];
        let Some(acc) = self.accounts.find_account(tenant, account).await? else {
            return Err(AppError::AccountNotFound(concat_key(&[tenant, account])));
        };
        for group in acc.shared_group_names() {
            match self
                .catalog
                .find::<SharedGroup>(tenant, &group, CacheMode::UseCache)
                .await?
            {
                Some(sg) => names.extend(sg.members().map(str::to_string)),
                None => warn!("Shared group {}:{} not found", tenant, group),
            }
        }
        let mut seen = BTreeSet::new();
        names.retain(|n| seen.insert(n.clone()));
        Ok(names)
    }

    fn lock_keys(tenant: &str, names: &[String]) -> Vec<String> {
        names.iter().map(|n| concat_key(&[tenant, n])).collect()
    }

    /// Rate `cd` and pay it, then run the triggers it fired
    ///
    /// The default balance goes negative for what nothing else covers unless
    /// the request sets `deny_negative`. A zero-length request is only
    /// priced.
    ///
    /// # Errors
    ///
    /// - `AppError::AccountNotFound` when the account does not exist
    /// - rating errors from [`CostEngine::get_cost`]
    /// - `AppError::LockTimeout` when the account stays locked
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn debit(&self, cd: &CallDescriptor) -> AppResult<CallCost> {
        cd.validate()?;
        if cd.duration().is_zero() {
            return self.engine.get_cost(cd).await;
        }
        let opts = DebitOptions {
            dry_run: false,
            count: true,
            go_negative: !cd.deny_negative,
        };
        self.debit_with(cd, opts, None).await
    }

    /// Debit `cd` under the locks of every related account
    ///
    /// With `shrink` set the window is first cut to what a dry copy of the
    /// ledger can afford; `Some(true)` refuses to cut and fails instead.
    async fn debit_with(
        &self,
        cd: &CallDescriptor,
        opts: DebitOptions,
        shrink: Option<bool>,
    ) -> AppResult<CallCost> {
        let names = self.related_accounts(&cd.tenant, cd.account_name()).await?;
        let keys = Self::lock_keys(&cd.tenant, &names);
        let decimals = self.settings().rounding_decimals;
        let (cc, fired) = self
            .guardian
            .guard(&keys, self.settings().lock_timeout, || async {
                let mut ledger =
                    Ledger::load(&self.catalog, &self.accounts, &cd.tenant, &names, Utc::now()).await?;
                let mut cd = cd.clone();
                if let Some(force) = shrink {
                    let allow_negative = ledger
                        .account(cd.account_name())
                        .map(|a| a.allow_negative)
                        .ok_or_else(|| AppError::AccountNotFound(cd.account_key()))?;
                    let affordable = self.affordable(&ledger, &cd).await?;
                    if affordable < cd.duration() && !allow_negative {
                        if force {
                            return Err(AppError::InsufficientCredit(format!(
                                "{} can afford {}s of {}s",
                                cd.account_key(),
                                affordable.num_seconds(),
                                cd.duration().num_seconds()
                            )));
                        }
                        if affordable.is_zero() {
                            let mut cc = cd.create_call_cost();
                            cc.not_enough_credit = true;
                            return Ok((cc, Vec::new()));
                        }
                        let cut = cd.duration() - affordable;
                        cd.time_end = cd.time_start + affordable;
                        cd.duration_index = (cd.duration_index - cut).max(Duration::zero());
                    }
                }
                let cc = Debiter::new(&self.engine, &self.catalog)
                    .debit(&mut ledger, &cd, opts)
                    .await?;
                let fired = ledger.commit(&self.accounts, decimals).await?;
                Ok((cc, fired))
            })
            .await?;
        if !fired.is_empty() {
            self.triggers.drain(fired).await;
        }
        info!("Debited {} for {}s on {}", cc.cost, cc.rated_usage, cd.account_key());
        Ok(cc)
    }

    /// Debit no more than the account can afford
    ///
    /// Accounts allowed to go negative are debited in full. Otherwise the
    /// request is shortened to the affordable duration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InsufficientCredit`, with nothing changed, when
    /// `force_duration` is set and the full duration is not affordable.
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn max_debit(&self, cd: &CallDescriptor) -> AppResult<CallCost> {
        cd.validate()?;
        if cd.duration().is_zero() {
            return self.engine.get_cost(cd).await;
        }
        let opts = DebitOptions {
            dry_run: false,
            count: true,
            go_negative: !cd.deny_negative,
        };
        self.debit_with(cd, opts, Some(cd.force_duration)).await
    }

    /// Longest part of the requested window the account can pay for
    ///
    /// Runs a dry debit on copies of the balances, so nothing is saved and
    /// no trigger fires.
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn get_max_session_duration(&self, cd: &CallDescriptor) -> AppResult<Duration> {
        cd.validate()?;
        if cd.duration().is_zero() {
            return Ok(Duration::zero());
        }
        let names = self.related_accounts(&cd.tenant, cd.account_name()).await?;
        let ledger = Ledger::load(&self.catalog, &self.accounts, &cd.tenant, &names, Utc::now()).await?;
        self.affordable(&ledger, cd).await
    }

    async fn affordable(&self, ledger: &Ledger, cd: &CallDescriptor) -> AppResult<Duration> {
        let mut dry = ledger.dry_clone();
        let opts = DebitOptions {
            dry_run: true,
            count: false,
            go_negative: false,
        };
        let cc = Debiter::new(&self.engine, &self.catalog)
            .debit(&mut dry, cd, opts)
            .await?;
        if cc.negative_connect_fee {
            return Ok(Duration::zero());
        }

        let max_rate = cd.max_rate_per_second();
        let mut total = Duration::zero();
        'spans: for ts in &cc.timespans {
            if let (Some(max), Some(ri)) = (max_rate, ts.rate_interval.as_ref()) {
                if let Some((price, _, unit)) = ri.rate_parameters(ts.group_start()) {
                    if price / duration_secs(unit) > max {
                        debug!("Rate {} per {}s above the cap", price, unit.num_seconds());
                        break;
                    }
                }
            }
            for inc in &ts.increments {
                let overdrawn = inc
                    .balance_info
                    .monetary
                    .as_ref()
                    .map(|m| m.id == META_DEFAULT && m.value < Decimal::ZERO)
                    .unwrap_or(false);
                if overdrawn {
                    break 'spans;
                }
                total = total + inc.total_duration();
            }
        }
        Ok(total.min(cd.duration()))
    }

    /// Give back the balances that paid `increments`
    ///
    /// Counters are decremented by the refunded amounts. Every account is
    /// saved once.
    #[instrument(skip(self, cd, increments), fields(account = %cd.account_key(), count = increments.len()))]
    pub async fn refund_increments(&self, cd: &CallDescriptor, increments: &[Increment]) -> AppResult<()> {
        if increments.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = increments
            .iter()
            .map(|inc| inc.balance_info.account_id.clone())
            .filter(|n| !n.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let keys = Self::lock_keys(&cd.tenant, &names);
        let event = self.call_event(cd).await?;
        let decimals = self.settings().rounding_decimals;

        let fired = self
            .guardian
            .guard(&keys, self.settings().lock_timeout, || async {
                let mut ledger =
                    Ledger::load(&self.catalog, &self.accounts, &cd.tenant, &names, Utc::now()).await?;
                for inc in increments {
                    let account = &inc.balance_info.account_id;
                    let times = Decimal::from(inc.compress_factor);
                    if let Some(unit) = &inc.balance_info.unit {
                        let bref = BalanceRef {
                            account: account.clone(),
                            tor: unit.tor.clone(),
                            uuid: unit.uuid.clone(),
                        };
                        let amount = unit.consumed * times;
                        self.credit(&mut ledger, &bref, amount, &cd.tor, &event);
                    }
                    if let Some(money) = &inc.balance_info.monetary {
                        let bref = BalanceRef {
                            account: account.clone(),
                            tor: MONETARY.to_string(),
                            uuid: money.uuid.clone(),
                        };
                        let amount = inc.cost * times;
                        self.credit(&mut ledger, &bref, amount, MONETARY, &event);
                    }
                }
                ledger.commit(&self.accounts, decimals).await
            })
            .await?;
        self.triggers.drain(fired).await;
        Ok(())
    }

    fn credit(&self, ledger: &mut Ledger, bref: &BalanceRef, amount: Decimal, tor: &str, event: &CounterEvent) {
        if amount.is_zero() {
            return;
        }
        match ledger.balance_mut(bref) {
            Some(b) => b.add_value(amount),
            None => {
                warn!("Refund target {} of {} is gone", bref.uuid, bref.account);
                return;
            }
        }
        ledger.count(&bref.account, -amount, tor, event, Some(bref));
    }

    async fn call_event(&self, cd: &CallDescriptor) -> AppResult<CounterEvent> {
        let settings = self.settings();
        let matches = match_destination(&self.catalog, &cd.tenant, &cd.destination, settings.min_prefix_match).await?;
        let category = if cd.category.is_empty() {
            settings.default_category.as_str()
        } else {
            cd.category.as_str()
        };
        Ok(counter_event(category, &cd.direction, &matches))
    }

    /// Credit back what rounding whole increments charged over the exact
    /// cost of `cc`
    ///
    /// The difference goes to the money balance of the last paid increment.
    /// Returns the amount refunded.
    pub async fn refund_rounding(&self, cd: &CallDescriptor, cc: &CallCost) -> AppResult<Decimal> {
        let decimals = self.settings().rounding_decimals;
        let mut charged = Decimal::ZERO;
        let mut exact = Decimal::ZERO;
        for ts in &cc.timespans {
            charged += ts.increments.iter().map(Increment::total_cost).sum::<Decimal>();
            if let Some(ri) = &ts.rate_interval {
                exact += ri.cost(ts.duration(), ts.group_start(), decimals);
            }
        }
        let diff = round_global(charged - exact, decimals);
        if diff <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let Some((account, uuid)) = cc
            .timespans
            .iter()
            .flat_map(|ts| ts.increments.iter())
            .rev()
            .find_map(|inc| {
                inc.balance_info
                    .monetary
                    .as_ref()
                    .map(|m| (inc.balance_info.account_id.clone(), m.uuid.clone()))
            })
        else {
            debug!("No money balance paid {}, nothing to refund", cd.account_key());
            return Ok(Decimal::ZERO);
        };

        let bref = BalanceRef {
            account: account.clone(),
            tor: MONETARY.to_string(),
            uuid,
        };
        let keys = Self::lock_keys(&cd.tenant, std::slice::from_ref(&account));
        self.guardian
            .guard(&keys, self.settings().lock_timeout, || async {
                let mut acc = self.accounts.get_account(&cd.tenant, &account).await?;
                match acc.balance_mut(&bref.tor, &bref.uuid) {
                    Some(b) => b.add_value(diff),
                    None => return Err(AppError::NotFound(format!("balance {}", bref.uuid))),
                }
                acc.flush_balances(decimals);
                self.accounts.set_account(&acc).await
            })
            .await?;
        info!("Refunded rounding {} to {}", diff, concat_key(&[&cd.tenant, &account]));
        Ok(diff)
    }

    /// Take `amount` units of `tor` from the account, outside any call
    ///
    /// Matching balances are drained in candidate order; a blocker stops the
    /// walk. A monetary remainder goes to the default balance when the
    /// account allows negative values.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InsufficientCredit`, with nothing changed, when the
    /// amount cannot be covered.
    #[instrument(skip(self))]
    pub async fn debit_units(&self, tenant: &str, account: &str, tor: &str, amount: Decimal) -> AppResult<()> {
        if amount <= Decimal::ZERO {
            return Err(AppError::InvalidInput(format!("debit amount {}", amount)));
        }
        let names = self.related_accounts(tenant, account).await?;
        let keys = Self::lock_keys(tenant, &names);
        let settings = self.settings();
        let event = counter_event(&settings.default_category, OUT, &[]);

        let fired = self
            .guardian
            .guard(&keys, settings.lock_timeout, || async {
                let now = Utc::now();
                let mut ledger = Ledger::load(&self.catalog, &self.accounts, tenant, &names, now).await?;
                let query = CandidateQuery {
                    account,
                    tor,
                    category: &settings.default_category,
                    direction: OUT,
                    at: now,
                    matches: &[],
                };
                let mut left = amount;
                for cand in gather(&ledger, &query) {
                    if left.is_zero() {
                        break;
                    }
                    let Some(b) = ledger.balance_mut(&cand.bref) else {
                        continue;
                    };
                    let take = if b.unlimited { left } else { left.min(b.value.max(Decimal::ZERO)) };
                    let blocker = b.blocker;
                    if !take.is_zero() {
                        b.substract_value(take);
                        left -= take;
                        ledger.count(&cand.bref.account, take, tor, &event, Some(&cand.bref));
                    }
                    if blocker && !left.is_zero() {
                        break;
                    }
                }
                if !left.is_zero() {
                    let allow_negative = ledger.account(account).map(|a| a.allow_negative).unwrap_or(false);
                    if tor != MONETARY || !allow_negative {
                        return Err(AppError::InsufficientCredit(format!(
                            "{} short of {} {}",
                            concat_key(&[tenant, account]),
                            left,
                            tor
                        )));
                    }
                    if let Some(bref) = ledger.default_money(account) {
                        if let Some(b) = ledger.balance_mut(&bref) {
                            b.substract_value(left);
                        }
                        ledger.count(account, left, tor, &event, Some(&bref));
                    }
                }
                ledger.commit(&self.accounts, settings.rounding_decimals).await
            })
            .await?;
        self.triggers.drain(fired).await;
        Ok(())
    }

    /// Run the QoS triggers of a stats snapshot
    pub async fn execute_stats_triggers(
        &self,
        snapshot: &mut StatsSnapshot,
        account: Option<&str>,
    ) -> AppResult<Vec<String>> {
        self.triggers
            .execute_stats_triggers(snapshot, account, Utc::now())
            .await
    }

    /// Attach trigger groups to an account
    pub async fn attach_triggers(&self, tenant: &str, account: &str, groups: &[String]) -> AppResult<()> {
        self.triggers.attach_triggers(tenant, account, groups).await
    }
}
