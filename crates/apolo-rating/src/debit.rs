//! Debit engine
//!
//! Pays a rated call from an account's balances, increment by increment.
//! The connect fee is settled first. Unit balances then fund the call from
//! its start (zero-rated subjects at no cost, rated ones together with a
//! money balance), money balances pay what is left, and the remainder goes
//! to the default balance when the account may run negative. Every paid
//! increment records the balances that funded it.

use std::sync::Arc;

use apolo_core::constants::{META_NONE, MONETARY};
use apolo_core::models::timespan::{count_increments, repeat_duration, round_up_duration};
use apolo_core::models::{
    BalanceRef, CallCost, CallDescriptor, CounterEvent, DebitInfo, DestinationMatch, Increment,
    MaxCostStrategy, MonetaryInfo, RIRate, RITiming, RateInterval, RateSlot, RatingInfo, TimeSpan,
    UnitInfo,
};
use apolo_core::utils::dates::{is_zero_rating_subject, parse_zero_rating_subject};
use apolo_core::utils::decimal::duration_secs;
use apolo_core::utils::string_map;
use apolo_core::{AppError, AppResult};
use apolo_store::Catalog;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::candidates::{gather, Candidate, CandidateQuery};
use crate::ledger::Ledger;
use crate::matcher::{match_destination, matching_prefix_and_dest_id};
use crate::timespans::CostEngine;

#[derive(Debug, Clone, Copy, Default)]
pub struct DebitOptions {
    /// Work on the ledger without the caller persisting it
    pub dry_run: bool,
    /// Feed unit counters and evaluate triggers
    pub count: bool,
    /// Let the default balance pay what nothing else covers
    pub go_negative: bool,
}

/// Who pays an increment during a walk
#[derive(Debug, Clone)]
enum Payer {
    Unit(Candidate),
    Money,
    Default,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Unfunded,
    Blocked,
    Disconnect,
}

struct Walk {
    paid: Vec<TimeSpan>,
    rest: Vec<TimeSpan>,
    stop: Option<Stop>,
}

pub struct Debiter<'a> {
    engine: &'a CostEngine,
    catalog: &'a Catalog,
}

impl<'a> Debiter<'a> {
    pub fn new(engine: &'a CostEngine, catalog: &'a Catalog) -> Self {
        Self { engine, catalog }
    }

    /// Rate `cd` and pay it from the balances held by `ledger`
    ///
    /// Short funding is not an error: the returned cost is truncated to what
    /// was paid and flagged `not_enough_credit`. A rejected connect fee
    /// returns a cost without spans and leaves the ledger untouched.
    ///
    /// # Errors
    ///
    /// - `AppError::AccountNotFound` when the account is not in the ledger
    /// - rating errors from [`CostEngine::get_cost`]
    #[instrument(skip(self, ledger, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn debit(
        &self,
        ledger: &mut Ledger,
        cd: &CallDescriptor,
        opts: DebitOptions,
    ) -> AppResult<CallCost> {
        let settings = self.engine.settings();
        let decimals = settings.rounding_decimals;
        let account = cd.account_name().to_string();
        if ledger.account(&account).is_none() {
            return Err(AppError::AccountNotFound(cd.account_key()));
        }

        // Full quote first, it settles authorization
        let full = self.engine.get_cost(cd).await?;
        let matches = match_destination(
            self.catalog,
            &cd.tenant,
            &cd.destination,
            settings.min_prefix_match,
        )
        .await?;

        let category = if cd.category.is_empty() {
            settings.default_category.clone()
        } else {
            cd.category.clone()
        };
        let event = counter_event(&category, &cd.direction, &matches);

        let mut query = CandidateQuery {
            account: &account,
            tor: MONETARY,
            category: &category,
            direction: &cd.direction,
            at: cd.time_start,
            matches: &matches,
        };
        let money = gather(ledger, &query);
        query.tor = &cd.tor;
        let units = if cd.tor == MONETARY {
            Vec::new()
        } else {
            gather(ledger, &query)
        };

        let mut cc = cd.create_call_cost();
        let mut run = DebitRun {
            engine: self.engine,
            ledger,
            cd,
            opts,
            event,
            matches: &matches,
            money,
            account: account.clone(),
            decimals,
            base: cd.effective_duration_index() - cd.duration(),
            connect_fee: Decimal::ZERO,
            so_far: cd.max_cost_so_far,
            blocked: false,
            disconnected: false,
        };

        // Connect fee
        if cc.deduct_connect_fee {
            let fee = full.connect_fee();
            if fee > Decimal::ZERO {
                if !run.pay_connect_fee(fee) {
                    debug!("Connect fee {} not covered for {}", fee, cd.account_key());
                    cc.negative_connect_fee = true;
                    cc.not_enough_credit = true;
                    return Ok(cc);
                }
                run.connect_fee = fee;
            }
        }

        let mut paid = Vec::new();
        let mut cursor = cd.time_start;
        let mut stopped = false;

        // Unit balances
        for cand in units {
            if cursor >= cd.time_end {
                break;
            }
            let spans = if is_zero_rating_subject(&cand.rating_subject) {
                match parse_zero_rating_subject(&cand.rating_subject) {
                    Ok(increment) => run.zero_spans(cursor, increment, &cand),
                    Err(e) => {
                        warn!("Balance {} has an unusable rating subject: {}", cand.bref.uuid, e);
                        continue;
                    }
                }
            } else {
                match run.quote(cursor, &cand.rating_subject, &full).await {
                    Ok(spans) => spans,
                    Err(e) => {
                        debug!("Balance {} cannot rate {}: {}", cand.bref.uuid, cd.destination, e);
                        continue;
                    }
                }
            };
            let walk = run.walk(spans, &Payer::Unit(cand));
            if let Some(last) = walk.paid.last() {
                cursor = last.time_end;
            }
            paid.extend(walk.paid);
            match walk.stop {
                Some(Stop::Blocked) => {
                    // a live debit still lets money pay the rest; a quote ends here
                    run.blocked = true;
                    if run.opts.dry_run {
                        stopped = true;
                        cc.not_enough_credit = true;
                    }
                    break;
                }
                Some(Stop::Disconnect) => {
                    stopped = true;
                    break;
                }
                _ => {}
            }
        }

        // Money balances
        let mut leftover = Vec::new();
        if !stopped && cursor < cd.time_end {
            let spans = run.quote(cursor, "", &full).await?;
            let walk = run.walk(spans, &Payer::Money);
            paid.extend(walk.paid);
            match walk.stop {
                Some(Stop::Disconnect) => stopped = true,
                Some(Stop::Blocked) => {
                    run.blocked = true;
                    leftover = walk.rest;
                }
                Some(Stop::Unfunded) => leftover = walk.rest,
                None => {}
            }
        }

        // Whatever nothing paid for
        if !stopped && !leftover.is_empty() {
            let left_cost: Decimal = leftover.iter().map(|ts| ts.cost).sum();
            if left_cost.is_zero() {
                paid.extend(run.walk(leftover, &Payer::Free).paid);
            } else if run.opts.go_negative && !run.blocked {
                paid.extend(run.walk(leftover, &Payer::Default).paid);
            } else {
                debug!("Not enough credit on {} for {}", cd.account_key(), left_cost);
                cc.not_enough_credit = true;
            }
        }

        cc.timespans = paid;
        cc.max_cost_disconnect = run.disconnected;
        cc.refresh_cost(decimals);
        cc.update_rated_usage();
        Ok(cc)
    }
}

/// State of one debit over a ledger
struct DebitRun<'r> {
    engine: &'r CostEngine,
    ledger: &'r mut Ledger,
    cd: &'r CallDescriptor,
    opts: DebitOptions,
    event: CounterEvent,
    matches: &'r [DestinationMatch],
    money: Vec<Candidate>,
    account: String,
    decimals: u32,
    /// Call duration elapsed before this descriptor's window
    base: Duration,
    connect_fee: Decimal,
    so_far: Decimal,
    blocked: bool,
    disconnected: bool,
}

impl DebitRun<'_> {
    fn pay_connect_fee(&mut self, fee: Decimal) -> bool {
        let bref = match self.money_for(fee) {
            Ok(bref) => Some(bref),
            Err(Stop::Blocked) => {
                self.blocked = true;
                return false;
            }
            Err(_) if self.opts.go_negative => self.ledger.default_money(&self.account),
            Err(_) => None,
        };
        let Some(bref) = bref else {
            return false;
        };
        if let Some(b) = self.ledger.balance_mut(&bref) {
            b.substract_value(fee);
        }
        self.count(&bref.account, fee, MONETARY, Some(&bref));
        self.so_far += fee;
        true
    }

    /// Spans of `[from, end)` rated for `subject`, the request subject when empty
    async fn quote(&self, from: DateTime<Utc>, subject: &str, full: &CallCost) -> AppResult<Vec<TimeSpan>> {
        if from == self.cd.time_start && subject.is_empty() {
            return Ok(full.timespans.clone());
        }
        let mut rest = self.cd.clone();
        if !subject.is_empty() {
            rest.subject = subject.to_string();
        }
        rest.duration_index = self.cd.effective_duration_index();
        rest.time_start = from;
        rest.loop_index = self.cd.loop_index + 1;
        Ok(self.engine.get_cost(&rest).await?.timespans)
    }

    /// One zero-priced span from `from` covering the rest of the call
    fn zero_spans(&self, from: DateTime<Utc>, increment: Duration, cand: &Candidate) -> Vec<TimeSpan> {
        let remaining = self.cd.time_end - from;
        let count = count_increments(round_up_duration(remaining, increment), increment);
        if count == 0 {
            return Vec::new();
        }
        let end = from + repeat_duration(increment, count);

        let mut slot = RateSlot::new(Duration::zero(), Decimal::ZERO, increment, increment);
        if from == self.cd.time_start {
            slot.connect_fee = self.connect_fee;
        }
        let interval = RateInterval::new(RITiming::always(), RIRate::with_slots(vec![slot]), Decimal::ZERO);
        let (prefix, dest) = self
            .ledger
            .balance(&cand.bref)
            .and_then(|b| matching_prefix_and_dest_id(b, self.matches))
            .or_else(|| self.matches.first().map(|m| (m.code.clone(), m.name.clone())))
            .unwrap_or_default();

        let mut ts = TimeSpan::new(from, end);
        ts.duration_index = self.base + (end - self.cd.time_start);
        ts.set_rating_info(Arc::new(RatingInfo {
            matched_subject: cand.bref.uuid.clone(),
            rating_plan_id: META_NONE.to_string(),
            matched_prefix: prefix,
            matched_dest_id: dest,
            activation_time: from,
            rate_intervals: vec![interval.clone()],
            fallback_subjects: Vec::new(),
        }));
        ts.rate_interval = Some(interval);
        ts.create_increments(self.decimals);
        vec![ts]
    }

    /// Pay `spans` in order until `payer` gives up
    ///
    /// Increment groups are consumed in runs; see [`DebitRun::run_len`].
    fn walk(&mut self, spans: Vec<TimeSpan>, payer: &Payer) -> Walk {
        let mut paid = Vec::new();
        let mut spans = spans.into_iter();
        while let Some(mut ts) = spans.next() {
            let (max_cost, strategy) = ts
                .rate_interval
                .as_ref()
                .map(|ri| (ri.rating.max_cost, ri.rating.max_cost_strategy))
                .unwrap_or_default();
            let step = ts.increment_duration();
            let pending: Vec<(Duration, Decimal, u32)> = ts
                .increments
                .iter()
                .map(|g| (g.duration, g.cost, g.compress_factor))
                .collect();

            let mut groups = Vec::new();
            let mut free_index = None;
            let mut done: u32 = 0;
            let mut stop = None;
            'groups: for (duration, cost, count) in pending {
                let mut left = count;
                while left > 0 {
                    if max_cost > Decimal::ZERO && self.so_far >= max_cost {
                        match strategy {
                            MaxCostStrategy::Free => {
                                free_index.get_or_insert(done);
                                Increment::push_run(
                                    &mut groups,
                                    duration,
                                    Decimal::ZERO,
                                    DebitInfo::for_account(&self.account),
                                    Vec::new(),
                                    left,
                                );
                                done += left;
                                break;
                            }
                            MaxCostStrategy::Disconnect => {
                                self.disconnected = true;
                                if self.opts.dry_run {
                                    stop = Some(Stop::Disconnect);
                                    break 'groups;
                                }
                            }
                            MaxCostStrategy::None => {}
                        }
                    }
                    let run = self.run_len(payer, cost, left, max_cost, strategy);
                    match self.pay(payer, &ts, duration, cost, run) {
                        Ok((info, atids)) => {
                            Increment::push_run(&mut groups, duration, cost, info, atids, run);
                            self.so_far += cost * Decimal::from(run);
                            done += run;
                            left -= run;
                        }
                        Err(s) => {
                            stop = Some(s);
                            break 'groups;
                        }
                    }
                }
            }

            let Some(stop) = stop else {
                settle(&mut ts, groups, free_index);
                paid.push(ts);
                continue;
            };
            let mut rest = Vec::new();
            if done == 0 {
                rest.push(ts);
            } else {
                let mut tail = ts.split_at(ts.time_start + repeat_duration(step, done));
                tail.rate_interval = ts.rate_interval.clone();
                tail.create_increments(self.decimals);
                settle(&mut ts, groups, free_index);
                paid.push(ts);
                rest.push(tail);
            }
            rest.extend(spans);
            return Walk {
                paid,
                rest,
                stop: Some(stop),
            };
        }
        Walk {
            paid,
            rest: Vec::new(),
            stop: None,
        }
    }

    /// Increments of `cost` the payer settles in one go, out of `left`
    ///
    /// Runs longer than one increment are only taken when no counter sees
    /// the payment, so triggers still fire on the exact increment. A run
    /// never crosses the max-cost cap and never outlasts the paying balance.
    fn run_len(
        &self,
        payer: &Payer,
        cost: Decimal,
        left: u32,
        max_cost: Decimal,
        strategy: MaxCostStrategy,
    ) -> u32 {
        let uncounted = cost.is_zero() || !self.opts.count;
        let bulk = match payer {
            Payer::Free => true,
            Payer::Money | Payer::Default => uncounted,
            Payer::Unit(_) => false,
        };
        if !bulk || left <= 1 || cost.is_zero() {
            return if bulk { left } else { left.min(1) };
        }
        let mut run = Decimal::from(left);
        if max_cost > Decimal::ZERO && strategy != MaxCostStrategy::None && self.so_far < max_cost {
            run = run.min(((max_cost - self.so_far) / cost).ceil());
        }
        if let Payer::Money = payer {
            if let Some(b) = self.money_for(cost).ok().and_then(|bref| self.ledger.balance(&bref)) {
                if !b.unlimited {
                    run = run.min((b.value / cost).floor());
                }
            }
        }
        run.to_u32().unwrap_or(1).clamp(1, left)
    }

    /// Pay `run` increments of `cost` from `payer`
    ///
    /// Unit payers always settle a single increment.
    fn pay(
        &mut self,
        payer: &Payer,
        ts: &TimeSpan,
        duration: Duration,
        cost: Decimal,
        run: u32,
    ) -> Result<(DebitInfo, Vec<String>), Stop> {
        let total = cost * Decimal::from(run);
        match payer {
            Payer::Free => Ok((DebitInfo::for_account(&self.account), Vec::new())),
            Payer::Default => {
                let bref = self.ledger.default_money(&self.account).ok_or(Stop::Unfunded)?;
                Ok(self.debit_money(&bref, total, ts))
            }
            Payer::Money => {
                if cost.is_zero() {
                    return Ok((DebitInfo::for_account(&self.account), Vec::new()));
                }
                let bref = self.money_for(cost)?;
                Ok(self.debit_money(&bref, total, ts))
            }
            Payer::Unit(cand) => {
                let balance = self.ledger.balance(&cand.bref).ok_or(Stop::Unfunded)?;
                let amount = duration_secs(duration) / balance.factor_for(&self.cd.tor);
                if !balance.unlimited && balance.value < amount {
                    return Err(if balance.blocker {
                        Stop::Blocked
                    } else {
                        Stop::Unfunded
                    });
                }
                let money = if cost > Decimal::ZERO {
                    Some(self.money_for(cost)?)
                } else {
                    None
                };

                let mut unit = UnitInfo {
                    destination_id: ts.matched_dest_id.clone(),
                    consumed: amount,
                    tor: cand.bref.tor.clone(),
                    ..Default::default()
                };
                if let Some(b) = self.ledger.balance_mut(&cand.bref) {
                    b.substract_value(amount);
                    unit.uuid = b.uuid.clone();
                    unit.id = b.id.clone();
                    unit.value = b.value;
                }
                let tor = self.cd.tor.clone();
                let mut atids = self.count(&cand.bref.account, amount, &tor, Some(&cand.bref));

                let mut info = DebitInfo::for_account(&cand.bref.account);
                info.unit = Some(unit);
                if let Some(mref) = money {
                    let (money_info, more) = self.debit_money(&mref, cost, ts);
                    info.monetary = money_info.monetary;
                    atids.extend(more);
                }
                Ok((info, atids))
            }
        }
    }

    /// First money candidate able to pay `cost`
    fn money_for(&self, cost: Decimal) -> Result<BalanceRef, Stop> {
        for cand in &self.money {
            let Some(b) = self.ledger.balance(&cand.bref) else {
                continue;
            };
            if b.unlimited || b.value >= cost {
                return Ok(cand.bref.clone());
            }
            if b.blocker {
                return Err(Stop::Blocked);
            }
        }
        Err(Stop::Unfunded)
    }

    fn debit_money(&mut self, bref: &BalanceRef, cost: Decimal, ts: &TimeSpan) -> (DebitInfo, Vec<String>) {
        let mut info = DebitInfo::for_account(&bref.account);
        if let Some(b) = self.ledger.balance_mut(bref) {
            b.substract_value(cost);
            info.monetary = Some(MonetaryInfo {
                uuid: b.uuid.clone(),
                id: b.id.clone(),
                value: b.value,
                rate_interval: ts.rate_interval.clone(),
            });
        }
        let atids = self.count(&bref.account, cost, MONETARY, Some(bref));
        (info, atids)
    }

    fn count(&mut self, account: &str, amount: Decimal, tor: &str, bref: Option<&BalanceRef>) -> Vec<String> {
        if !self.opts.count {
            return Vec::new();
        }
        self.ledger.count(account, amount, tor, &self.event, bref)
    }
}

/// Counter event of a call in `category` going `direction` to `matches`
pub(crate) fn counter_event(category: &str, direction: &str, matches: &[DestinationMatch]) -> CounterEvent {
    let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
    CounterEvent {
        categories: string_map(&[category]),
        directions: string_map(&[direction]),
        destination_ids: string_map(&names),
    }
}

fn settle(ts: &mut TimeSpan, groups: Vec<Increment>, free_index: Option<u32>) {
    ts.increments = groups;
    ts.max_cost_free_index = free_index;
    ts.cost = ts.increments.iter().map(Increment::total_cost).sum();
}
