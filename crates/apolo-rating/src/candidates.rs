//! Balance candidate selection
//!
//! Builds the ordered list of balances that may fund a call: the caller's
//! chains for the request TOR (plus `*generic` units), filtered by
//! activity, category, direction and destination, sorted by destination
//! precision then weight. A balance tagged with shared groups is replaced by
//! the pooled balances of the group members, ordered by the caller's
//! sharing strategy.

use std::collections::HashSet;

use apolo_core::constants::{GENERIC, MONETARY};
use apolo_core::models::{Balance, BalanceRef, DestinationMatch, SharingStrategy};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tracing::debug;

use crate::ledger::Ledger;
use crate::matcher::balance_precision;

/// A balance allowed to pay for the current request
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bref: BalanceRef,
    /// Length of the destination code that selected the balance
    pub precision: usize,
    /// Subject used to rate units, empty for the request subject
    pub rating_subject: String,
}

/// Request attributes balances are filtered on
pub struct CandidateQuery<'a> {
    pub account: &'a str,
    pub tor: &'a str,
    pub category: &'a str,
    pub direction: &'a str,
    pub at: DateTime<Utc>,
    pub matches: &'a [DestinationMatch],
}

impl CandidateQuery<'_> {
    fn chains(&self) -> Vec<&str> {
        if self.tor == MONETARY || self.tor == GENERIC {
            vec![self.tor]
        } else {
            vec![self.tor, GENERIC]
        }
    }

    /// Destination precision of `b`, `None` when it may not pay
    fn precision(&self, b: &Balance) -> Option<usize> {
        if b.disabled || b.is_expired_at(self.at) || !b.is_active_at(self.at) {
            return None;
        }
        if !b.match_category(self.category) || !b.match_direction(self.direction) {
            return None;
        }
        balance_precision(b, self.matches)
    }
}

fn is_empty(b: &Balance) -> bool {
    !b.unlimited && b.value <= rust_decimal::Decimal::ZERO
}

/// Ordered candidates of `query.account`, shared groups expanded
pub fn gather(ledger: &Ledger, query: &CandidateQuery<'_>) -> Vec<Candidate> {
    let Some(account) = ledger.account(query.account) else {
        return Vec::new();
    };

    let mut own: Vec<(Candidate, &Balance)> = Vec::new();
    for tor in query.chains() {
        for b in account.balances(tor) {
            if is_empty(b) && !b.blocker && b.shared_groups.is_empty() {
                continue;
            }
            let Some(precision) = query.precision(b) else {
                continue;
            };
            own.push((
                Candidate {
                    bref: BalanceRef {
                        account: account.name.clone(),
                        tor: tor.to_string(),
                        uuid: b.uuid.clone(),
                    },
                    precision,
                    rating_subject: b.rating_subject.clone(),
                },
                b,
            ));
        }
    }
    own.sort_by(|(a, ab), (b, bb)| {
        b.precision
            .cmp(&a.precision)
            .then_with(|| bb.weight.cmp(&ab.weight))
    });

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (candidate, balance) in own {
        let groups = balance.shared_group_names();
        if groups.is_empty() {
            if seen.insert(candidate.bref.clone()) {
                out.push(candidate);
            }
            continue;
        }
        for group in groups {
            for pooled in pool(ledger, query, &group, &candidate.bref.tor) {
                if seen.insert(pooled.bref.clone()) {
                    out.push(pooled);
                }
            }
        }
    }
    debug!("{} candidates for {} {}", out.len(), query.account, query.tor);
    out
}

/// Member balances of `group` usable by `query.account`, in strategy order
fn pool(ledger: &Ledger, query: &CandidateQuery<'_>, group: &str, tor: &str) -> Vec<Candidate> {
    let Some(sg) = ledger.shared_group(group) else {
        debug!("Shared group {} not loaded", group);
        return Vec::new();
    };
    let params = sg.parameters_for(query.account);

    let mut members: Vec<&str> = sg.members().collect();
    if !members.contains(&query.account) {
        members.push(query.account);
    }

    let mut pooled: Vec<(Candidate, &Balance)> = Vec::new();
    for member in members {
        let Some(acc) = ledger.account(member) else {
            continue;
        };
        if acc.disabled {
            continue;
        }
        for b in acc.balances(tor) {
            if !b.shared_groups.get(group).copied().unwrap_or(false) || is_empty(b) {
                continue;
            }
            let Some(precision) = query.precision(b) else {
                continue;
            };
            let rating_subject = if params.rating_subject.is_empty() {
                b.rating_subject.clone()
            } else {
                params.rating_subject.clone()
            };
            pooled.push((
                Candidate {
                    bref: BalanceRef {
                        account: member.to_string(),
                        tor: tor.to_string(),
                        uuid: b.uuid.clone(),
                    },
                    precision,
                    rating_subject,
                },
                b,
            ));
        }
    }

    match params.strategy {
        SharingStrategy::Lowest | SharingStrategy::MineLowest => {
            pooled.sort_by(|(_, a), (_, b)| a.value.cmp(&b.value));
        }
        SharingStrategy::Highest | SharingStrategy::MineHighest => {
            pooled.sort_by(|(_, a), (_, b)| b.value.cmp(&a.value));
        }
        SharingStrategy::Random | SharingStrategy::MineRandom => {
            pooled.shuffle(&mut rand::thread_rng());
        }
    }
    if params.strategy.is_mine_first() {
        // stable: keeps the strategy order within both halves
        pooled.sort_by_key(|(c, _)| c.bref.account != query.account);
    }
    pooled.into_iter().map(|(c, _)| c).collect()
}
