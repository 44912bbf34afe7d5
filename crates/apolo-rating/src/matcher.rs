//! Destination matching
//!
//! Resolves a dialed number into the destination names whose codes prefix
//! it, and decides whether a balance restricted by destination may pay for
//! that number.

use apolo_core::models::{Balance, DestinationMatch};
use apolo_core::utils::split_prefix;
use apolo_core::AppResult;
use apolo_store::Catalog;
use tracing::debug;

/// `(code, name)` pairs prefixing `number`, longest code first
pub async fn match_destination(
    catalog: &Catalog,
    tenant: &str,
    number: &str,
    min_prefix: usize,
) -> AppResult<Vec<DestinationMatch>> {
    let mut matches = Vec::new();
    for code in split_prefix(number, min_prefix) {
        for name in catalog.destination_names(tenant, code).await?.iter() {
            matches.push(DestinationMatch::new(code, name));
        }
    }
    debug!("{} matched {} destinations", number, matches.len());
    Ok(matches)
}

/// Matching precision of `balance` for the matched destinations
///
/// `None` rejects the balance. Unrestricted balances and balances listing
/// only exclusions match with precision 0; otherwise the length of the
/// longest included code is returned, provided no matched name is excluded.
pub fn balance_precision(balance: &Balance, matches: &[DestinationMatch]) -> Option<usize> {
    if !balance.has_destination() {
        return Some(0);
    }
    let mut precision = None;
    for m in matches {
        match balance.destination_ids.get(&m.name) {
            Some(false) => return None,
            Some(true) if precision.is_none() => precision = Some(m.code.len()),
            _ => {}
        }
    }
    if precision.is_some() {
        return precision;
    }
    if balance.destination_ids.values().all(|included| !included) {
        return Some(0);
    }
    None
}

/// Longest included `(code, name)` of `balance`, `None` meaning any
pub fn matching_prefix_and_dest_id(
    balance: &Balance,
    matches: &[DestinationMatch],
) -> Option<(String, String)> {
    if !balance.has_destination() {
        return None;
    }
    matches
        .iter()
        .find(|m| balance.destination_ids.get(&m.name) == Some(&true))
        .map(|m| (m.code.clone(), m.name.clone()))
}
