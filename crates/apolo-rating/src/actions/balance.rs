//! Balance-changing actions

use apolo_core::constants::{META_DEFAULT, MONETARY};
use apolo_core::models::{Account, Action, ActionParams, Balance, BalanceSpec, RITiming, SharedGroup, Timing, TypedBalance};
use apolo_core::utils::gen_uuid;
use apolo_core::{AppError, AppResult};
use apolo_store::{CacheMode, Catalog};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

fn action_tor(action: &Action) -> &str {
    if action.tor.is_empty() {
        MONETARY
    } else {
        &action.tor
    }
}

fn selects(action: &Action, spec: &BalanceSpec, tor: &str, b: &Balance) -> bool {
    spec.matches(b) && action.filter.matches(&TypedBalance { tor, balance: b })
}

/// Catalog timings named by the balance `TimingTags`
async fn resolve_timings(catalog: &Catalog, tenant: &str, spec: &BalanceSpec) -> AppResult<Vec<RITiming>> {
    let mut timings = Vec::new();
    for tag in spec.timing_tags.iter().flatten() {
        let timing = catalog.get::<Timing>(tenant, tag, CacheMode::UseCache).await?;
        timings.push(RITiming::from(timing.as_ref()));
    }
    Ok(timings)
}

/// Add the account to every shared group the new balance belongs to
async fn register_shared_groups(catalog: &Catalog, account: &Account, balance: &Balance) -> AppResult<()> {
    for name in balance.shared_group_names() {
        match catalog.find::<SharedGroup>(&account.tenant, &name, CacheMode::SkipCache).await? {
            Some(sg) => {
                let mut sg = (*sg).clone();
                if sg.add_member(&account.name) {
                    catalog.set(&sg).await?;
                    debug!("Added {} to shared group {}", account.name, name);
                }
            }
            None => warn!("Shared group {}:{} not found", account.tenant, name),
        }
    }
    Ok(())
}

/// `*topup`, `*topup_reset`, `*debit`, `*debit_reset`
///
/// Every live balance selected by the params moves by the action value,
/// zeroed first when `reset` is set. Without a match a new balance carrying
/// the described attributes is appended. Returns the signed value moved.
pub(crate) async fn change_balance(
    catalog: &Catalog,
    acc: &mut Account,
    action: &Action,
    params: &ActionParams,
    reset: bool,
    debit: bool,
    now: DateTime<Utc>,
) -> AppResult<Decimal> {
    let tor = action_tor(action).to_string();
    let spec = params.balance_spec();
    let value = params.value_at(now);
    let signed = if debit { -value } else { value };

    let mut found = false;
    for b in acc.balance_map.entry(tor.clone()).or_default().iter_mut() {
        if b.is_expired_at(now) || !selects(action, &spec, &tor, b) {
            continue;
        }
        if reset {
            b.set_value(Decimal::ZERO);
        }
        b.add_value(signed);
        if let Some(factor) = &params.value_factor {
            b.factor = factor.clone();
        }
        found = true;
    }
    if found {
        return Ok(signed);
    }

    let mut balance = if spec.id.as_deref() == Some(META_DEFAULT) {
        let mut b = Balance::new_default();
        b.set_value(signed);
        b
    } else {
        let timings = resolve_timings(catalog, &acc.tenant, &spec).await?;
        spec.to_balance(signed, &timings, now)?
    };
    balance.uuid = gen_uuid();
    if let Some(factor) = &params.value_factor {
        balance.factor = factor.clone();
    }
    register_shared_groups(catalog, acc, &balance).await?;
    debug!("New {} balance {} on {}", tor, balance.id, acc.full_id());
    acc.balance_map.entry(tor).or_default().push(balance);
    Ok(signed)
}

/// `*set_balance`: update the first selected balance in place or create it
pub(crate) async fn set_balance(
    catalog: &Catalog,
    acc: &mut Account,
    action: &Action,
    params: &ActionParams,
    now: DateTime<Utc>,
) -> AppResult<Decimal> {
    let tor = action_tor(action).to_string();
    let spec = params.balance_spec();
    let value = params.value_at(now);
    let timings = resolve_timings(catalog, &acc.tenant, &spec).await?;

    let by_identity = spec.uuid.as_deref().map(|u| !u.is_empty()).unwrap_or(false)
        || spec.id.as_deref().map(|i| !i.is_empty()).unwrap_or(false);
    let chain = acc.balance_map.entry(tor.clone()).or_default();
    let existing = chain.iter_mut().find(|b| {
        if by_identity {
            spec.uuid.as_deref().map(|u| u == b.uuid).unwrap_or(false)
                || spec.id.as_deref().map(|i| i == b.id).unwrap_or(false)
        } else {
            selects(action, &spec, &tor, b)
        }
    });
    if let Some(b) = existing {
        spec.apply_to(b, &timings, now)?;
        b.set_value(value);
        if let Some(factor) = &params.value_factor {
            b.factor = factor.clone();
        }
        return Ok(value);
    }

    let mut balance = spec.to_balance(value, &timings, now)?;
    if let Some(factor) = &params.value_factor {
        balance.factor = factor.clone();
    }
    register_shared_groups(catalog, acc, &balance).await?;
    acc.balance_map.entry(tor).or_default().push(balance);
    Ok(value)
}

/// `*remove_balance`
///
/// # Errors
///
/// Returns `AppError::NotFound` when no balance was selected
pub(crate) fn remove_balance(acc: &mut Account, action: &Action, params: &ActionParams) -> AppResult<()> {
    let tor = action_tor(action).to_string();
    let spec = params.balance_spec();
    let key = acc.full_id();
    let Some(chain) = acc.balance_map.get_mut(&tor) else {
        return Err(AppError::NotFound(format!("{} balances of {}", tor, key)));
    };
    let before = chain.len();
    chain.retain(|b| !selects(action, &spec, &tor, b));
    if chain.len() == before {
        return Err(AppError::NotFound(format!("{} balance of {}", tor, key)));
    }
    Ok(())
}

/// `*transfer_monetary_default`: sweep positive selected money balances into `*default`
pub(crate) fn transfer_monetary_default(
    acc: &mut Account,
    action: &Action,
    params: &ActionParams,
) -> AppResult<Decimal> {
    if acc.balances(MONETARY).is_empty() {
        return Err(AppError::NotFound(format!("{} balances of {}", MONETARY, acc.full_id())));
    }
    let spec = params.balance_spec();
    let default_uuid = acc.default_money_balance_mut().uuid.clone();

    let mut moved = Decimal::ZERO;
    for b in acc.balance_map.entry(MONETARY.to_string()).or_default().iter_mut() {
        if b.uuid == default_uuid || b.is_default() || !selects(action, &spec, MONETARY, b) {
            continue;
        }
        if b.value > Decimal::ZERO {
            moved += b.value;
            b.set_value(Decimal::ZERO);
        }
    }
    acc.default_money_balance_mut().add_value(moved);
    Ok(moved)
}
