//! Shared setup for the integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use apolo_core::constants::{ANY, MONETARY};
use apolo_core::models::{
    Account, Balance, CallDescriptor, Destination, RIRate, RITiming, RateInterval, RateSlot,
    RatingPlan, RatingPlanActivation, RatingProfile,
};
use apolo_rating::{
    ActionPlanner, ActionRuntime, ActionSettings, Guardian, Rater, RatingSettings, TriggerProcessor,
};
use apolo_store::{AccountStore, Catalog, MemoryStore, StoreCdrSink};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;

pub const TENANT: &str = "t1";

pub struct Harness {
    pub catalog: Arc<Catalog>,
    pub accounts: Arc<AccountStore>,
    pub cdrs: Arc<StoreCdrSink>,
    pub triggers: Arc<TriggerProcessor>,
    pub planner: Arc<ActionPlanner>,
    pub rater: Rater,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(Catalog::new(store.clone(), StdDuration::from_millis(50)));
    let accounts = Arc::new(AccountStore::new(store.clone()));
    let cdrs = Arc::new(StoreCdrSink::new(store));
    let guardian = Arc::new(Guardian::new());
    let settings = RatingSettings::default();
    let runtime = Arc::new(
        ActionRuntime::new(
            catalog.clone(),
            accounts.clone(),
            cdrs.clone(),
            ActionSettings::default(),
        )
        .unwrap(),
    );
    let triggers = Arc::new(TriggerProcessor::new(
        catalog.clone(),
        accounts.clone(),
        guardian.clone(),
        runtime,
        None,
        settings.rounding_decimals,
    ));
    let planner = Arc::new(ActionPlanner::new(
        catalog.clone(),
        accounts.clone(),
        guardian.clone(),
        triggers.clone(),
        None,
        settings.rounding_decimals,
    ));
    let rater = Rater::new(catalog.clone(), accounts.clone(), guardian, triggers.clone(), settings);
    Harness {
        catalog,
        accounts,
        cdrs,
        triggers,
        planner,
        rater,
    }
}

/// 2013-10-21 (a Monday) at the given time
pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2013, 10, 21, h, m, s).unwrap()
}

pub fn interval(price: Decimal, unit_secs: i64, increment_secs: i64) -> RateInterval {
    RateInterval::new(
        RITiming::always(),
        RIRate::with_slots(vec![RateSlot::new(
            Duration::zero(),
            price,
            Duration::seconds(unit_secs),
            Duration::seconds(increment_secs),
        )]),
        Decimal::ZERO,
    )
}

/// Destination `07` named NAT, rated by `ri` for every subject
pub async fn rate_nat(catalog: &Catalog, ri: RateInterval) {
    catalog
        .set_destination(&Destination::new(TENANT, "07", "NAT"))
        .await
        .unwrap();
    let mut plan = RatingPlan::new(TENANT, "RP_NAT");
    plan.add_rate_interval("07", "NAT", &[ri]);
    catalog.set(&plan).await.unwrap();
    let profile = RatingProfile {
        direction: "*out".into(),
        tenant: TENANT.into(),
        category: "call".into(),
        subject: ANY.into(),
        activations: vec![RatingPlanActivation {
            activation_time: at(0, 0, 0),
            rating_plan_id: "RP_NAT".into(),
            fallback_subjects: vec![],
        }],
    };
    catalog.set(&profile).await.unwrap();
}

pub fn call(account: &str, secs: i64) -> CallDescriptor {
    let start = at(10, 0, 0);
    let mut cd = CallDescriptor::new(TENANT, account, "0723045326", start, start + Duration::seconds(secs));
    cd.category = "call".into();
    cd
}

/// Store an account holding `balances` as `(tor, balance)` pairs
pub async fn store_account(accounts: &AccountStore, name: &str, balances: Vec<(&str, Balance)>) -> Account {
    let mut acc = Account::new(TENANT, name);
    for (tor, b) in balances {
        acc.balance_map.entry(tor.to_string()).or_default().push(b);
    }
    accounts.set_account(&acc).await.unwrap();
    acc
}

pub async fn value_of(accounts: &AccountStore, name: &str, tor: &str, id: &str) -> Decimal {
    accounts
        .get_account(TENANT, name)
        .await
        .unwrap()
        .balances(tor)
        .iter()
        .find(|b| b.id == id)
        .map(|b| b.value)
        .unwrap_or_default()
}

pub async fn money(accounts: &AccountStore, name: &str, id: &str) -> Decimal {
    value_of(accounts, name, MONETARY, id).await
}
