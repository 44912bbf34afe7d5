//! End-to-end debit scenarios over the in-memory store

mod common;

use apolo_core::constants::{MONETARY, VOICE};
use apolo_core::models::{Balance, MaxCostStrategy, SharedGroup};
use apolo_core::utils::string_map;
use chrono::Duration;
use rust_decimal_macros::dec;

use common::*;

fn zero_rated_minutes(value: rust_decimal::Decimal) -> Balance {
    let mut b = Balance::new("minutes", value);
    b.rating_subject = "*zero1s".into();
    b
}

#[tokio::test]
async fn test_zero_cost_voice_from_unit_balance() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(1), 1, 1)).await;
    let voice = zero_rated_minutes(dec!(10));
    let voice_uuid = voice.uuid.clone();
    store_account(
        &h.accounts,
        "rif",
        vec![(VOICE, voice), (MONETARY, Balance::new("main", dec!(21)))],
    )
    .await;

    let cc = h.rater.debit(&call("rif", 10)).await.unwrap();

    assert_eq!(cc.cost, dec!(0));
    assert_eq!(cc.duration(), Duration::seconds(10));
    assert_eq!(value_of(&h.accounts, "rif", VOICE, "minutes").await, dec!(0));
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(21));
    let unit = cc.timespans[0].increments[0].balance_info.unit.as_ref().unwrap();
    assert_eq!(unit.uuid, voice_uuid);
}

#[tokio::test]
async fn test_connect_fee_blocker_rejects_call() {
    let h = harness();
    let mut ri = interval(dec!(0.1), 1, 1);
    ri.rating.slots[0].connect_fee = dec!(0.15);
    rate_nat(&h.catalog, ri).await;

    let mut a = Balance::new("A", dec!(0.1152));
    a.weight = dec!(20);
    a.destination_ids = string_map(&["NAT"]);
    a.blocker = true;
    store_account(
        &h.accounts,
        "rif",
        vec![(MONETARY, a), (MONETARY, Balance::new("B", dec!(1.5)))],
    )
    .await;

    let cc = h.rater.debit(&call("rif", 10)).await.unwrap();

    assert!(cc.timespans.is_empty());
    assert!(cc.negative_connect_fee);
    assert_eq!(money(&h.accounts, "rif", "A").await, dec!(0.1152));
    assert_eq!(money(&h.accounts, "rif", "B").await, dec!(1.5));
}

#[tokio::test]
async fn test_split_unit_then_money() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(2), 1, 10)).await;
    store_account(
        &h.accounts,
        "rif",
        vec![
            (VOICE, zero_rated_minutes(dec!(10))),
            (MONETARY, Balance::new("main", dec!(50))),
        ],
    )
    .await;

    let cc = h.rater.debit(&call("rif", 20)).await.unwrap();

    assert!(!cc.not_enough_credit);
    assert_eq!(cc.timespans.len(), 2);
    assert_eq!(cc.timespans[0].duration(), Duration::seconds(10));
    assert_eq!(cc.timespans[1].duration(), Duration::seconds(10));
    assert_eq!(value_of(&h.accounts, "rif", VOICE, "minutes").await, dec!(0));
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(30));
}

#[tokio::test]
async fn test_max_cost_disconnect_quotation() {
    let h = harness();
    let mut ri = interval(dec!(1), 60, 60);
    ri.rating.max_cost = dec!(10);
    ri.rating.max_cost_strategy = MaxCostStrategy::Disconnect;
    rate_nat(&h.catalog, ri).await;
    store_account(&h.accounts, "rif", vec![(MONETARY, Balance::new("main", dec!(100)))]).await;

    let cd = call("rif", 30 * 60);
    let quoted = h.rater.get_max_session_duration(&cd).await.unwrap();
    assert_eq!(quoted, Duration::minutes(10));
    // quoting leaves the account alone
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(100));

    let cc = h.rater.max_debit(&cd).await.unwrap();
    assert_eq!(cc.cost, dec!(10));
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(90));
}

#[tokio::test]
async fn test_shared_group_debit_across_accounts() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(1), 1, 1)).await;
    let mut group = SharedGroup::new(TENANT, "SG");
    group.add_member("rif");
    group.add_member("dan");
    h.catalog.set(&group).await.unwrap();

    let mut own = Balance::new("main", dec!(0));
    own.shared_groups = string_map(&["SG"]);
    let mut pooled = Balance::new("main", dec!(130));
    pooled.shared_groups = string_map(&["SG"]);
    store_account(&h.accounts, "rif", vec![(MONETARY, own)]).await;
    store_account(&h.accounts, "dan", vec![(MONETARY, pooled)]).await;

    let cc = h.rater.debit(&call("rif", 120)).await.unwrap();

    assert_eq!(cc.cost, dec!(120));
    assert_eq!(money(&h.accounts, "dan", "main").await, dec!(10));
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(0));
    let funded_by: Vec<&str> = cc
        .timespans
        .iter()
        .flat_map(|ts| ts.increments.iter())
        .map(|inc| inc.balance_info.account_id.as_str())
        .collect();
    assert!(funded_by.iter().all(|a| *a == "dan"));
}

#[tokio::test]
async fn test_short_funding_without_negative() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(1), 1, 1)).await;
    store_account(&h.accounts, "rif", vec![(MONETARY, Balance::new("main", dec!(4)))]).await;

    let mut cd = call("rif", 10);
    cd.deny_negative = true;
    let cc = h.rater.debit(&cd).await.unwrap();
    assert!(cc.not_enough_credit);
    assert_eq!(cc.duration(), Duration::seconds(4));
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(0));
}

#[tokio::test]
async fn test_debit_goes_negative_by_default() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(1), 1, 1)).await;
    store_account(&h.accounts, "rif", vec![(MONETARY, Balance::new("main", dec!(4)))]).await;

    let cc = h.rater.debit(&call("rif", 10)).await.unwrap();
    assert!(!cc.not_enough_credit);
    assert_eq!(cc.cost, dec!(10));
    let acc = h.accounts.get_account(TENANT, "rif").await.unwrap();
    assert_eq!(acc.default_money_value(), dec!(-6));
}

#[tokio::test]
async fn test_max_debit_force_duration() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(1), 1, 1)).await;
    store_account(&h.accounts, "rif", vec![(MONETARY, Balance::new("main", dec!(4)))]).await;

    let mut cd = call("rif", 10);
    cd.force_duration = true;
    let err = h.rater.max_debit(&cd).await.unwrap_err();
    assert_eq!(err.error_code(), "insufficient_credit");
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(4));

    cd.force_duration = false;
    let cc = h.rater.max_debit(&cd).await.unwrap();
    assert_eq!(cc.duration(), Duration::seconds(4));
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(0));
}

#[tokio::test]
async fn test_max_session_duration_then_debit() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(0.5), 1, 1)).await;
    store_account(&h.accounts, "rif", vec![(MONETARY, Balance::new("main", dec!(3)))]).await;

    let mut cd = call("rif", 60);
    let affordable = h.rater.get_max_session_duration(&cd).await.unwrap();
    assert_eq!(affordable, Duration::seconds(6));

    cd.time_end = cd.time_start + affordable;
    cd.duration_index = affordable;
    cd.deny_negative = true;
    let cc = h.rater.debit(&cd).await.unwrap();
    assert!(!cc.not_enough_credit);
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(0));
}

#[tokio::test]
async fn test_max_rate_caps_quotation() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(2), 1, 1)).await;
    store_account(&h.accounts, "rif", vec![(MONETARY, Balance::new("main", dec!(100)))]).await;

    let mut cd = call("rif", 30);
    cd.max_rate = dec!(1);
    cd.max_rate_unit = Duration::seconds(1);
    assert_eq!(h.rater.get_max_session_duration(&cd).await.unwrap(), Duration::zero());
}

#[tokio::test]
async fn test_unknown_account() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(1), 1, 1)).await;
    let err = h.rater.debit(&call("ghost", 10)).await.unwrap_err();
    assert!(err.is_not_found());
}
