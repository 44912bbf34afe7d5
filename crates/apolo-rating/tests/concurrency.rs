//! Concurrent debits on one account

mod common;

use std::sync::Arc;

use apolo_core::constants::MONETARY;
use apolo_core::models::Balance;
use rust_decimal_macros::dec;

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_match_sequential_total() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(1), 1, 1)).await;
    store_account(&h.accounts, "rif", vec![(MONETARY, Balance::new("main", dec!(100)))]).await;
    let rater = Arc::new(h.rater);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let rater = rater.clone();
        handles.push(tokio::spawn(async move { rater.debit(&call("rif", 3)).await }));
    }
    for handle in handles {
        let cc = handle.await.unwrap().unwrap();
        assert_eq!(cc.cost, dec!(3));
        assert!(!cc.not_enough_credit);
    }
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(76));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_forced_debits_refuse_exactly_one() {
    let h = harness();
    rate_nat(&h.catalog, interval(dec!(1), 1, 1)).await;
    store_account(&h.accounts, "rif", vec![(MONETARY, Balance::new("main", dec!(10)))]).await;
    let rater = Arc::new(h.rater);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let rater = rater.clone();
        handles.push(tokio::spawn(async move {
            let mut cd = call("rif", 2);
            cd.force_duration = true;
            rater.max_debit(&cd).await
        }));
    }
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(cc) => assert_eq!(cc.cost, dec!(2)),
            Err(e) => {
                assert_eq!(e.error_code(), "insufficient_credit");
                refused += 1;
            }
        }
    }
    assert_eq!(refused, 1);
    assert_eq!(money(&h.accounts, "rif", "main").await, dec!(0));
}
