mod support;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use haulage::enforce::Enforcer;
use haulage::metrics::Metrics;
use haulage::storage::{Store, SubscriberStatus};
use tokio::sync::broadcast;

use support::{FilterCall, MemoryStore, RecordingFilter};

fn enforcer(
    store: Arc<MemoryStore>,
    filter: RecordingFilter,
) -> Arc<Enforcer<MemoryStore, RecordingFilter>> {
    Arc::new(Enforcer::new(store, filter, Metrics::new()))
}

fn status(addr: &str, prior: i64, current: i64) -> SubscriberStatus {
    SubscriberStatus {
        addr: addr.parse().unwrap(),
        current_balance: current,
        prior_balance: prior,
        currency_balance: Decimal::ZERO,
    }
}

#[tokio::test]
async fn startup_reconciliation_matches_persisted_state() {
    let store = MemoryStore::with_account("10.45.0.7", "001010000000001", 1_000, true);
    store.add_account("10.45.0.8", "001010000000002", 0, false);
    let filter = RecordingFilter::default();
    let enforcer = enforcer(Arc::clone(&store), filter.clone());

    enforcer.reconcile().await.unwrap();

    let calls = filter.calls();
    let a: IpAddr = "10.45.0.7".parse().unwrap();
    let b: IpAddr = "10.45.0.8".parse().unwrap();
    assert_eq!(
        calls
            .iter()
            .filter(|c| **c == FilterCall::Disable(a))
            .count(),
        1
    );
    assert_eq!(
        calls.iter().filter(|c| **c == FilterCall::Enable(b)).count(),
        1
    );
    assert_eq!(calls.len(), 2);
    assert!(!filter.is_blocked("10.45.0.7"));
    assert!(filter.is_blocked("10.45.0.8"));
}

#[tokio::test]
async fn comfortable_balance_takes_the_fast_path() {
    let store = MemoryStore::with_account("10.45.0.7", "001010000000001", 50_000_000, true);
    let filter = RecordingFilter::default();
    let enforcer = enforcer(Arc::clone(&store), filter.clone());

    enforcer.review(&status("10.45.0.7", 60_000_000, 50_000_000)).await;

    assert!(filter.calls().is_empty());
    assert!(store.account("10.45.0.7").bridged);
}

#[tokio::test]
async fn exhaustion_blocks_and_records_bridged_state() {
    let store = MemoryStore::with_account("10.45.0.7", "001010000000001", 0, true);
    let filter = RecordingFilter::default();
    let enforcer = enforcer(Arc::clone(&store), filter.clone());

    enforcer.review(&status("10.45.0.7", 20_000, 0)).await;

    let addr: IpAddr = "10.45.0.7".parse().unwrap();
    assert_eq!(filter.calls(), vec![FilterCall::Enable(addr)]);
    assert!(!store.account("10.45.0.7").bridged);
}

#[tokio::test]
async fn crossing_several_thresholds_fires_only_the_most_critical() {
    let store = MemoryStore::with_account("10.45.0.7", "001010000000001", 900_000, true);
    let filter = RecordingFilter::default();
    let enforcer = enforcer(Arc::clone(&store), filter.clone());

    // From 12MB straight through the 10MB, 5MB, and 1MB marks, but still
    // positive: warnings only, no filter traffic.
    enforcer.review(&status("10.45.0.7", 12_000_000, 900_000)).await;

    assert!(filter.calls().is_empty());
    assert!(store.account("10.45.0.7").bridged);
}

#[tokio::test]
async fn repeated_exhaustion_reviews_are_idempotent() {
    let store = MemoryStore::with_account("10.45.0.7", "001010000000001", 0, true);
    let filter = RecordingFilter::default();
    let enforcer = enforcer(Arc::clone(&store), filter.clone());

    enforcer.review(&status("10.45.0.7", 20_000, 0)).await;
    // A later commit that stays at zero does not cross the threshold again.
    enforcer.review(&status("10.45.0.7", 0, 0)).await;

    let addr: IpAddr = "10.45.0.7".parse().unwrap();
    assert_eq!(filter.calls(), vec![FilterCall::Enable(addr)]);
    assert!(filter.is_blocked("10.45.0.7"));
}

#[tokio::test(start_paused = true)]
async fn topup_poller_restores_forwarding() {
    let store = MemoryStore::with_account("10.45.0.7", "001010000000001", 50_000_000, false);
    let filter = RecordingFilter::with_blocked(&["10.45.0.7"]);
    let enforcer = enforcer(Arc::clone(&store), filter.clone());

    let (shutdown_tx, _) = broadcast::channel(1);
    let poller = tokio::spawn(
        Arc::clone(&enforcer).run_topup_poller(Duration::from_secs(10), shutdown_tx.subscribe()),
    );

    tokio::time::sleep(Duration::from_secs(11)).await;

    let addr: IpAddr = "10.45.0.7".parse().unwrap();
    assert!(filter.calls().contains(&FilterCall::Disable(addr)));
    assert!(!filter.is_blocked("10.45.0.7"));
    assert!(store.account("10.45.0.7").bridged);

    // A bridged subscriber no longer shows up as topped up.
    assert!(store.query_topped_up_subscribers().await.unwrap().is_empty());

    shutdown_tx.send(()).unwrap();
    poller.await.unwrap();
}

#[tokio::test]
async fn bridged_state_round_trips_through_the_store() {
    let store = MemoryStore::with_account("10.45.0.7", "001010000000001", 1_000, true);

    store
        .update_bridged_state("10.45.0.7".parse().unwrap(), false)
        .await
        .unwrap();
    let state = store.query_global_bridged_state().await.unwrap();
    assert_eq!(state.len(), 1);
    assert!(!state[0].bridged);

    store
        .update_bridged_state("10.45.0.7".parse().unwrap(), true)
        .await
        .unwrap();
    let state = store.query_global_bridged_state().await.unwrap();
    assert!(state[0].bridged);
}
