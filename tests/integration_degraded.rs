//! Failure-injection integration tests
//!
//! Cache faults must never fail a request; datastore faults are retried and
//! surface only once retries run out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use stake_cache::backends::{InjectedFailure, MemoryDatastore};
use stake_cache::{BackingStoreClient, ListQuery, ManualClock, NewStake, RetryPolicy, StakeError};

/// Every cache write failing still lets the write path succeed
#[tokio::test]
async fn test_write_succeeds_with_cache_writes_failing() {
    let env = setup().await;
    env.kv.fail_writes(true);

    let created = env
        .service
        .create_stake(&user_ctx(1), NewStake::new(1, 42.0, 1).unwrap())
        .await
        .unwrap();

    assert_eq!(created.owner_id, 1);
    assert_eq!(env.datastore.len(), 1);
    let stats = env.service.stats();
    // record put and owner invalidation
    assert_eq!(stats.degraded_cache_writes, 2);
    // global and stake-create counters are writes too
    assert_eq!(stats.fail_open_decisions, 2);
}

/// With the cache fully down, reads fall through to the datastore
#[tokio::test]
async fn test_reads_fall_through_when_cache_is_down() {
    let env = setup().await;
    let seeded = seed_stakes(&env, 2, 3).await;
    env.kv.set_unavailable(true);
    let query = ListQuery::new(1, 20).unwrap();

    let first = env.service.list_stakes(&user_ctx(2), 2, query).await.unwrap();
    let second = env.service.list_stakes(&user_ctx(2), 2, query).await.unwrap();
    assert!(!first.served_from_cache);
    assert!(!second.served_from_cache);
    assert_eq!(first.items.len(), 3);

    let newest = seeded.last().unwrap();
    let lookup = env.service.get_stake(&user_ctx(2), newest.id).await.unwrap().unwrap();
    assert!(!lookup.served_from_cache);
    assert_eq!(&lookup.stake, newest);
    assert!(env.service.stats().degraded_cache_reads >= 3);
}

/// The cache recovering picks up where it left off
#[tokio::test]
async fn test_cache_recovery_repopulates() {
    let env = setup().await;
    seed_stakes(&env, 3, 2).await;
    let query = ListQuery::new(1, 20).unwrap();

    env.kv.set_unavailable(true);
    env.service.list_stakes(&user_ctx(3), 3, query).await.unwrap();

    env.kv.set_unavailable(false);
    env.service.list_stakes(&user_ctx(3), 3, query).await.unwrap();
    let page = env.service.list_stakes(&user_ctx(3), 3, query).await.unwrap();
    assert!(page.served_from_cache);
}

/// Transient datastore errors are retried with backoff
#[tokio::test(start_paused = true)]
async fn test_transient_store_errors_are_retried() {
    let env = setup().await;
    env.datastore.fail_next(2, InjectedFailure::Transient);

    let created = env
        .service
        .create_stake(&user_ctx(4), NewStake::new(4, 10.0, 12).unwrap())
        .await
        .unwrap();
    assert_eq!(env.datastore.len(), 1);
    assert_eq!(created.period.months(), 12);
}

/// Exhausted retries surface a store error
#[tokio::test(start_paused = true)]
async fn test_exhausted_store_retries_surface() {
    let env = setup().await;
    env.datastore.fail_next(3, InjectedFailure::Transient);

    let err = env
        .service
        .list_stakes(&user_ctx(5), 5, ListQuery::new(1, 20).unwrap())
        .await
        .unwrap_err();
    match err {
        StakeError::Store {
            operation,
            attempts,
            ..
        } => {
            assert_eq!(operation, "list_records");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Permanent datastore errors fail on the first attempt
#[tokio::test]
async fn test_rejected_store_operation_is_not_retried() {
    let env = setup().await;
    env.datastore.fail_next(1, InjectedFailure::Rejected);

    let err = env
        .service
        .create_stake(&user_ctx(6), NewStake::new(6, 10.0, 1).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, StakeError::Store { attempts: 1, .. }));
    assert!(env.datastore.is_empty());
}

/// The retry deadline cuts a loop short even with attempts left
#[tokio::test(start_paused = true)]
async fn test_store_retry_deadline() {
    let clock = Arc::new(ManualClock::default());
    let datastore = MemoryDatastore::with_clock(clock.clone());
    let client = BackingStoreClient::with_options(
        Arc::new(datastore.clone()),
        clock,
        Duration::from_secs(1800),
        RetryPolicy::STORE.with_deadline(Duration::from_millis(700)),
    );
    client.initialize_schema().await.unwrap();
    datastore.fail_next(3, InjectedFailure::Transient);

    let err = client.find_record(1).await.unwrap_err();
    // 500ms backoff fits, the next 1000ms does not
    assert!(matches!(err, StakeError::Store { attempts: 2, .. }));
}

/// Sessions are renewed as requests keep flowing past the max age
#[tokio::test]
async fn test_session_renewed_between_requests() {
    let env = setup().await;
    seed_stakes(&env, 8, 1).await;
    assert_eq!(env.datastore.connects(), 1);

    env.clock.advance(Duration::from_secs(31 * 60));
    seed_stakes(&env, 8, 1).await;
    assert_eq!(env.datastore.connects(), 2);
    assert_eq!(env.service.store().session_generation(), 2);

    for _ in 0..50 {
        if env.datastore.closes() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(env.datastore.closes(), 1);
    assert_eq!(env.datastore.len(), 2);
}
