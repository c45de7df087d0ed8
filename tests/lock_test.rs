//! Durable lock integration tests.

mod common;

use apiary::domain::errors::DomainError;
use apiary::services::lock::LockOptions;
use common::offline_substrate;

#[tokio::test]
async fn first_acquire_starts_at_seq_zero() {
    let substrate = offline_substrate().await;
    let mut handle = substrate
        .locks
        .acquire("epic:decompose", LockOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.seq, 0);
    handle.release().await.unwrap();
}

#[tokio::test]
async fn contended_acquire_waits_then_advances_seq() {
    let substrate = offline_substrate().await;
    let mut first = substrate
        .locks
        .acquire(
            "resource",
            LockOptions {
                holder: Some("alpha".into()),
                ..LockOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.seq, 0);

    // Second holder spins on backoff until the first releases.
    let locks = substrate.locks.clone();
    let waiter = tokio::spawn(async move {
        locks
            .acquire(
                "resource",
                LockOptions {
                    holder: Some("beta".into()),
                    max_retries: Some(50),
                    base_delay_ms: Some(10),
                    ..LockOptions::default()
                },
            )
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    first.release().await.unwrap();

    let mut second = waiter.await.unwrap().unwrap();
    assert_eq!(second.holder, "beta");
    assert_eq!(second.seq, 1);
    second.release().await.unwrap();
}

#[tokio::test]
async fn exactly_one_of_two_racers_wins_the_first_round() {
    let substrate = offline_substrate().await;
    let locks_a = substrate.locks.clone();
    let locks_b = substrate.locks.clone();

    let no_retry = |holder: &str| LockOptions {
        holder: Some(holder.into()),
        max_retries: Some(0),
        ..LockOptions::default()
    };

    let (a, b) = tokio::join!(
        locks_a.acquire("race", no_retry("alpha")),
        locks_b.acquire("race", no_retry("beta")),
    );

    let winners = [a.is_ok(), b.is_ok()].iter().filter(|w| **w).count();
    assert_eq!(winners, 1);
    let mut handle = a.or(b).unwrap();
    assert_eq!(handle.seq, 0);
    handle.release().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_fail_with_lock_timeout() {
    let substrate = offline_substrate().await;
    let _held = substrate
        .locks
        .acquire(
            "busy",
            LockOptions {
                holder: Some("alpha".into()),
                ..LockOptions::default()
            },
        )
        .await
        .unwrap();

    let err = substrate
        .locks
        .acquire(
            "busy",
            LockOptions {
                holder: Some("beta".into()),
                max_retries: Some(2),
                base_delay_ms: Some(5),
                ..LockOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::LockTimeout { .. }));
}

#[tokio::test]
async fn same_holder_reacquires_and_advances() {
    let substrate = offline_substrate().await;
    let options = || LockOptions {
        holder: Some("alpha".into()),
        ..LockOptions::default()
    };

    let first = substrate.locks.acquire("resource", options()).await.unwrap();
    assert_eq!(first.seq, 0);
    drop(first);

    // Re-entrant: the same holder advances without waiting for expiry.
    let second = substrate.locks.acquire("resource", options()).await.unwrap();
    assert_eq!(second.seq, 1);
}

#[tokio::test]
async fn stale_handles_cannot_release_a_reacquired_lock() {
    let substrate = offline_substrate().await;
    let mut stale = substrate
        .locks
        .acquire(
            "resource",
            LockOptions {
                ttl_seconds: Some(1),
                holder: Some("alpha".into()),
                ..LockOptions::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    // Expired; beta takes over.
    let mut current = substrate
        .locks
        .acquire(
            "resource",
            LockOptions {
                holder: Some("beta".into()),
                ..LockOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(current.seq, 1);

    let err = stale.release().await.unwrap_err();
    assert!(matches!(err, DomainError::LockNotHeld { .. }));
    current.release().await.unwrap();
}

#[tokio::test]
async fn with_lock_releases_on_success_and_error() {
    let substrate = offline_substrate().await;

    let value = substrate
        .locks
        .with_lock("resource", LockOptions::default(), || async { Ok(41 + 1) })
        .await
        .unwrap();
    assert_eq!(value, 42);

    let err: Result<(), _> = substrate
        .locks
        .with_lock("resource", LockOptions::default(), || async {
            Err(DomainError::Validation("boom".into()))
        })
        .await;
    assert!(err.is_err());

    // Both paths released: a fresh acquire succeeds immediately.
    let handle = substrate
        .locks
        .acquire(
            "resource",
            LockOptions {
                max_retries: Some(0),
                ..LockOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(handle.seq >= 2);
}

#[tokio::test]
async fn manager_release_requires_holding() {
    let substrate = offline_substrate().await;
    let err = substrate.locks.release("nothing", "nobody").await.unwrap_err();
    assert!(matches!(err, DomainError::LockNotHeld { .. }));
}
