//! Redis-backed integration tests
//!
//! Run with a live server:
//!
//! ```text
//! LEASELOCK_REDIS_URL=redis://127.0.0.1:6379/ cargo test -p leaselock-core --features integration-tests
//! ```
//!
//! Every test uses its own uuid-suffixed key, so runs don't collide.

#![cfg(feature = "integration-tests")]

use leaselock_core::{
    config::{LockConfig, REDIS_URL_ENV},
    locking::{LockClient, LockKey, LockPrimitive, LockStatus, OwnershipToken, ReleaseOutcome},
    store::{LockStore, RedisStore},
};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

async fn connect() -> Option<RedisStore> {
    let Ok(url) = std::env::var(REDIS_URL_ENV) else {
        eprintln!("{} not set, skipping Redis test", REDIS_URL_ENV);
        return None;
    };
    Some(
        RedisStore::connect(&url, Duration::from_secs(2))
            .await
            .expect("Failed to connect to Redis"),
    )
}

fn unique_key(base: &str) -> String {
    format!("leaselock-test:{}:{}", base, uuid::Uuid::new_v4())
}

#[tokio::test]
async fn test_set_if_absent_and_compare_and_delete() {
    let Some(store) = connect().await else { return };
    let key = unique_key("cad");

    assert!(store.set_if_absent_with_ttl(&key, "one", Duration::from_secs(5)).await.unwrap());
    assert!(!store.set_if_absent_with_ttl(&key, "two", Duration::from_secs(5)).await.unwrap());

    assert!(!store.compare_and_delete(&key, "two").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("one"));

    assert!(store.compare_and_delete(&key, "one").await.unwrap());
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_sub_second_lease_expires() {
    let Some(store) = connect().await else { return };
    let primitive = LockPrimitive::new(Arc::new(store));
    let key = LockKey::new(unique_key("expiry")).unwrap();
    let first = OwnershipToken::generate();
    let second = OwnershipToken::generate();

    assert!(primitive.try_acquire(&key, &first, Duration::from_millis(100)).await.is_acquired());
    assert!(!primitive.try_acquire(&key, &second, Duration::from_secs(5)).await.is_acquired());

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(primitive.try_acquire(&key, &second, Duration::from_secs(5)).await.is_acquired());
    assert_eq!(primitive.release(&key, &first).await, ReleaseOutcome::Mismatch);
    assert_eq!(
        primitive.status(&key, Some(&second)).await.unwrap(),
        LockStatus::HeldBySelf
    );
    assert_eq!(primitive.release(&key, &second).await, ReleaseOutcome::Released);
}

#[tokio::test]
async fn test_compare_and_expire() {
    let Some(store) = connect().await else { return };
    let key = unique_key("extend");

    assert!(store.set_if_absent_with_ttl(&key, "owner", Duration::from_millis(200)).await.unwrap());
    assert!(!store.compare_and_expire(&key, "stranger", Duration::from_secs(5)).await.unwrap());
    assert!(store.compare_and_expire(&key, "owner", Duration::from_secs(5)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("owner"));

    assert!(store.delete(&key).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_across_connections() {
    let Ok(url) = std::env::var(REDIS_URL_ENV) else { return };
    let name = unique_key("mutex");

    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        // A separate connection per task, as separate processes would have
        let store = RedisStore::connect(&url, Duration::from_secs(2)).await.unwrap();
        let client = LockClient::new(
            Arc::new(store),
            LockConfig::default().with_poll_interval(Duration::from_millis(5)),
        );
        let name = name.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();

        handles.push(tokio::spawn(async move {
            client
                .run_exclusive(&name, Duration::from_secs(5), || async move {
                    let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now_inside, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), Infallible>(())
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bounded_wait_against_redis() {
    let Some(store) = connect().await else { return };
    let client = LockClient::with_defaults(Arc::new(store));
    let name = unique_key("timeout");

    let holder = client.acquire(&name, Duration::from_secs(10)).await.unwrap();
    let err = client
        .run_exclusive_or_timeout(&name, Duration::from_secs(5), Duration::from_millis(200), || async {
            Ok::<_, Infallible>(())
        })
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(holder.release().await, ReleaseOutcome::Released);
}
