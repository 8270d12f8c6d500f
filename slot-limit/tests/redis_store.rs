//! These tests need a disposable Redis (or Valkey) server.
//!
//! Run with `REDIS_URL=redis://127.0.0.1:6379/15 cargo test -- --ignored`. Each test uses its
//! own ids, but the database is expected to be empty of `concurrency:*` keys.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use slot_limit::ConcurrencyCache;
use slot_limit::RedisStore;
use slot_limit::StoreError;

async fn redis_cache(ttl: Duration) -> (ConcurrencyCache<RedisStore>, redis::aio::ConnectionManager) {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".into());
    let client = redis::Client::open(url).unwrap();
    let connection = redis::aio::ConnectionManager::new(client).await.unwrap();
    let store = RedisStore::new(connection.clone());
    (ConcurrencyCache::with_ttl(Arc::new(store), ttl), connection)
}

async fn clear(connection: &mut redis::aio::ConnectionManager, keys: &[&str]) {
    for key in keys {
        let _: i64 = connection.del(*key).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires a redis server at REDIS_URL"]
async fn it_admits_up_to_the_limit() {
    let (cache, mut connection) = redis_cache(Duration::from_secs(60)).await;
    clear(&mut connection, &["concurrency:account:9001"]).await;

    assert!(cache.try_acquire_account_slot(9001, 2, "A").await.unwrap());
    assert!(cache.try_acquire_account_slot(9001, 2, "B").await.unwrap());
    assert!(!cache.try_acquire_account_slot(9001, 2, "C").await.unwrap());

    // Retry of a held slot is always admitted
    assert!(cache.try_acquire_account_slot(9001, 2, "A").await.unwrap());

    cache.release_account_slot(9001, "B").await.unwrap();
    cache.release_account_slot(9001, "B").await.unwrap();
    assert!(cache.try_acquire_account_slot(9001, 2, "C").await.unwrap());
    assert_eq!(cache.get_account_concurrency(9001).await.unwrap(), 2);

    let ttl: i64 = connection.ttl("concurrency:account:9001").await.unwrap();
    assert!(ttl > 0 && ttl <= 60, "ledger key should carry the slot ttl, got {ttl}");

    clear(&mut connection, &["concurrency:account:9001"]).await;
}

#[tokio::test]
#[ignore = "requires a redis server at REDIS_URL"]
async fn it_bounds_the_wait_queue() {
    let (cache, mut connection) = redis_cache(Duration::from_secs(60)).await;
    clear(&mut connection, &["concurrency:wait:9002"]).await;

    assert!(cache.increment_wait_count(9002, 1).await.unwrap());
    assert!(!cache.increment_wait_count(9002, 1).await.unwrap());
    assert_eq!(cache.get_wait_count(9002).await.unwrap(), 1);

    cache.decrement_wait_count(9002).await.unwrap();
    cache.decrement_wait_count(9002).await.unwrap();
    assert_eq!(cache.get_wait_count(9002).await.unwrap(), 0);
    assert!(cache.increment_wait_count(9002, 1).await.unwrap());

    clear(&mut connection, &["concurrency:wait:9002"]).await;
}

#[tokio::test]
#[ignore = "requires a redis server at REDIS_URL"]
async fn it_expires_stale_slots() {
    let (cache, mut connection) = redis_cache(Duration::from_secs(1)).await;
    clear(&mut connection, &["concurrency:user:9003"]).await;

    assert!(cache.try_acquire_user_slot(9003, 1, "A").await.unwrap());
    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert_eq!(cache.get_user_concurrency(9003).await.unwrap(), 0);
    assert!(cache.try_acquire_user_slot(9003, 1, "B").await.unwrap());

    clear(&mut connection, &["concurrency:user:9003"]).await;
}

#[tokio::test]
#[ignore = "requires a redis server at REDIS_URL"]
async fn it_reports_wrong_type_as_an_error() {
    let (cache, mut connection) = redis_cache(Duration::from_secs(60)).await;
    let _: () = connection.set("concurrency:account:9004", "1").await.unwrap();

    // A string is not a ledger, and that is a failure rather than a denial
    let result = cache.try_acquire_account_slot(9004, 10, "A").await;
    assert!(matches!(result, Err(StoreError::Redis(_))));

    clear(&mut connection, &["concurrency:account:9004"]).await;
}

#[tokio::test]
#[ignore = "requires a redis server at REDIS_URL"]
async fn it_stays_bounded_across_handles() {
    let (cache, mut connection) = redis_cache(Duration::from_secs(60)).await;
    clear(&mut connection, &["concurrency:account:9005"]).await;

    let mut handles = vec![];
    for i in 0..64 {
        // Independent handles model independent processes
        let (other, _) = redis_cache(Duration::from_secs(60)).await;
        handles.push(tokio::spawn(async move {
            other
                .try_acquire_account_slot(9005, 10, &format!("req-{i}"))
                .await
                .unwrap()
        }));
    }
    let granted = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();

    assert_eq!(granted, 10);
    assert_eq!(cache.get_account_concurrency(9005).await.unwrap(), 10);

    clear(&mut connection, &["concurrency:account:9005"]).await;
}
