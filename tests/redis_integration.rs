// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexLock.
//
// PlexLock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexLock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexLock. If not, see <https://www.gnu.org/licenses/>.

//! Lock coordination against real Redis endpoints.
//!
//! The single-store tests use database 0; the three-store tests use
//! databases 1-3 of the same server as independent keyspaces. Keys are
//! hash-tagged (`{r}...`) so the suite also works against a cluster.

use plexlock::{LockError, RedLock, RedisScriptStore, ScriptStore, Settings};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const REDIS_URL: &str = "redis://localhost:6379";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn single_store_manager() -> RedLock {
    let store = RedisScriptStore::connect(REDIS_URL)
        .await
        .expect("Failed to connect to Redis (ensure Redis is running)");
    RedLock::new(vec![Arc::new(store) as Arc<dyn ScriptStore>]).unwrap()
}

fn db_url(db: u8) -> String {
    format!("{}/{}", REDIS_URL, db)
}

async fn three_store_manager() -> RedLock {
    let mut stores: Vec<Arc<dyn ScriptStore>> = Vec::new();
    for db in 1..=3 {
        let store = RedisScriptStore::connect(&db_url(db))
            .await
            .expect("Failed to connect to Redis (ensure Redis is running)");
        stores.push(Arc::new(store));
    }
    RedLock::new(stores).unwrap()
}

async fn raw_connection(url: &str) -> redis::aio::ConnectionManager {
    let client = redis::Client::open(url).unwrap();
    redis::aio::ConnectionManager::new(client).await.unwrap()
}

fn fast_settings() -> Settings {
    Settings {
        retry_delay: Duration::from_millis(5),
        retry_jitter: Duration::from_millis(2),
        ..Settings::default()
    }
}

fn resources(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_redis_acquire_extend_release_round_trip() {
    init_tracing();
    let manager = single_store_manager().await;
    let mut conn = raw_connection(REDIS_URL).await;
    let _: () = conn.del("{r}a").await.unwrap();

    let mut lock = manager
        .acquire(&resources(&["{r}a"]), Duration::from_millis(10_000), None)
        .await
        .unwrap();

    let held: Option<String> = conn.get("{r}a").await.unwrap();
    assert_eq!(held, Some(lock.value().to_string()));
    let pttl: i64 = conn.pttl("{r}a").await.unwrap();
    assert!(pttl > 0 && pttl <= 10_000);

    lock.extend(Duration::from_millis(30_000)).await.unwrap();
    let held: Option<String> = conn.get("{r}a").await.unwrap();
    assert_eq!(held, Some(lock.value().to_string()));
    let pttl: i64 = conn.pttl("{r}a").await.unwrap();
    assert!(pttl > 10_000 && pttl <= 30_000);

    lock.release().await.unwrap();
    let held: Option<String> = conn.get("{r}a").await.unwrap();
    assert_eq!(held, None);
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_redis_noscript_fallback_caches_scripts() {
    init_tracing();
    let manager = single_store_manager().await;
    let mut conn = raw_connection(REDIS_URL).await;
    let _: () = redis::cmd("SCRIPT")
        .arg("FLUSH")
        .query_async(&mut conn)
        .await
        .unwrap();

    // First call falls back to EVAL; second is served from the cache.
    let lock = manager
        .acquire(&resources(&["{r}cache"]), Duration::from_millis(5_000), None)
        .await
        .unwrap();
    lock.release().await.unwrap();

    let lock = manager
        .acquire(&resources(&["{r}cache"]), Duration::from_millis(5_000), None)
        .await
        .unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_redis_contention_exhausts_retry_budget() {
    init_tracing();
    let manager = single_store_manager().await;
    let mut conn = raw_connection(REDIS_URL).await;
    let _: () = conn.set("{r}held", "foreign").await.unwrap();

    let result = manager
        .acquire(
            &resources(&["{r}held"]),
            Duration::from_millis(10_000),
            Some(&fast_settings()),
        )
        .await;

    match result {
        Err(LockError::QuorumFailed { attempts }) => {
            assert_eq!(attempts.len(), 11);
            let stats = attempts[0].resolved().await;
            for error in stats.votes_against.values() {
                assert_eq!(
                    error.to_string(),
                    "The operation was applied to: 0 of the 1 requested resources."
                );
            }
        }
        other => panic!("expected QuorumFailed, got {:?}", other.map(|_| ())),
    }

    let held: Option<String> = conn.get("{r}held").await.unwrap();
    assert_eq!(held, Some("foreign".to_string()));
    let _: () = conn.del("{r}held").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_redis_expired_lock_frees_resource() {
    init_tracing();
    let manager = single_store_manager().await;
    let mut conn = raw_connection(REDIS_URL).await;
    let _: () = conn.del("{r}d").await.unwrap();

    let first = manager
        .acquire(&resources(&["{r}d"]), Duration::from_millis(200), None)
        .await
        .unwrap();
    let first_value = first.value().to_string();

    sleep(Duration::from_millis(300)).await;

    let second = manager
        .acquire(&resources(&["{r}d"]), Duration::from_millis(200), None)
        .await
        .unwrap();
    assert_ne!(second.value(), first_value);
    let _ = second.release().await;
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_redis_minority_store_with_foreign_value() {
    init_tracing();
    let manager = three_store_manager().await;
    let mut minority = raw_connection(&db_url(1)).await;
    let mut majority_a = raw_connection(&db_url(2)).await;
    let mut majority_b = raw_connection(&db_url(3)).await;
    for conn in [&mut minority, &mut majority_a, &mut majority_b] {
        let _: () = conn.del("{r}b").await.unwrap();
    }
    let _: () = minority.set("{r}b", "foreign").await.unwrap();

    let lock = manager
        .acquire(&resources(&["{r}b"]), Duration::from_millis(10_000), None)
        .await
        .unwrap();

    // The pre-held store keeps the foreign value without an expiry.
    let held: Option<String> = minority.get("{r}b").await.unwrap();
    assert_eq!(held, Some("foreign".to_string()));
    let ttl: i64 = minority.ttl("{r}b").await.unwrap();
    assert_eq!(ttl, -1);

    lock.release().await.unwrap();
    let held: Option<String> = minority.get("{r}b").await.unwrap();
    assert_eq!(held, Some("foreign".to_string()));
    for conn in [&mut majority_a, &mut majority_b] {
        let held: Option<String> = conn.get("{r}b").await.unwrap();
        assert_eq!(held, None);
    }
    let _: () = minority.del("{r}b").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_redis_using_keeps_routine_lock_alive() {
    init_tracing();
    let manager = single_store_manager().await;
    let mut conn = raw_connection(REDIS_URL).await;
    let _: () = conn.del("{r}x").await.unwrap();

    let settings = Settings {
        automatic_extension_threshold: Duration::from_millis(200),
        ..Settings::default()
    };
    let url = REDIS_URL.to_string();

    let observed = manager
        .using(
            &resources(&["{r}x"]),
            Duration::from_millis(500),
            Some(&settings),
            |signal| async move {
                let mut conn = raw_connection(&url).await;
                let before: Option<String> = conn.get("{r}x").await.unwrap();
                sleep(Duration::from_millis(700)).await;
                let after: Option<String> = conn.get("{r}x").await.unwrap();
                assert!(!signal.is_aborted());
                (before, after)
            },
        )
        .await
        .unwrap();

    assert!(observed.0.is_some());
    assert_eq!(observed.0, observed.1);
    let held: Option<String> = conn.get("{r}x").await.unwrap();
    assert_eq!(held, None);
}
