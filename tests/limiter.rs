//! Limiter behaviour against store doubles and, when available, real Redis.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};

use tollgate::adapter::{RateLimitGuard, Verdict};
use tollgate::config::StoreConfig;
use tollgate::{CounterStore, LimiterStore, MemoryStore, RatePolicy, RedisStore, Result, TollgateError};

const WINDOW: Duration = Duration::from_secs(10);

/// Wraps `MemoryStore` but exposes only get/set/increment/ttl, so the
/// limiter uses the composed admission path and its local locks.
#[derive(Default)]
struct ComposedStore {
    inner: MemoryStore,
}

#[async_trait]
impl CounterStore for ComposedStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        // Widen the race window between the read and the increment.
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        tokio::task::yield_now().await;
        self.inner.increment(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.inner.expire(key, ttl).await
    }
}

/// Answers reads late, so a counter can expire between the read and the
/// increment that follows it.
#[derive(Default)]
struct SlowReadStore {
    inner: MemoryStore,
}

#[async_trait]
impl CounterStore for SlowReadStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let value = self.inner.get(key).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        value
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        self.inner.increment(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.inner.expire(key, ttl).await
    }
}

/// Fails every call as if the network were down, counting attempts.
#[derive(Default)]
struct UnreachableStore {
    calls: AtomicUsize,
    writes: AtomicUsize,
}

#[async_trait]
impl CounterStore for UnreachableStore {
    async fn get(&self, _key: &str) -> Result<Option<u64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TollgateError::StoreUnavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: u64, _ttl: Duration) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(TollgateError::StoreUnavailable("connection refused".into()))
    }

    async fn increment(&self, _key: &str) -> Result<u64> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(TollgateError::StoreUnavailable("connection refused".into()))
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
        Err(TollgateError::StoreUnavailable("connection refused".into()))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(TollgateError::StoreUnavailable("connection refused".into()))
    }
}

/// Never answers within any reasonable deadline.
struct StalledStore;

#[async_trait]
impl CounterStore for StalledStore {
    async fn get(&self, _key: &str) -> Result<Option<u64>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: u64, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn increment(&self, _key: &str) -> Result<u64> {
        Ok(1)
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
        Ok(None)
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }
}

fn policy(quota: u64) -> RatePolicy {
    RatePolicy::new(quota, WINDOW, None).unwrap()
}

#[tokio::test(start_paused = true)]
async fn composed_path_follows_window_lifecycle() {
    let limiter = LimiterStore::new(policy(10), Arc::new(ComposedStore::default()));

    for _ in 0..10 {
        assert!(assert_ok!(limiter.allow("1.2.3.4").await));
    }
    assert!(!assert_ok!(limiter.allow("1.2.3.4").await));
    assert_eq!(assert_ok!(limiter.counter_value("1.2.3.4").await), Some(10));

    tokio::time::advance(WINDOW).await;
    assert!(assert_ok!(limiter.allow("1.2.3.4").await));
}

#[tokio::test(start_paused = true)]
async fn counter_expiring_mid_admission_gets_a_new_window() {
    let store = Arc::new(SlowReadStore::default());
    let limiter = LimiterStore::new(policy(2), store.clone());

    assert!(assert_ok!(limiter.allow("a").await));

    // The next read lands just before expiry and returns after it.
    tokio::time::advance(Duration::from_millis(9_950)).await;
    assert!(assert_ok!(limiter.allow("a").await));
    assert!(assert_ok!(store.ttl("rate_limit:a").await).is_some());

    assert!(assert_ok!(limiter.allow("a").await));
    assert!(!assert_ok!(limiter.allow("a").await));

    tokio::time::advance(Duration::from_secs(3600)).await;
    assert!(assert_ok!(limiter.allow("a").await));
    assert_eq!(assert_ok!(limiter.counter_value("a").await), Some(1));
}

#[tokio::test(start_paused = true)]
async fn composed_path_recovers_counter_without_expiry() {
    let store = Arc::new(ComposedStore::default());
    store.inner.insert_raw("rate_limit:a", "2");
    let limiter = LimiterStore::new(policy(2), store.clone());

    assert!(!assert_ok!(limiter.allow("a").await));
    assert_eq!(assert_ok!(store.ttl("rate_limit:a").await), Some(WINDOW));

    tokio::time::advance(WINDOW).await;
    assert!(assert_ok!(limiter.allow("a").await));
}

#[tokio::test]
async fn composed_path_is_serialized_per_identifier() {
    let limiter = Arc::new(
        LimiterStore::new(policy(20), Arc::new(ComposedStore::default())).with_lock_shards(8),
    );

    let calls = (0..300).map(|i| {
        let limiter = limiter.clone();
        let identifier = if i % 3 == 0 { "cold" } else { "hot" };
        async move { (identifier, limiter.allow(identifier).await.unwrap()) }
    });
    let results = join_all(calls).await;

    let admitted = |id: &str| results.iter().filter(|(i, ok)| *i == id && *ok).count();
    assert_eq!(admitted("hot"), 20);
    assert_eq!(admitted("cold"), 20);
    assert_eq!(limiter.counter_value("hot").await.unwrap(), Some(20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn atomic_store_holds_under_parallel_load() {
    let limiter = Arc::new(LimiterStore::new(policy(50), Arc::new(MemoryStore::new())));

    let handles: Vec<_> = (0..1000)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow("burst").await.unwrap() })
        })
        .collect();

    let admitted = join_all(handles)
        .await
        .into_iter()
        .filter(|joined| *joined.as_ref().unwrap())
        .count();
    assert_eq!(admitted, 50);
}

#[tokio::test]
async fn store_failure_is_returned_without_writes() {
    let store = Arc::new(UnreachableStore::default());
    let limiter = LimiterStore::new(policy(10), store.clone());

    let err = assert_err!(limiter.allow("1.2.3.4").await);
    assert!(matches!(err, TollgateError::StoreUnavailable(_)));
    assert!(err.is_store_failure());
    assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_store_times_out() {
    let limiter = LimiterStore::new(policy(10), Arc::new(StalledStore));

    let err = assert_err!(
        limiter
            .allow_with_deadline("1.2.3.4", Duration::from_millis(50))
            .await
    );
    assert!(matches!(err, TollgateError::Timeout(d) if d == Duration::from_millis(50)));

    let err = assert_err!(limiter.allow("1.2.3.4").await);
    assert!(matches!(err, TollgateError::Timeout(_)));
}

#[tokio::test]
async fn guard_maps_store_failure_to_503() {
    let limiter = Arc::new(LimiterStore::new(
        policy(10),
        Arc::new(UnreachableStore::default()),
    ));
    let guard = RateLimitGuard::new(limiter);

    let verdict = guard.evaluate_identifier("1.2.3.4").await;
    assert!(matches!(verdict, Verdict::StoreError { .. }));
    assert_eq!(verdict.status_code(), 503);
}

#[tokio::test]
async fn guard_denies_after_quota() {
    let limiter = Arc::new(LimiterStore::new(policy(2), Arc::new(MemoryStore::new())));
    let guard = RateLimitGuard::new(limiter);

    assert_eq!(guard.evaluate_identifier("a").await.status_code(), 200);
    assert_eq!(guard.evaluate_identifier("a").await.status_code(), 200);
    assert_eq!(guard.evaluate_identifier("a").await.status_code(), 429);
    assert_eq!(guard.evaluate_identifier("b").await.status_code(), 200);
}

// Redis-backed tests. Run with a disposable instance:
//   TOLLGATE_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored

async fn redis_store() -> Option<RedisStore> {
    let url = std::env::var("TOLLGATE_TEST_REDIS_URL").ok()?;
    let config = StoreConfig {
        url,
        ..StoreConfig::default()
    };
    Some(RedisStore::connect(&config).await.unwrap())
}

fn unique_prefix(test: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("tollgate_test:{}:{}:", test, nanos)
}

#[tokio::test]
#[ignore = "requires TOLLGATE_TEST_REDIS_URL"]
async fn redis_quota_and_expiry() {
    let Some(store) = redis_store().await else {
        return;
    };
    let policy = RatePolicy::new(10, Duration::from_secs(1), None).unwrap();
    let limiter = LimiterStore::new(policy, Arc::new(store)).with_prefix(&unique_prefix("expiry"));

    for _ in 0..10 {
        assert!(limiter.allow("1.2.3.4").await.unwrap());
    }
    assert!(!limiter.allow("1.2.3.4").await.unwrap());
    assert_eq!(limiter.counter_value("1.2.3.4").await.unwrap(), Some(10));

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(limiter.allow("1.2.3.4").await.unwrap());
}

#[tokio::test]
#[ignore = "requires TOLLGATE_TEST_REDIS_URL"]
async fn redis_two_limiters_share_one_quota() {
    let (Some(a), Some(b)) = (redis_store().await, redis_store().await) else {
        return;
    };
    let prefix = unique_prefix("shared");
    let first = Arc::new(LimiterStore::new(policy(30), Arc::new(a)).with_prefix(&prefix));
    let second = Arc::new(LimiterStore::new(policy(30), Arc::new(b)).with_prefix(&prefix));

    let calls = (0..200).map(|i| {
        let limiter = if i % 2 == 0 { first.clone() } else { second.clone() };
        async move { limiter.allow("shared").await.unwrap() }
    });
    let admitted = join_all(calls).await.into_iter().filter(|ok| *ok).count();
    assert_eq!(admitted, 30);
}

#[tokio::test]
#[ignore = "requires TOLLGATE_TEST_REDIS_URL"]
async fn redis_malformed_counter_is_reported() {
    let Some(store) = redis_store().await else {
        return;
    };
    let prefix = unique_prefix("malformed");
    let mut conn = redis::Client::open(std::env::var("TOLLGATE_TEST_REDIS_URL").unwrap())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    let _: () = redis::cmd("SET")
        .arg(format!("{}bad", prefix))
        .arg("garbage")
        .query_async(&mut conn)
        .await
        .unwrap();

    let limiter = LimiterStore::new(policy(10), Arc::new(store)).with_prefix(&prefix);
    let err = limiter.allow("bad").await.unwrap_err();
    assert!(matches!(err, TollgateError::MalformedCounterValue { .. }));
}

#[tokio::test]
#[ignore = "requires TOLLGATE_TEST_REDIS_URL"]
async fn redis_rejects_non_decimal_counters() {
    let Some(store) = redis_store().await else {
        return;
    };
    let prefix = unique_prefix("non_decimal");
    let mut conn = redis::Client::open(std::env::var("TOLLGATE_TEST_REDIS_URL").unwrap())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    for (id, raw) in [("float", "10.0"), ("exp", "1e3"), ("hex", "0x10")] {
        let _: () = redis::cmd("SET")
            .arg(format!("{}{}", prefix, id))
            .arg(raw)
            .query_async(&mut conn)
            .await
            .unwrap();
    }

    let limiter = LimiterStore::new(policy(10_000), Arc::new(store)).with_prefix(&prefix);
    for id in ["float", "exp", "hex"] {
        let err = limiter.allow(id).await.unwrap_err();
        assert!(
            matches!(err, TollgateError::MalformedCounterValue { .. }),
            "{} should be malformed, got {:?}",
            id,
            err
        );
    }
}
