//! Live-backend scenarios. Ignored by default: they need reachable
//! servers.
//!
//! ```text
//! REDIS_ADDR=127.0.0.1:6379 MEMCACHED_ADDR=127.0.0.1:11211 \
//!     cargo test --test remote_backends -- --ignored
//! ```
//!
//! Policy keys embed a per-run nonce so reruns never see stale state.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ratelimit::{
    Algorithm, Backend, BucketConfig, Context, MemcachedConfig, PolicyConfig, RedisConfig,
    Registry, WindowConfig,
};

fn redis_addr() -> String {
    std::env::var("REDIS_ADDR").unwrap_or_else(|_| "127.0.0.1:6379".to_string())
}

fn memcached_addr() -> String {
    std::env::var("MEMCACHED_ADDR").unwrap_or_else(|_| "127.0.0.1:11211".to_string())
}

fn run_key(name: &str) -> String {
    let nonce = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("{}-{}", name, nonce)
}

fn redis_config() -> RedisConfig {
    serde_json::from_value(serde_json::json!({ "address": redis_addr() })).unwrap()
}

fn redis_policy(name: &str, algorithm: Algorithm) -> PolicyConfig {
    PolicyConfig {
        key: run_key(name),
        algorithm,
        backend: Backend::Redis,
        window: Some(WindowConfig { duration: Duration::from_secs(2), limit: 3 }),
        bucket: Some(BucketConfig { rate: 5.0, capacity: 2 }),
        redis: Some(redis_config()),
        memcached: None,
    }
}

fn memcached_policy(name: &str, algorithm: Algorithm) -> PolicyConfig {
    PolicyConfig {
        key: run_key(name),
        algorithm,
        backend: Backend::Memcached,
        window: Some(WindowConfig { duration: Duration::from_secs(1), limit: 2 }),
        bucket: Some(BucketConfig { rate: 5.0, capacity: 2 }),
        redis: None,
        memcached: Some(MemcachedConfig { addresses: vec![memcached_addr()] }),
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn redis_fixed_window_counts_across_calls() {
    let policy = redis_policy("fw", Algorithm::FixedWindow);
    let key = policy.key.clone();
    let registry = Registry::from_policies(vec![policy]).await.unwrap();
    let ctx = Context::background();

    for _ in 0..3 {
        assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    }
    assert!(!registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    // Another identifier is unaffected.
    assert!(registry.decide(&ctx, &key, "u2").await.unwrap().is_allowed());

    registry.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn redis_sliding_window_recovers_as_weight_decays() {
    let policy = redis_policy("sw", Algorithm::SlidingWindow);
    let key = policy.key.clone();
    let registry = Registry::from_policies(vec![policy]).await.unwrap();
    let ctx = Context::background();

    for _ in 0..3 {
        assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    }
    assert!(!registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    // 2.2 windows later the old bucket's weight has mostly decayed.
    tokio::time::sleep(Duration::from_millis(4400)).await;
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    registry.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn redis_token_bucket_refills() {
    let policy = redis_policy("tb", Algorithm::TokenBucket);
    let key = policy.key.clone();
    let registry = Registry::from_policies(vec![policy]).await.unwrap();
    let ctx = Context::background();

    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(!registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    // rate 5/s: one token is back within ~200ms.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    registry.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn redis_leaky_bucket_drains() {
    let policy = redis_policy("lb", Algorithm::LeakyBucket);
    let key = policy.key.clone();
    let registry = Registry::from_policies(vec![policy]).await.unwrap();
    let ctx = Context::background();

    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(!registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    // rate 5/s: a full unit drains within 200ms.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    registry.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running Memcached"]
async fn memcached_fixed_window_expires_with_key() {
    let policy = memcached_policy("fw", Algorithm::FixedWindow);
    let key = policy.key.clone();
    let registry = Registry::from_policies(vec![policy]).await.unwrap();
    let ctx = Context::background();

    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(!registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    // The counter key was added with a 1s TTL.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    registry.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running Memcached"]
async fn memcached_sliding_log_tracks_exact_timestamps() {
    let policy = memcached_policy("swl", Algorithm::SlidingWindow);
    let key = policy.key.clone();
    let registry = Registry::from_policies(vec![policy]).await.unwrap();
    let ctx = Context::background();

    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    let denied = registry.decide(&ctx, &key, "u1").await.unwrap();
    assert!(!denied.is_allowed());
    assert!(denied.retry_after.is_some());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    registry.close().unwrap();
}

#[tokio::test]
#[ignore = "requires a running Memcached"]
async fn memcached_token_bucket_persists_state() {
    let policy = memcached_policy("tb", Algorithm::TokenBucket);
    let key = policy.key.clone();
    let registry = Registry::from_policies(vec![policy]).await.unwrap();
    let ctx = Context::background();

    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());
    assert!(!registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.decide(&ctx, &key, "u1").await.unwrap().is_allowed());

    registry.close().unwrap();
}
