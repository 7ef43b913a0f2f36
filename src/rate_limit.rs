use crate::config::RateLimitConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// External store holding one timestamped entry per admitted request.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn count_since(&self, actor: &str, since: DateTime<Utc>) -> Result<u64, StoreError>;
    async fn record(&self, actor: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Sorted set per actor scored by epoch millis; members that fell out of the
/// window are trimmed before each count.
pub struct RedisCounterStore {
    client: redis::Client,
    window_secs: i64,
}

impl RedisCounterStore {
    pub fn new(client: redis::Client, config: RateLimitConfig) -> Self {
        Self {
            client,
            window_secs: config.window.as_secs() as i64,
        }
    }

    fn key(actor: &str) -> String {
        format!("ceylog:rate_limits:{actor}")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn count_since(&self, actor: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let key = Self::key(actor);
        let _: u64 = conn
            .zrembyscore(&key, "-inf", since.timestamp_millis())
            .await
            .map_err(|err| StoreError::Command(err.to_string()))?;
        let min = format!("({}", since.timestamp_millis());
        conn.zcount(&key, min, "+inf")
            .await
            .map_err(|err| StoreError::Command(err.to_string()))
    }

    async fn record(&self, actor: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = Self::key(actor);
        let member = format!("{}:{}", at.timestamp_millis(), uuid::Uuid::new_v4());
        let _: () = conn
            .zadd(&key, member, at.timestamp_millis())
            .await
            .map_err(|err| StoreError::Command(err.to_string()))?;
        let _: () = conn
            .expire(&key, self.window_secs)
            .await
            .map_err(|err| StoreError::Command(err.to_string()))?;
        Ok(())
    }
}

/// Process-local store used when no `REDIS_URL` is configured.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn count_since(&self, actor: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.entries.lock().await;
        // Every actor shares one window, so stale stamps are swept for all of them.
        guard.retain(|_, stamps| {
            stamps.retain(|stamp| *stamp > since);
            !stamps.is_empty()
        });
        let count = guard.get(actor).map(Vec::len).unwrap_or(0);
        Ok(count as u64)
    }

    async fn record(&self, actor: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().await;
        guard.entry(actor.to_string()).or_default().push(at);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// The store failed; the request proceeds without being counted.
    AllowedUnchecked,
    Limited,
}

/// Trailing-window limiter. Count and record are separate store calls, so
/// concurrent requests from one actor can both pass near the ceiling.
#[derive(Clone)]
pub struct RateGate {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateGate {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub async fn check(&self, actor: &str) -> RateDecision {
        let decision = self.evaluate(actor).await;
        crate::metrics::rate_gate(match decision {
            RateDecision::Allowed => "allowed",
            RateDecision::AllowedUnchecked => "allowed_unchecked",
            RateDecision::Limited => "limited",
        });
        decision
    }

    async fn evaluate(&self, actor: &str) -> RateDecision {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let since = now - window;

        let count = match self.store.count_since(actor, since).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    target = "ceylog.rate_limit",
                    actor,
                    error = %err,
                    "rate limit check failed, allowing request"
                );
                return RateDecision::AllowedUnchecked;
            }
        };

        if count >= self.config.max_requests {
            return RateDecision::Limited;
        }

        if let Err(err) = self.store.record(actor, now).await {
            warn!(
                target = "ceylog.rate_limit",
                actor,
                error = %err,
                "rate limit record failed, allowing request"
            );
            return RateDecision::AllowedUnchecked;
        }
        RateDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Barrier;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn count_since(&self, _: &str, _: DateTime<Utc>) -> Result<u64, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn record(&self, _: &str, _: DateTime<Utc>) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
    }

    fn config(max_requests: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn ceiling_is_inclusive_of_prior_requests() {
        let gate = RateGate::new(Arc::new(MemoryCounterStore::default()), config(10));
        for _ in 0..10 {
            assert_eq!(gate.check("alice").await, RateDecision::Allowed);
        }
        assert_eq!(gate.check("alice").await, RateDecision::Limited);
        assert_eq!(gate.check("bob").await, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn entries_outside_window_are_ignored() {
        let store = Arc::new(MemoryCounterStore::default());
        let stale = Utc::now() - chrono::Duration::hours(2);
        for _ in 0..5 {
            store.record("alice", stale).await.unwrap();
        }
        let gate = RateGate::new(store, config(5));
        assert_eq!(gate.check("alice").await, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let gate = RateGate::new(Arc::new(BrokenStore), config(1));
        assert_eq!(gate.check("alice").await, RateDecision::AllowedUnchecked);
        assert_eq!(gate.check("alice").await, RateDecision::AllowedUnchecked);
    }

    #[tokio::test]
    async fn limited_requests_are_not_recorded() {
        let store = Arc::new(MemoryCounterStore::default());
        let gate = RateGate::new(store.clone(), config(1));
        gate.check("alice").await;
        gate.check("alice").await;
        let since = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.count_since("alice", since).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_actors_are_dropped_on_count() {
        let store = Arc::new(MemoryCounterStore::default());
        let stale = Utc::now() - chrono::Duration::days(30);
        for i in 0..50 {
            store.record(&format!("actor-{i}"), stale).await.unwrap();
        }
        let gate = RateGate::new(store.clone(), config(10));
        for _ in 0..3 {
            assert_eq!(gate.check("alice").await, RateDecision::Allowed);
        }
        let entries = store.entries.lock().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["alice"].len(), 3);
    }

    /// Holds every `count_since` until all concurrent callers have counted.
    struct LockstepStore {
        inner: MemoryCounterStore,
        barrier: Barrier,
    }

    #[async_trait]
    impl CounterStore for LockstepStore {
        async fn count_since(&self, actor: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
            let count = self.inner.count_since(actor, since).await;
            self.barrier.wait().await;
            count
        }

        async fn record(&self, actor: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.record(actor, at).await
        }
    }

    #[tokio::test]
    async fn concurrent_requests_at_the_ceiling_can_both_pass() {
        let store = Arc::new(LockstepStore {
            inner: MemoryCounterStore::default(),
            barrier: Barrier::new(2),
        });
        store.inner.record("alice", Utc::now()).await.unwrap();
        store.inner.record("alice", Utc::now()).await.unwrap();
        let gate = RateGate::new(store.clone(), config(3));

        let (first, second) = tokio::join!(gate.check("alice"), gate.check("alice"));
        assert_eq!(first, RateDecision::Allowed);
        assert_eq!(second, RateDecision::Allowed);

        let since = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.inner.count_since("alice", since).await.unwrap(), 4);
    }
}
