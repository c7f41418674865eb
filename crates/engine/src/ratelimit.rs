//! Tiered fixed-window rate limiting.
//!
//! Counters live in a [`CounterStore`]. Each window gets its own key
//! (`rate_limit:{service}:{tier}:{identity}:{window_start}`) so a fresh window
//! never inherits the previous count, and the store expires old keys on its own.
//!
//! The check and the increment happen in one atomic store operation: a denied
//! request never consumes capacity, and two racing requests cannot both take the
//! last slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use thiserror::Error;

use courier_common::types::{Channel, RateLimitHeaders, RateLimitTier};

/// Get, compare, increment and expire as one server-side step.
///
/// Returns `{allowed, count}` where `count` is the value after the call.
const CHECK_AND_INCREMENT_LUA: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return {0, current}
end
current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return {1, current}
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    #[error("counter store error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded")]
    Exceeded(RateLimitHeaders),

    /// Only returned when the limiter is configured to fail closed.
    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Outcome of one atomic check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    pub allowed: bool,
    pub count: u64,
}

/// Backing store for window counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// If the counter at `key` is below `ceiling`, increment it (setting `ttl` on
    /// creation) and report allowed; otherwise leave it untouched and report denied.
    async fn check_and_increment(
        &self,
        key: &str,
        ceiling: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome, StoreError>;
}

/// Redis-backed counters using a Lua script for atomicity.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: redis::Script,
    timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager, timeout: Duration) -> Self {
        Self {
            conn,
            script: redis::Script::new(CHECK_AND_INCREMENT_LUA),
            timeout,
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        ceiling: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(ceiling).arg(ttl.as_secs().max(1));

        let (allowed, count): (i64, i64) =
            tokio::time::timeout(self.timeout, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| StoreError::Timeout(self.timeout))??;

        Ok(CounterOutcome {
            allowed: allowed == 1,
            count: count.max(0) as u64,
        })
    }
}

/// How often the in-memory store drops expired windows for untouched keys.
const MEMORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process-local counters for tests and single-node deployments.
///
/// An expired window is reset when its key is next touched; other expired keys
/// are dropped by a sweep that runs at most once per [`MEMORY_SWEEP_INTERVAL`].
pub struct MemoryCounterStore {
    state: Mutex<MemoryCounters>,
}

struct MemoryCounters {
    entries: HashMap<String, (u64, Instant)>,
    last_sweep: Instant,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryCounters {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        ceiling: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if now.duration_since(state.last_sweep) >= MEMORY_SWEEP_INTERVAL {
            state.entries.retain(|_, (_, expires_at)| *expires_at > now);
            state.last_sweep = now;
        }

        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        if entry.0 >= ceiling {
            return Ok(CounterOutcome {
                allowed: false,
                count: entry.0,
            });
        }
        entry.0 += 1;
        Ok(CounterOutcome {
            allowed: true,
            count: entry.0,
        })
    }
}

/// Ceiling and window for one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierConfig {
    pub name: String,
    pub limit: u64,
    pub window: Duration,
}

impl TierConfig {
    /// Inbound request limits, per minute.
    pub fn for_tier(tier: RateLimitTier) -> Self {
        let limit = match tier {
            RateLimitTier::Anonymous => 100,
            RateLimitTier::Public => 1_000,
            RateLimitTier::Trusted => 5_000,
            RateLimitTier::FirstParty => 10_000,
            RateLimitTier::Admin => 50_000,
        };
        Self {
            name: tier.to_string(),
            limit,
            window: Duration::from_secs(60),
        }
    }

    /// Outbound dispatch limits per recipient address, per hour.
    pub fn for_channel(channel: Channel) -> Self {
        let limit = match channel {
            Channel::Email => 100,
            Channel::Sms => 10,
            Channel::Push => 50,
            Channel::Webhook => 50,
        };
        Self {
            name: format!("channel:{channel}"),
            limit,
            window: Duration::from_secs(3600),
        }
    }
}

/// Caller attributes that decide the request tier.
///
/// Populated from verified JWT claims or from headers set by an upstream gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientRateLimitInfo {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub first_party: bool,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub admin: bool,
}

impl ClientRateLimitInfo {
    pub fn tier(&self) -> RateLimitTier {
        let has_scope = |s: &str| self.scopes.iter().any(|scope| scope == s);
        if self.admin || has_scope("admin") || has_scope("tags:wrangle") {
            RateLimitTier::Admin
        } else if self.first_party {
            RateLimitTier::FirstParty
        } else if self.trusted {
            RateLimitTier::Trusted
        } else if self.client_id().is_some() {
            RateLimitTier::Public
        } else {
            RateLimitTier::Anonymous
        }
    }

    /// Counter identity: IP for anonymous callers, client id for OAuth clients,
    /// user id for admins when known.
    pub fn identity(&self, client_ip: &str) -> String {
        let client = self.client_id().unwrap_or_default();
        match self.tier() {
            RateLimitTier::Anonymous => client_ip.to_string(),
            RateLimitTier::Admin => match self.user_id.as_deref().filter(|u| !u.is_empty()) {
                Some(user_id) => format!("user:{user_id}"),
                None => format!("client:{client}"),
            },
            _ => format!("client:{client}"),
        }
    }

    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref().filter(|c| !c.is_empty())
    }
}

/// Fixed-window limiter over a shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    service: String,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, service: impl Into<String>, fail_open: bool) -> Self {
        Self {
            store,
            service: service.into(),
            fail_open,
        }
    }

    /// Limiter over process-local counters.
    pub fn in_memory(service: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryCounterStore::new()), service, true)
    }

    /// Count one request against `identity` under `tier`.
    pub async fn check_and_consume(
        &self,
        identity: &str,
        tier: &TierConfig,
    ) -> Result<RateLimitHeaders, RateLimitError> {
        self.check_and_consume_at(identity, tier, Utc::now()).await
    }

    pub async fn check_and_consume_at(
        &self,
        identity: &str,
        tier: &TierConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitHeaders, RateLimitError> {
        let window_secs = tier.window.as_secs().max(1) as i64;
        let window_start = now.timestamp() - now.timestamp().rem_euclid(window_secs);
        let reset = window_start + window_secs;
        let key = format!(
            "rate_limit:{}:{}:{}:{}",
            self.service, tier.name, identity, window_start
        );

        match self
            .store
            .check_and_increment(&key, tier.limit, tier.window)
            .await
        {
            Ok(outcome) if outcome.allowed => Ok(RateLimitHeaders {
                limit: tier.limit,
                remaining: tier.limit.saturating_sub(outcome.count),
                reset,
                tier: tier.name.clone(),
            }),
            Ok(_) => {
                tracing::debug!(key = %key, limit = tier.limit, "Rate limit exceeded");
                Err(RateLimitError::Exceeded(RateLimitHeaders {
                    limit: tier.limit,
                    remaining: 0,
                    reset,
                    tier: tier.name.clone(),
                }))
            }
            Err(e) if self.fail_open => {
                tracing::warn!(key = %key, error = %e, "Rate limit store unavailable, failing open");
                Ok(RateLimitHeaders {
                    limit: tier.limit,
                    remaining: tier.limit.saturating_sub(1),
                    reset,
                    tier: tier.name.clone(),
                })
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Rate limit store unavailable");
                Err(RateLimitError::StoreUnavailable(e.to_string()))
            }
        }
    }

    /// Count one inbound request for the caller described by `info`.
    pub async fn check_request(
        &self,
        info: &ClientRateLimitInfo,
        client_ip: &str,
    ) -> Result<RateLimitHeaders, RateLimitError> {
        let tier = TierConfig::for_tier(info.tier());
        self.check_and_consume(&info.identity(client_ip), &tier)
            .await
    }

    /// Count one outbound delivery to `address` over `channel`.
    pub async fn check_channel(
        &self,
        channel: Channel,
        address: &str,
    ) -> Result<RateLimitHeaders, RateLimitError> {
        let tier = TierConfig::for_channel(channel);
        self.check_and_consume(&address.to_lowercase(), &tier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn check_and_increment(
            &self,
            _key: &str,
            _ceiling: u64,
            _ttl: Duration,
        ) -> Result<CounterOutcome, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
    }

    fn tier(limit: u64) -> TierConfig {
        TierConfig {
            name: "test".to_string(),
            limit,
            window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_allows_up_to_ceiling_then_denies() {
        let limiter = RateLimiter::in_memory("courier");
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();

        let first = limiter.check_and_consume_at("1.2.3.4", &tier(2), now).await.unwrap();
        assert_eq!(first.remaining, 1);
        let second = limiter.check_and_consume_at("1.2.3.4", &tier(2), now).await.unwrap();
        assert_eq!(second.remaining, 0);

        match limiter.check_and_consume_at("1.2.3.4", &tier(2), now).await {
            Err(RateLimitError::Exceeded(headers)) => {
                assert_eq!(headers.remaining, 0);
                assert_eq!(headers.limit, 2);
                // window started at 12:00:00, ends a minute later
                assert_eq!(headers.reset, Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap().timestamp());
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_denied_request_does_not_consume() {
        let store = MemoryCounterStore::new();
        let ttl = Duration::from_secs(60);

        for expected in 1..=2 {
            let outcome = store.check_and_increment("k", 2, ttl).await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.count, expected);
        }
        for _ in 0..3 {
            let outcome = store.check_and_increment("k", 2, ttl).await.unwrap();
            assert!(!outcome.allowed);
            assert_eq!(outcome.count, 2);
        }

        // A higher ceiling on the same key sees the count left at 2
        let outcome = store.check_and_increment("k", 3, ttl).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 3);
    }

    #[tokio::test]
    async fn test_denials_leave_remaining_untouched() {
        let limiter = RateLimiter::in_memory("courier");
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 10).unwrap();

        limiter.check_and_consume_at("1.2.3.4", &tier(3), now).await.unwrap();
        for _ in 0..5 {
            assert!(limiter.check_and_consume_at("1.2.3.4", &tier(1), now).await.is_err());
        }
        // Same key space, larger ceiling: only the one allowed request counted
        let headers = limiter.check_and_consume_at("1.2.3.4", &tier(3), now).await.unwrap();
        assert_eq!(headers.remaining, 1);
    }

    #[tokio::test]
    async fn test_memory_store_resets_expired_key() {
        let store = MemoryCounterStore::new();
        let ttl = Duration::from_millis(20);

        store.check_and_increment("k", 1, ttl).await.unwrap();
        assert!(!store.check_and_increment("k", 1, ttl).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let outcome = store.check_and_increment("k", 1, ttl).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_new_window_starts_fresh() {
        let limiter = RateLimiter::in_memory("courier");
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();

        limiter.check_and_consume_at("client:a", &tier(1), now).await.unwrap();
        assert!(limiter.check_and_consume_at("client:a", &tier(1), now).await.is_err());
        assert!(limiter.check_and_consume_at("client:a", &tier(1), later).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_requests_never_exceed_ceiling() {
        let limiter = RateLimiter::in_memory("courier");
        let now = Utc::now();
        let ceiling = 25;

        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_and_consume_at("shared", &tier(ceiling), now).await.is_ok()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, ceiling);
    }

    #[tokio::test]
    async fn test_fail_open_when_store_unavailable() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), "courier", true);
        let headers = limiter.check_and_consume("1.2.3.4", &tier(100)).await.unwrap();
        assert_eq!(headers.remaining, 99);
    }

    #[tokio::test]
    async fn test_fail_closed_when_configured() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), "courier", false);
        assert!(matches!(
            limiter.check_and_consume("1.2.3.4", &tier(100)).await,
            Err(RateLimitError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_tier_resolution() {
        let anonymous = ClientRateLimitInfo::default();
        assert_eq!(anonymous.tier(), RateLimitTier::Anonymous);
        assert_eq!(anonymous.identity("10.0.0.1"), "10.0.0.1");

        let public = ClientRateLimitInfo {
            client_id: Some("app-1".into()),
            ..Default::default()
        };
        assert_eq!(public.tier(), RateLimitTier::Public);
        assert_eq!(public.identity("10.0.0.1"), "client:app-1");

        let trusted = ClientRateLimitInfo {
            trusted: true,
            ..public.clone()
        };
        assert_eq!(trusted.tier(), RateLimitTier::Trusted);

        let first_party = ClientRateLimitInfo {
            first_party: true,
            trusted: true,
            ..public.clone()
        };
        assert_eq!(first_party.tier(), RateLimitTier::FirstParty);

        let wrangler = ClientRateLimitInfo {
            scopes: vec!["read".into(), "tags:wrangle".into()],
            user_id: Some("42".into()),
            first_party: true,
            ..public.clone()
        };
        assert_eq!(wrangler.tier(), RateLimitTier::Admin);
        assert_eq!(wrangler.identity("10.0.0.1"), "user:42");
    }

    #[test]
    fn test_tier_limits() {
        assert_eq!(TierConfig::for_tier(RateLimitTier::Anonymous).limit, 100);
        assert_eq!(TierConfig::for_tier(RateLimitTier::Public).limit, 1_000);
        assert_eq!(TierConfig::for_tier(RateLimitTier::Trusted).limit, 5_000);
        assert_eq!(TierConfig::for_tier(RateLimitTier::FirstParty).limit, 10_000);
        assert_eq!(TierConfig::for_tier(RateLimitTier::Admin).limit, 50_000);
        assert_eq!(TierConfig::for_channel(Channel::Sms).limit, 10);
        assert_eq!(TierConfig::for_channel(Channel::Email).window, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_channel_limits_are_per_address() {
        let limiter = RateLimiter::in_memory("courier");
        for _ in 0..10 {
            limiter.check_channel(Channel::Sms, "+15550100").await.unwrap();
        }
        assert!(limiter.check_channel(Channel::Sms, "+15550100").await.is_err());
        assert!(limiter.check_channel(Channel::Sms, "+15550199").await.is_ok());
    }
}
