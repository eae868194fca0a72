//! Redis-backed circuit breaker, sliding-window CU limiter, and monthly
//! quota enforcer. Everything that touches Redis for the gateway core lives
//! here so the breaker can wrap every call the same way.

pub mod circuit_breaker;
pub mod errors;
pub mod monthly_quota;
pub mod sliding_window;

pub use bb8;
pub use bb8_redis;
pub use redis;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOutcome, CircuitState};
pub use errors::RedisErrorSink;
pub use monthly_quota::{MonthlyQuotaOutcome, MonthlyQuotaScript};
pub use sliding_window::{SlidingWindowOutcome, SlidingWindowRateLimiter};

use bb8_redis::RedisConnectionManager;
use std::time::Duration;

pub type RedisPool = bb8::Pool<RedisConnectionManager>;
pub type RedisPoolError = bb8::RunError<redis::RedisError>;

/// Bundles the pool with the breaker and the two script runners so callers
/// don't have to wire the three together at every call site.
pub struct RedisRateLimiter {
    pub pool: RedisPool,
    pub breaker: CircuitBreaker,
    pub sliding_window: SlidingWindowRateLimiter,
    pub monthly_quota: MonthlyQuotaScript,
    /// `host:port`, used as the circuit breaker's per-endpoint key.
    pub endpoint: String,
}

impl RedisRateLimiter {
    pub async fn new(redis_url: &str, max_size: u32) -> anyhow::Result<Self> {
        let manager = RedisConnectionManager::new(redis_url)?;

        let pool = bb8::Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .idle_timeout(Some(Duration::from_secs(10)))
            .connection_timeout(Duration::from_millis(1000))
            .error_sink(Box::new(RedisErrorSink))
            .build(manager)
            .await?;

        Ok(Self {
            pool,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            sliding_window: SlidingWindowRateLimiter::new(),
            monthly_quota: MonthlyQuotaScript::new(),
            endpoint: endpoint_of(redis_url),
        })
    }
}

/// Best-effort `host:port` extraction for breaker bookkeeping; falls back to
/// the raw URL if it doesn't parse cleanly (still a valid, if ugly, key).
fn endpoint_of(redis_url: &str) -> String {
    url::Url::parse(redis_url)
        .ok()
        .and_then(|u| {
            let host = u.host_str()?.to_string();
            let port = u.port_or_known_default().unwrap_or(6379);
            Some(format!("{host}:{port}"))
        })
        .unwrap_or_else(|| redis_url.to_string())
}
