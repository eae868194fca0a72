//! Sliding-window-over-CU rate limiter, evaluated atomically in Redis.
//!
//! One ZSET (timestamp score, request-id member) plus one HASH (request-id
//! -> CU) per consumer. `redis::Script` caches the script's SHA and retries
//! with a plain `EVAL` on `NOSCRIPT`, so there is no separate SHA table here.

use once_cell::sync::Lazy;
use rand::Rng;
use redis::aio::Connection;
use redis::{AsyncCommands, Script};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

const SLIDING_WINDOW_LUA: &str = r#"
local zset_key = KEYS[1]
local hash_key = KEYS[2]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local request_cu = tonumber(ARGV[4])
local request_id = ARGV[5]

local cutoff = now_ms - window_ms

local expired = redis.call('ZRANGEBYSCORE', zset_key, '-inf', cutoff)
for _, member in ipairs(expired) do
    redis.call('HDEL', hash_key, member)
end
redis.call('ZREMRANGEBYSCORE', zset_key, '-inf', cutoff)

local members = redis.call('ZRANGE', zset_key, 0, -1)
local current_cu = 0
if #members > 0 then
    local values = redis.call('HMGET', hash_key, unpack(members))
    for _, v in ipairs(values) do
        if v then
            current_cu = current_cu + tonumber(v)
        end
    end
end

if current_cu + request_cu > limit then
    local remaining = limit - current_cu
    if remaining < 0 then remaining = 0 end
    return {0, current_cu, remaining}
end

redis.call('ZADD', zset_key, now_ms, request_id)
redis.call('HSET', hash_key, request_id, request_cu)
local ttl = math.floor(window_ms / 1000) + 10
redis.call('EXPIRE', zset_key, ttl)
redis.call('EXPIRE', hash_key, ttl)

local new_cu = current_cu + request_cu
local remaining = limit - new_cu
if remaining < 0 then remaining = 0 end
return {1, new_cu, remaining}
"#;

static SLIDING_WINDOW_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(SLIDING_WINDOW_LUA));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowOutcome {
    pub allowed: bool,
    pub cu_in_window: i64,
    pub remaining: i64,
}

pub struct SlidingWindowRateLimiter {
    pub window_ms: i64,
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self { window_ms: 1000 }
    }
}

impl SlidingWindowRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// High-resolution timestamp + random suffix: unique enough across
    /// concurrent submissions from the same consumer that two distinct
    /// requests never collide as the same ZSET/HASH member. A WebSocket
    /// message passes its connection's nonce so every message on that
    /// connection derives its id from the same seed; an HTTP request has
    /// no connection to seed from and gets a fresh ULID instead.
    pub fn request_id(connection_nonce: Option<&str>) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seed = connection_nonce.map(str::to_string).unwrap_or_else(|| Ulid::new().to_string());
        format!("{seed}-{}-{:08x}", now.as_nanos(), rand::thread_rng().gen::<u32>())
    }

    pub async fn check_and_increment(
        &self,
        conn: &mut Connection,
        consumer: &str,
        limit: i64,
        request_cu: i64,
        request_id: &str,
    ) -> redis::RedisResult<SlidingWindowOutcome> {
        if limit <= 0 {
            return Ok(SlidingWindowOutcome {
                allowed: true,
                cu_in_window: 0,
                remaining: 0,
            });
        }

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let zset_key = format!("ratelimit:cu:sliding:{consumer}");
        let hash_key = format!("ratelimit:cu:sliding:{consumer}:values");

        let (allowed, cu, remaining): (i64, i64, i64) = SLIDING_WINDOW_SCRIPT
            .key(zset_key)
            .key(hash_key)
            .arg(now_ms)
            .arg(self.window_ms)
            .arg(limit)
            .arg(request_cu)
            .arg(request_id)
            .invoke_async(conn)
            .await?;

        Ok(SlidingWindowOutcome {
            allowed: allowed == 1,
            cu_in_window: cu,
            remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = SlidingWindowRateLimiter::request_id(None);
        let b = SlidingWindowRateLimiter::request_id(None);
        assert_ne!(a, b);
    }

    #[test]
    fn request_ids_share_a_connection_nonce_prefix() {
        let a = SlidingWindowRateLimiter::request_id(Some("conn-nonce"));
        let b = SlidingWindowRateLimiter::request_id(Some("conn-nonce"));
        assert_ne!(a, b);
        assert!(a.starts_with("conn-nonce-"));
        assert!(b.starts_with("conn-nonce-"));
    }
}
