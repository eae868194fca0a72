//! Atomic check-then-increment against a per-consumer, per-billing-cycle key.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use once_cell::sync::Lazy;
use redis::aio::Connection;
use redis::Script;

const MONTHLY_QUOTA_LUA: &str = r#"
local quota_key = KEYS[1]
local monthly_limit = tonumber(ARGV[1])
local request_cu = tonumber(ARGV[2])
local cycle_end_ts = tonumber(ARGV[3])

local current = tonumber(redis.call('GET', quota_key) or '0')

if current + request_cu > monthly_limit then
    local remaining = monthly_limit - current
    if remaining < 0 then remaining = 0 end
    return {0, current, remaining}
end

local new_value = redis.call('INCRBY', quota_key, request_cu)
redis.call('EXPIREAT', quota_key, cycle_end_ts)

local remaining = monthly_limit - new_value
if remaining < 0 then remaining = 0 end
return {1, new_value, remaining}
"#;

const MONTHLY_QUOTA_DECREMENT_LUA: &str = r#"
local quota_key = KEYS[1]
local amount = tonumber(ARGV[1])
local cycle_end_ts = tonumber(ARGV[2])

local new_value = redis.call('DECRBY', quota_key, amount)
if new_value < 0 then
    new_value = redis.call('SET', quota_key, 0) and 0
end
redis.call('EXPIREAT', quota_key, cycle_end_ts)
return new_value
"#;

static MONTHLY_QUOTA_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(MONTHLY_QUOTA_LUA));
static MONTHLY_QUOTA_DECREMENT_SCRIPT: Lazy<Script> =
    Lazy::new(|| Script::new(MONTHLY_QUOTA_DECREMENT_LUA));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlyQuotaOutcome {
    pub allowed: bool,
    pub used: i64,
    pub remaining: i64,
}

/// `YYYYMM` in UTC. Never persisted on its own -- it is derived fresh every
/// call and only ever shows up embedded in a Redis key.
pub fn billing_cycle_id(now: DateTime<Utc>) -> String {
    format!("{:04}{:02}", now.year(), now.month())
}

pub fn quota_key(consumer: &str, cycle_id: &str) -> String {
    format!("quota:monthly:{consumer}:{cycle_id}")
}

/// Unix timestamp of the first instant of the next UTC month, i.e. the
/// moment this cycle's key should expire.
pub fn cycle_end_timestamp(now: DateTime<Utc>) -> i64 {
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .expect("valid first-of-month timestamp")
        .timestamp()
}

pub struct MonthlyQuotaScript;

impl Default for MonthlyQuotaScript {
    fn default() -> Self {
        Self
    }
}

impl MonthlyQuotaScript {
    pub fn new() -> Self {
        Self
    }

    pub async fn check_and_increment(
        &self,
        conn: &mut Connection,
        consumer: &str,
        monthly_limit: i64,
        request_cu: i64,
        now: DateTime<Utc>,
    ) -> redis::RedisResult<MonthlyQuotaOutcome> {
        if monthly_limit <= 0 {
            return Ok(MonthlyQuotaOutcome {
                allowed: true,
                used: 0,
                remaining: 0,
            });
        }

        let cycle_id = billing_cycle_id(now);
        let key = quota_key(consumer, &cycle_id);
        let cycle_end = cycle_end_timestamp(now);

        let (allowed, used, remaining): (i64, i64, i64) = MONTHLY_QUOTA_SCRIPT
            .key(key)
            .arg(monthly_limit)
            .arg(request_cu)
            .arg(cycle_end)
            .invoke_async(conn)
            .await?;

        Ok(MonthlyQuotaOutcome {
            allowed: allowed == 1,
            used,
            remaining,
        })
    }

    /// Future hook for refunding CU on a downstream rollback. Not invoked by
    /// the primary pipeline -- spec.md 4.7/9 documents this as a deliberate
    /// asymmetry, not an oversight.
    #[allow(dead_code)]
    pub async fn decrement(
        &self,
        conn: &mut Connection,
        consumer: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> redis::RedisResult<i64> {
        let cycle_id = billing_cycle_id(now);
        let key = quota_key(consumer, &cycle_id);
        let cycle_end = cycle_end_timestamp(now);

        MONTHLY_QUOTA_DECREMENT_SCRIPT
            .key(key)
            .arg(amount)
            .arg(cycle_end)
            .invoke_async(conn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cycle_id_formats_as_yyyymm() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap();
        assert_eq!(billing_cycle_id(now), "202607");
    }

    #[test]
    fn cycle_rolls_over_at_year_boundary() {
        let now = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(billing_cycle_id(now), "202612");
        let end = cycle_end_timestamp(now);
        let expected = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap().timestamp();
        assert_eq!(end, expected);
    }

    #[test]
    fn quota_key_is_namespaced_by_consumer_and_cycle() {
        assert_eq!(
            quota_key("alice", "202607"),
            "quota:monthly:alice:202607"
        );
    }
}
