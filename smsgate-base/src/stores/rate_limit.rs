//! Redis-backed per-client token bucket.
//!
//! Refill and take happen inside one Lua script so concurrent requests
//! cannot interleave a read-modify-write and overspend the burst.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use smsgate_core::{GatewayError, GatewayResult, RateDecision, RateLimiter};

/// Bucket key TTL; idle clients cost nothing after this.
const KEY_TTL_SECONDS: i64 = 60;

const TOKEN_BUCKET_LUA: &str = r#"
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens'))
local last = tonumber(redis.call('HGET', KEYS[1], 'last_refill'))
local rps = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
if tokens == nil or last == nil then
  tokens = burst
  last = now
end
local elapsed = now - last
if elapsed > 0 then
  tokens = math.min(burst, tokens + elapsed * rps)
  last = now
end
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last)
redis.call('EXPIRE', KEYS[1], ARGV[4])
return allowed
"#;

/// `RateLimiter` over Redis.
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    script: Script,
    rps: u32,
    burst: u32,
}

impl RedisRateLimiter {
    /// Build a limiter with the configured sustained rate and burst size.
    pub fn new(conn: ConnectionManager, rps: u32, burst: u32) -> Self {
        Self {
            conn,
            script: Script::new(TOKEN_BUCKET_LUA),
            rps: rps.max(1),
            burst: burst.max(1),
        }
    }

}

/// Seconds a denied caller should wait for the next token: `ceil(1 / rps)`.
fn retry_after_seconds(rps: u32) -> u64 {
    let rps = u64::from(rps.max(1));
    (1 + rps - 1) / rps
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, client_id: Uuid) -> GatewayResult<RateDecision> {
        let mut conn = self.conn.clone();
        let allowed: i64 = self
            .script
            .key(format!("rate_limit:{client_id}"))
            .arg(self.rps)
            .arg(self.burst)
            .arg(Utc::now().timestamp())
            .arg(KEY_TTL_SECONDS)
            .invoke_async(&mut conn)
            .await
            .map_err(GatewayError::cache)?;

        if allowed == 1 {
            Ok(RateDecision::Allowed)
        } else {
            Ok(RateDecision::Limited {
                retry_after_seconds: retry_after_seconds(self.rps),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_after_is_one_second_at_or_above_one_rps() {
        assert_eq!(retry_after_seconds(1), 1);
        assert_eq!(retry_after_seconds(100), 1);
        assert_eq!(retry_after_seconds(0), 1);
    }
}
