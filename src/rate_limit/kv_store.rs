use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RateLimitDecision, SlidingWindow, WindowStore};

/// Weighted two-window check. Returns remaining requests after counting
/// this one, or -1 when the window is full (nothing recorded).
const SLIDING_WINDOW_SCRIPT: &str = r#"
local current_key = KEYS[1]
local previous_key = KEYS[2]
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])

local current = tonumber(redis.call("GET", current_key) or "0")
local previous = tonumber(redis.call("GET", previous_key) or "0")
local elapsed = (now % window) / window
previous = math.floor((1 - elapsed) * previous)

if previous + current >= limit then
  return -1
end

local value = redis.call("INCR", current_key)
if value == 1 then
  redis.call("PEXPIRE", current_key, window * 2 + 1000)
end
return limit - (value + previous)
"#;

/// Window counters in a Redis-protocol store.
///
/// The connection is opened lazily and dropped after a failed command so
/// the next request reconnects; failures are not retried.
#[derive(Clone)]
pub struct RedisWindowStore {
    client: redis::Client,
    connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore").finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid rate limit store url")?;
        Ok(Self {
            client,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<redis::aio::MultiplexedConnection>,
    ) -> Result<()> {
        if connection.is_some() {
            return Ok(());
        }
        *connection = Some(
            self.client
                .get_multiplexed_async_connection()
                .await
                .context("failed to open rate limit store connection")?,
        );
        tracing::debug!(name: "rate_limit.store.connected", "Rate limit store connected");
        Ok(())
    }
}

/// Keys for the current and previous fixed windows.
pub(super) fn window_keys(key: &str, policy: &SlidingWindow, now_ms: u64) -> (String, String) {
    let window = policy.window_index(now_ms);
    (
        format!("{key}:{window}"),
        format!("{key}:{}", window.saturating_sub(1)),
    )
}

/// Interpret the script's return value.
pub(super) fn decision_from_script(
    remaining: i64,
    policy: &SlidingWindow,
    now_ms: u64,
) -> RateLimitDecision {
    RateLimitDecision {
        allowed: remaining >= 0,
        limit: policy.limit,
        remaining: u64::try_from(remaining).unwrap_or(0),
        reset: policy.reset_at(now_ms),
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(
        &self,
        key: &str,
        policy: &SlidingWindow,
        now_ms: u64,
    ) -> Result<RateLimitDecision> {
        let (current_key, previous_key) = window_keys(key, policy, now_ms);

        let mut cmd = redis::cmd("EVAL");
        cmd.arg(SLIDING_WINDOW_SCRIPT)
            .arg(2)
            .arg(current_key.as_str())
            .arg(previous_key.as_str())
            .arg(policy.limit)
            .arg(now_ms)
            .arg(policy.window_ms());

        let mut conn_guard = self.connection.lock().await;
        self.ensure_connection(&mut conn_guard).await?;
        let conn = conn_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("rate limit store connection unavailable"))?;

        let result: redis::RedisResult<i64> = cmd.query_async(conn).await;
        match result {
            Ok(remaining) => Ok(decision_from_script(remaining, policy, now_ms)),
            Err(err) => {
                tracing::warn!(
                    name: "rate_limit.store.command_failed",
                    error = %err,
                    "Rate limit store command failed"
                );
                *conn_guard = None;
                Err(anyhow::anyhow!(err).context("rate limit store command failed"))
            }
        }
    }
}
