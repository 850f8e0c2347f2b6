//! Per-client daily rate limiting.
//!
//! Clients are identified by the `X-Forwarded-For` header and counted in a
//! sliding window (two fixed windows, the previous one weighted by how much
//! of it still overlaps the rolling window). Counters live in a
//! [`WindowStore`]; production uses Redis, tests and single-process setups
//! can use the in-memory store.

mod kv_store;
mod memory;

pub use kv_store::RedisWindowStore;
pub use memory::MemoryWindowStore;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::config::{AppConfig, AppEnvironment};
use crate::error::ChatError;

/// Body of the `429` response.
pub const LIMIT_REACHED_MESSAGE: &str = "You have reached your request limit for the day.";

/// Key suffix used when the client address is unknown.
const UNKNOWN_CLIENT: &str = "unknown";

/// Sliding window policy: at most `limit` requests per rolling `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    pub limit: u64,
    pub window: Duration,
}

impl SlidingWindow {
    #[must_use]
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Window length in milliseconds, never zero.
    #[must_use]
    pub fn window_ms(&self) -> u64 {
        (self.window.as_millis() as u64).max(1)
    }

    /// Index of the fixed window containing `now_ms`.
    #[must_use]
    pub fn window_index(&self, now_ms: u64) -> u64 {
        now_ms / self.window_ms()
    }

    /// Timestamp (ms) at which the window containing `now_ms` ends.
    #[must_use]
    pub fn reset_at(&self, now_ms: u64) -> u64 {
        (self.window_index(now_ms) + 1) * self.window_ms()
    }

    /// Portion of the previous window's count still inside the rolling window.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn weighted_previous(&self, previous: u64, now_ms: u64) -> u64 {
        let window = self.window_ms();
        let elapsed = (now_ms % window) as f64 / window as f64;
        ((1.0 - elapsed) * previous as f64).floor() as u64
    }
}

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp (ms) at which the current window ends.
    pub reset: u64,
}

impl RateLimitDecision {
    /// The `429` response for a denied request.
    #[must_use]
    pub fn rejection(&self) -> Response {
        let mut response =
            (StatusCode::TOO_MANY_REQUESTS, LIMIT_REACHED_MESSAGE).into_response();
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset));
        response
    }
}

/// Backing store for window counters.
///
/// Implementations must evaluate and record a hit atomically.
#[async_trait]
pub trait WindowStore: Send + Sync + std::fmt::Debug {
    /// Count one request for `key` at `now_ms` unless the window is full.
    async fn hit(
        &self,
        key: &str,
        policy: &SlidingWindow,
        now_ms: u64,
    ) -> anyhow::Result<RateLimitDecision>;
}

/// Rate limiting strategy, chosen once at start-up.
#[derive(Debug, Clone)]
pub enum RateLimiter {
    /// Every request passes (development, or no store configured).
    Disabled,
    /// Requests are counted per client.
    Enforced {
        store: Arc<dyn WindowStore>,
        policy: SlidingWindow,
        prefix: String,
    },
}

impl RateLimiter {
    /// Build the strategy from configuration.
    ///
    /// Limiting is off in development, when explicitly disabled, or when no
    /// store URL is configured. `memory://` selects the in-process store.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let rl = &config.rate_limit;

        let reason = if !rl.enabled {
            Some("disabled")
        } else if config.environment == AppEnvironment::Development {
            Some("development")
        } else if rl.store_url.is_none() {
            Some("missing_store_url")
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::info!(name: "rate_limit.disabled", reason, "Rate limiting disabled");
            return Ok(Self::Disabled);
        }

        let url = rl.store_url.as_deref().unwrap_or_default();
        let store: Arc<dyn WindowStore> = if url.starts_with("memory://") {
            Arc::new(MemoryWindowStore::new())
        } else {
            Arc::new(RedisWindowStore::new(url)?)
        };

        let policy = SlidingWindow::new(rl.limit, Duration::from_secs(rl.window_secs));
        tracing::info!(
            name: "rate_limit.enabled",
            limit = policy.limit,
            window_secs = rl.window_secs,
            prefix = %rl.prefix,
            "Rate limiting enabled"
        );

        Ok(Self::Enforced {
            store,
            policy,
            prefix: rl.prefix.clone(),
        })
    }

    /// Store key for a client.
    #[must_use]
    pub fn key_for(prefix: &str, client: Option<&str>) -> String {
        format!("{prefix}_{}", client.unwrap_or(UNKNOWN_CLIENT))
    }

    /// Check (and count) a request from `client`. `None` means bypassed.
    pub async fn check(&self, client: Option<&str>) -> Result<Option<RateLimitDecision>, ChatError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.check_at(client, now_ms).await
    }

    /// Like [`Self::check`] with an explicit clock.
    pub async fn check_at(
        &self,
        client: Option<&str>,
        now_ms: u64,
    ) -> Result<Option<RateLimitDecision>, ChatError> {
        match self {
            Self::Disabled => Ok(None),
            Self::Enforced {
                store,
                policy,
                prefix,
            } => {
                let key = Self::key_for(prefix, client);
                let decision = store
                    .hit(&key, policy, now_ms)
                    .await
                    .map_err(ChatError::RateLimitStore)?;
                tracing::debug!(
                    name: "rate_limit.checked",
                    key = %key,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "Rate limit checked"
                );
                Ok(Some(decision))
            }
        }
    }
}

/// Client address from `X-Forwarded-For` (first hop).
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Middleware gating a route on the per-client limit.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ChatError> {
    let client = client_ip(req.headers());
    if let Some(decision) = state.rate_limiter.check(client.as_deref()).await? {
        if !decision.allowed {
            tracing::info!(
                name: "rate_limit.rejected",
                client = client.as_deref().unwrap_or(UNKNOWN_CLIENT),
                reset = decision.reset,
                "Request limit reached"
            );
            return Ok(decision.rejection());
        }
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn enforced() -> RateLimiter {
        RateLimiter::Enforced {
            store: Arc::new(MemoryWindowStore::new()),
            policy: SlidingWindow::new(50, DAY),
            prefix: "chathn_ratelimit".to_string(),
        }
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            RateLimiter::key_for("chathn_ratelimit", Some("203.0.113.7")),
            "chathn_ratelimit_203.0.113.7"
        );
        assert_eq!(
            RateLimiter::key_for("chathn_ratelimit", None),
            "chathn_ratelimit_unknown"
        );
    }

    #[test]
    fn test_client_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), None);

        headers.insert("x-forwarded-for", HeaderValue::from_static(" 10.0.0.1 , 172.16.0.1"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.1"));

        headers.insert("x-forwarded-for", HeaderValue::from_static("  "));
        assert_eq!(client_ip(&headers), None);
    }

    #[test]
    fn test_weighted_previous() {
        let policy = SlidingWindow::new(50, Duration::from_millis(1000));
        assert_eq!(policy.weighted_previous(50, 2000), 50);
        assert_eq!(policy.weighted_previous(50, 2500), 25);
        assert_eq!(policy.weighted_previous(50, 2999), 0);
        assert_eq!(policy.reset_at(2500), 3000);
    }

    #[tokio::test]
    async fn test_disabled_bypasses() {
        let limiter = RateLimiter::Disabled;
        for _ in 0..100 {
            assert!(limiter.check(Some("1.2.3.4")).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_fifty_first_request_is_denied() {
        let limiter = enforced();
        let now = 1_700_000_000_000;

        for i in 1..=50 {
            let d = limiter.check_at(Some("1.2.3.4"), now + i).await.unwrap().unwrap();
            assert!(d.allowed, "request {i} should pass");
            assert_eq!(d.remaining, 50 - i);
        }

        let denied = limiter.check_at(Some("1.2.3.4"), now + 51).await.unwrap().unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 50);

        // Other clients are counted separately.
        let other = limiter.check_at(Some("5.6.7.8"), now + 52).await.unwrap().unwrap();
        assert!(other.allowed);
        assert_eq!(other.remaining, 49);
    }

    #[test]
    fn test_rejection_response() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 50,
            remaining: 0,
            reset: 1_700_006_400_000,
        };
        let response = decision.rejection();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-limit"], "50");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["x-ratelimit-reset"], "1700006400000");
    }
}
