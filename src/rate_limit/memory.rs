use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{RateLimitDecision, SlidingWindow, WindowStore};

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    window: u64,
    current: u64,
    previous: u64,
}

#[derive(Debug, Default)]
struct Counters {
    by_key: HashMap<String, Counter>,
    /// Last window in which stale keys were swept.
    swept_window: u64,
}

impl Counters {
    /// Drop keys whose counts no longer reach into `window`.
    fn sweep(&mut self, window: u64) {
        if window <= self.swept_window {
            return;
        }
        self.by_key.retain(|_, c| c.window + 1 >= window);
        self.swept_window = window;
    }
}

/// In-process window counters.
///
/// Only meaningful for a single server process; counters are lost on restart.
/// Keys idle for two windows are swept on the first hit of a new window.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    counters: Mutex<Counters>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(
        &self,
        key: &str,
        policy: &SlidingWindow,
        now_ms: u64,
    ) -> anyhow::Result<RateLimitDecision> {
        let window = policy.window_index(now_ms);
        let reset = policy.reset_at(now_ms);

        let mut guard = self
            .counters
            .lock()
            .map_err(|_| anyhow::anyhow!("rate limit counters poisoned"))?;
        guard.sweep(window);
        let counter = guard.by_key.entry(key.to_string()).or_default();

        // Roll the pair forward to the current window.
        if counter.window != window {
            counter.previous = if counter.window + 1 == window {
                counter.current
            } else {
                0
            };
            counter.current = 0;
            counter.window = window;
        }

        let previous = policy.weighted_previous(counter.previous, now_ms);
        if previous + counter.current >= policy.limit {
            return Ok(RateLimitDecision {
                allowed: false,
                limit: policy.limit,
                remaining: 0,
                reset,
            });
        }

        counter.current += 1;
        Ok(RateLimitDecision {
            allowed: true,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(counter.current + previous),
            reset,
        })
    }
}
