//! Outbound rate limiting.
//!
//! A fixed-window counter bounds calls to the upstream pricing API, and a
//! keyed variant gives each client of the ZIP validation endpoint its own
//! window. Denials are a typed signal (`try_acquire` returning false), never
//! a blocking wait; callers decide whether to back off or fail fast.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Headroom report for diagnostics and health checks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// Maximum calls admitted per window.
    pub limit: u32,
    /// Calls still available in the current window.
    pub remaining: u32,
    /// When the current window rolls over.
    pub resets_at: DateTime<Utc>,
}

struct WindowState {
    started: Instant,
    used: u32,
    resets_at: DateTime<Utc>,
}

/// Fixed-window limiter for one upstream dependency.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                used: 0,
                resets_at: Utc::now() + window,
            }),
        }
    }

    /// Admits one call if the current window has headroom.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.roll_if_elapsed(&mut state);
        if state.used < self.limit {
            state.used += 1;
            true
        } else {
            tracing::debug!(limit = self.limit, "outbound rate limit window exhausted");
            false
        }
    }

    /// Current headroom without consuming a slot.
    pub fn info(&self) -> RateLimitInfo {
        let mut state = self.state.lock();
        self.roll_if_elapsed(&mut state);
        RateLimitInfo {
            limit: self.limit,
            remaining: self.limit - state.used,
            resets_at: state.resets_at,
        }
    }

    fn roll_if_elapsed(&self, state: &mut WindowState) {
        if state.started.elapsed() >= self.window {
            state.started = Instant::now();
            state.used = 0;
            state.resets_at = Utc::now() + self.window;
        }
    }
}

struct KeyWindow {
    started: Instant,
    used: u32,
}

/// Entry count that triggers an opportunistic sweep of expired windows.
const SWEEP_THRESHOLD: usize = 10_000;

/// Per-key fixed-window limiter. Keys are client identities (IP or session).
pub struct KeyedRateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, KeyWindow>,
}

impl KeyedRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            windows: DashMap::new(),
        }
    }

    /// Admits one call for `key` if its window has headroom.
    pub fn try_acquire(&self, key: &str) -> bool {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep();
        }
        let mut entry = self.windows.entry(key.to_string()).or_insert(KeyWindow {
            started: Instant::now(),
            used: 0,
        });
        if entry.started.elapsed() >= self.window {
            entry.started = Instant::now();
            entry.used = 0;
        }
        if entry.used < self.limit {
            entry.used += 1;
            true
        } else {
            tracing::debug!(key, limit = self.limit, "client rate limit exceeded");
            false
        }
    }

    fn sweep(&self) {
        let window = self.window;
        self.windows.retain(|_, w| w.started.elapsed() < window);
    }
}
