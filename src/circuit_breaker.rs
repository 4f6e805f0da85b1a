//! Circuit breaker guarding the upstream pricing API.
//!
//! Closed until `failure_threshold` consecutive failures, then open: calls
//! fail fast with no upstream I/O. After `cooldown` the breaker admits
//! exactly one probe (half-open); the probe's outcome closes or reopens it.
//! Transitions are counted so behavior is observable in tests and in the
//! diagnostics endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Breaker state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared per-dependency breaker. All methods are lock-free and safe to call
/// from any number of tasks; only this type mutates its state.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Millis since epoch when the breaker last opened.
    opened_at_ms: AtomicU64,
    /// Millis since epoch when the current probe was admitted; 0 = no probe.
    probe_started_at_ms: AtomicU64,
    times_opened: AtomicU64,
    times_half_opened: AtomicU64,
    times_reclosed: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_started_at_ms: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
            times_half_opened: AtomicU64::new(0),
            times_reclosed: AtomicU64::new(0),
        }
    }

    /// Whether a call may go upstream right now.
    ///
    /// In the open state this is where the cooldown check happens; the caller
    /// that wins the open→half-open race is the single admitted probe. In
    /// half-open, the probe slot is reclaimable after another cooldown in
    /// case the original probe never reported back.
    pub fn can_proceed(&self) -> bool {
        match self.current_state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if now_ms().saturating_sub(opened) < self.cooldown.as_millis() as u64 {
                    return false;
                }
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.times_half_opened.fetch_add(1, Ordering::Relaxed);
                    self.probe_started_at_ms.store(now_ms(), Ordering::Release);
                    tracing::info!("circuit breaker half-open, admitting probe");
                    true
                } else {
                    // Another caller won the race and owns the probe.
                    false
                }
            }
            CircuitState::HalfOpen => {
                let started = self.probe_started_at_ms.load(Ordering::Acquire);
                if started == 0 {
                    return self
                        .probe_started_at_ms
                        .compare_exchange(0, now_ms(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                }
                // Probe abandoned without an outcome; let one caller retake it.
                if now_ms().saturating_sub(started) >= self.cooldown.as_millis() as u64 {
                    return self
                        .probe_started_at_ms
                        .compare_exchange(started, now_ms(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                }
                false
            }
        }
    }

    /// Records a successful upstream call.
    pub fn record_success(&self) {
        match self.current_state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                self.transition_closed();
            }
            CircuitState::Open => {
                // Stale completion from before the breaker opened.
                tracing::debug!("success recorded while open, ignored");
            }
        }
    }

    /// Records a failed upstream call.
    pub fn record_failure(&self) {
        match self.current_state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    self.transition_open(failures);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("probe failed, reopening circuit");
                self.transition_open(self.consecutive_failures.load(Ordering::Relaxed));
            }
            CircuitState::Open => {
                tracing::debug!("failure recorded while open, ignored");
            }
        }
    }

    pub fn current_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Time remaining before the next probe is admitted. None unless open.
    pub fn time_until_probe(&self) -> Option<Duration> {
        if self.current_state() != CircuitState::Open {
            return None;
        }
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        let elapsed = now_ms().saturating_sub(opened);
        let cooldown = self.cooldown.as_millis() as u64;
        Some(Duration::from_millis(cooldown.saturating_sub(elapsed)))
    }

    /// Point-in-time view for the diagnostics endpoint and tests.
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.current_state(),
            consecutive_failures: self.consecutive_failures(),
            failure_threshold: self.failure_threshold,
            cooldown_seconds: self.cooldown.as_secs(),
            seconds_until_probe: self.time_until_probe().map(|d| d.as_secs()),
            times_opened: self.times_opened.load(Ordering::Relaxed),
            times_half_opened: self.times_half_opened.load(Ordering::Relaxed),
            times_reclosed: self.times_reclosed.load(Ordering::Relaxed),
        }
    }

    fn transition_open(&self, failures: u32) {
        if self.state.swap(OPEN, Ordering::AcqRel) != OPEN {
            self.opened_at_ms.store(now_ms(), Ordering::Release);
            self.probe_started_at_ms.store(0, Ordering::Release);
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                consecutive_failures = failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    fn transition_closed(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.probe_started_at_ms.store(0, Ordering::Release);
            self.times_reclosed.fetch_add(1, Ordering::Relaxed);
            tracing::info!("circuit breaker closed");
        }
    }
}

/// Serializable breaker view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_until_probe: Option<u64>,
    pub times_opened: u64,
    pub times_half_opened: u64,
    pub times_reclosed: u64,
}
