use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::metrics::MetricsRecorder;

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Stop signal for fetch work: an own flag, the flags of the tokens it was
/// derived from, and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parents: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            ..Self::default()
        }
    }

    /// Derived token: cancelled with this one, but cancelling it (or its
    /// deadline passing) leaves this one untouched.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.and_then(|t| Instant::now().checked_add(t))) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let mut parents = self.parents.clone();
        parents.push(Arc::clone(&self.flag));
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parents,
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parents.iter().any(|p| p.load(Ordering::SeqCst))
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleeps up to `dur`, returning false if cancelled first.
    pub fn sleep(&self, dur: Duration) -> bool {
        let until = Instant::now() + dur;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep((until - now).min(SLEEP_SLICE));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts (first try included) for throttled requests.
    pub rate_limit_attempts: u32,
    /// Total attempts for connectivity failures.
    pub network_attempts: u32,
    pub default_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_attempts: 3,
            network_attempts: 2,
            default_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts; for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            default_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    fn budget_for(&self, err: &ApiError) -> Option<u32> {
        match err {
            ApiError::RateLimited { .. } => Some(self.rate_limit_attempts.max(1)),
            ApiError::Network(_) => Some(self.network_attempts.max(1)),
            _ => None,
        }
    }

    fn delay_for(&self, err: &ApiError) -> Duration {
        let base = match err {
            ApiError::RateLimited { retry_after } => retry_after.unwrap_or(self.default_delay),
            _ => self.default_delay / 2,
        };
        let base = base.min(self.max_delay);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = (base.as_millis() as u64 / 10).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// budget for its error class is spent.
    pub fn run<T>(
        &self,
        cancel: &CancelToken,
        recorder: Option<&MetricsRecorder>,
        mut op: impl FnMut() -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }
            attempt += 1;
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(budget) = self.budget_for(&err) else {
                return Err(err);
            };
            if attempt >= budget {
                warn!(attempt, %err, "retry budget exhausted");
                return Err(err);
            }
            let delay = self.delay_for(&err);
            debug!(attempt, ?delay, %err, "backing off before retry");
            if let Some(recorder) = recorder {
                recorder.record_retry();
            }
            if !cancel.sleep(delay) {
                return Err(ApiError::Cancelled);
            }
        }
    }
}
