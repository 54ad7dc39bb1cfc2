use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng as _;
use tokio::time::Instant;

/// How an error behaves under retry, as reported by the caller's classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Never retried; propagates immediately.
    Fatal,
    /// Network faults, server errors, integrity failures.
    Transient,
    /// Timeouts get a gentler backoff and escalate after the third attempt.
    Timeout,
    /// HTTP 429, optionally carrying the server's Retry-After hint.
    RateLimited { retry_after: Option<Duration> },
}

/// What the retry loop does next after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    /// Stop retrying: the remote asset is most likely not ready yet, and the
    /// caller should hand the item to the retrieval queue.
    Escalate,
    Fail,
}

/// Timeouts on this 0-indexed attempt or later escalate instead of retrying.
pub const TIMEOUT_ESCALATION_ATTEMPT: u32 = 2;

const MIN_BACKOFF_SECS: f64 = 0.1;
const JITTER_FRACTION: f64 = 0.25;

/// Exponential backoff configuration with jitter to prevent thundering herd
/// when multiple concurrent downloads hit the same transient failure.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_secs: 1.0,
            max_backoff_secs: 60.0,
        }
    }
}

impl RetryConfig {
    /// Unjittered delay for a 0-indexed attempt.
    ///
    /// Formula: `initial * 2^attempt`, or `min(initial, 2) * 1.5^attempt` for
    /// timeouts, clamped to `max_backoff`.
    pub fn base_backoff(&self, attempt: u32, timeout: bool) -> f64 {
        let exp = attempt.min(64) as i32;
        let base = if timeout {
            self.initial_backoff_secs.min(2.0) * 1.5f64.powi(exp)
        } else {
            self.initial_backoff_secs * 2f64.powi(exp)
        };
        base.min(self.max_backoff_secs)
    }

    /// Jittered delay for a 0-indexed attempt: the base backoff moved by up to
    /// 25% either way, never below 100ms.
    pub fn delay_for_retry(&self, attempt: u32, timeout: bool) -> Duration {
        let base = self.base_backoff(attempt, timeout);
        let r: f64 = rand::rng().random_range(0.0..=1.0);
        let jittered = base + base * JITTER_FRACTION * (2.0 * r - 1.0);
        Duration::from_secs_f64(jittered.max(MIN_BACKOFF_SECS))
    }

    /// Total attempts including the first one.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Map a classified failure of a 0-indexed attempt to the next step.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        if class == ErrorClass::Fatal {
            return RetryDecision::Fail;
        }
        if class == ErrorClass::Timeout && attempt >= TIMEOUT_ESCALATION_ATTEMPT {
            return RetryDecision::Escalate;
        }
        if attempt + 1 >= self.total_attempts() {
            return RetryDecision::Fail;
        }
        match class {
            ErrorClass::RateLimited {
                retry_after: Some(hint),
            } => RetryDecision::Retry(hint),
            ErrorClass::Timeout => RetryDecision::Retry(self.delay_for_retry(attempt, true)),
            _ => RetryDecision::Retry(self.delay_for_retry(attempt, false)),
        }
    }
}

/// Result of [`retry_with_backoff`] together with the number of attempts made.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub escalated: bool,
}

/// Retry an async operation with exponential backoff and jitter.
///
/// - `config`: retry configuration
/// - `classifier`: inspects an error and returns its [`ErrorClass`]
/// - `operation`: the async closure to retry
///
/// Attempts never overlap: each one is awaited before the next starts.
/// Returns the first `Ok` result, or the last error once the policy says
/// `Fail` or `Escalate`.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    operation: F,
) -> Attempted<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(val) => {
                return Attempted {
                    result: Ok(val),
                    attempts: attempt + 1,
                    escalated: false,
                }
            }
            Err(e) => e,
        };
        match config.decide(classifier(&err), attempt) {
            RetryDecision::Retry(delay) => {
                tracing::warn!(
                    "Retryable error (attempt {}/{}), retrying in {:.1}s: {}",
                    attempt + 1,
                    config.total_attempts(),
                    delay.as_secs_f64(),
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            RetryDecision::Escalate => {
                tracing::warn!(
                    "Timeout on attempt {}, giving up for retrieval queue: {}",
                    attempt + 1,
                    err
                );
                return Attempted {
                    result: Err(err),
                    attempts: attempt + 1,
                    escalated: true,
                };
            }
            RetryDecision::Fail => {
                return Attempted {
                    result: Err(err),
                    attempts: attempt + 1,
                    escalated: false,
                };
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Errors that can pass through a [`CircuitBreaker`].
pub trait BreakerError {
    /// The error returned when the breaker rejects a call.
    fn circuit_open() -> Self;

    /// Whether this failure counts toward opening the circuit.
    fn trips_breaker(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Failure-rate gate shared by every download of one downloader.
///
/// Opens after `threshold` consecutive failures and rejects calls until
/// `recovery` has elapsed. Then exactly one trial call is let through:
/// success closes the circuit, failure reopens it and restarts the cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    recovery: Duration,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(120))
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            recovery,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // State stays consistent even if a holder panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Ask for permission to make a call. `None` means fail fast.
    fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |t| t.elapsed() >= self.recovery);
                if !cooled {
                    return None;
                }
                tracing::info!("Circuit breaker half-open, allowing one trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                Some(BreakerPermit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(BreakerPermit::new(self, true))
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.trial_in_flight = false;
        let reopen = inner.state == CircuitState::HalfOpen;
        if reopen || inner.failures >= self.threshold {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    "Circuit breaker opened after {} consecutive failures",
                    inner.failures
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn on_abandoned_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    /// Run `operation` through the breaker.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BreakerError,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(E::circuit_open());
        };
        let result = operation().await;
        match &result {
            Ok(_) => permit.success(),
            Err(e) if e.trips_breaker() => permit.failure(),
            Err(_) => drop(permit),
        }
        result
    }
}

/// Outstanding call slot. Dropping it unresolved (cancelled future or
/// non-tripping error) releases a half-open trial without changing state.
struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success();
    }

    fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.on_abandoned_trial();
        }
    }
}
