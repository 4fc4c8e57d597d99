//! Per-source circuit breaker.
//!
//! # States
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls are rejected locally until the cooldown elapses
//! - HalfOpen: up to `half_open_max_calls` trial calls are admitted
//!
//! # Transitions
//! ```text
//! Closed   -> Open:     consecutive failures reach the threshold
//! Open     -> HalfOpen: now >= opened_at + cooldown
//! HalfOpen -> Closed:   half_open_max_calls consecutive trial successes
//! HalfOpen -> Open:     any trial failure
//! any      -> Closed:   administrative reset
//! ```
//!
//! All mutation for one source happens under one mutex, so automatic
//! transitions and administrative resets never interleave.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::sanitizer::{ClassifiedFailure, ErrorClass};
use crate::{SourceId, UtcDateTime};

/// Runtime circuit state for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Lower threshold applied to Credential-class failures, if set.
    pub credential_failure_threshold: Option<u32>,
    pub cooldown: Duration,
    pub half_open_max_calls: u32,
    pub history_limit: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::public_source()
    }
}

impl CircuitBreakerConfig {
    /// Policy for sources that answer without credentials.
    pub const fn public_source() -> Self {
        Self {
            failure_threshold: 5,
            credential_failure_threshold: None,
            cooldown: Duration::from_secs(15 * 60),
            half_open_max_calls: 2,
            history_limit: 20,
        }
    }

    /// Policy for credential-gated sources: trips sooner, stays open longer.
    pub const fn credential_source() -> Self {
        Self {
            failure_threshold: 3,
            credential_failure_threshold: None,
            cooldown: Duration::from_secs(30 * 60),
            half_open_max_calls: 2,
            history_limit: 20,
        }
    }

    fn threshold_for(&self, class: ErrorClass) -> u32 {
        match (class, self.credential_failure_threshold) {
            (ErrorClass::Credential, Some(fast)) => fast.min(self.failure_threshold),
            _ => self.failure_threshold,
        }
        .max(1)
    }
}

/// One entry of the bounded transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub timestamp: UtcDateTime,
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    pub failure_count: u32,
    /// Sanitized reason for the transition, when it was caused by a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejection {
    pub state: CircuitState,
    /// Time until the next trial is admitted, when known.
    pub retry_after: Option<Duration>,
}

/// Read-only status snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStatus {
    pub source: SourceId,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub last_failure_time: Option<UtcDateTime>,
    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    pub cooldown_period_minutes: f64,
    pub half_open_trials: u32,
    pub half_open_max_calls: u32,
    pub is_available: bool,
    pub retry_after_secs: Option<u64>,
    pub state_changes: Vec<StateTransition>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<UtcDateTime>,
    half_open_trials: u32,
    half_open_successes: u32,
    total_calls: u64,
    total_failures: u64,
    last_failure_at: Option<UtcDateTime>,
    last_error: Option<ClassifiedFailure>,
    history: VecDeque<StateTransition>,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_trials: 0,
            half_open_successes: 0,
            total_calls: 0,
            total_failures: 0,
            last_failure_at: None,
            last_error: None,
            history: VecDeque::new(),
        }
    }
}

impl CircuitInner {
    /// Moment the open circuit becomes eligible for trial calls.
    fn retry_at(&self, cooldown: Duration) -> Option<UtcDateTime> {
        self.opened_at.map(|opened_at| opened_at.saturating_add(cooldown))
    }

    /// State as observed at `now`, without materializing any transition.
    fn effective_state(&self, now: UtcDateTime, cooldown: Duration) -> CircuitState {
        match (self.state, self.retry_at(cooldown)) {
            (CircuitState::Open, Some(retry_at)) if now >= retry_at => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }

    fn push_history(&mut self, entry: StateTransition, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }
}

/// Thread-safe circuit breaker guarding one source.
#[derive(Debug)]
pub struct CircuitBreaker {
    source: SourceId,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(source: SourceId, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            config,
            clock,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns true when a call may proceed: Closed, or HalfOpen with trial budget left.
    ///
    /// Materializes the Open -> HalfOpen transition once the cooldown has elapsed,
    /// but does not consume a trial slot.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.half_open_trials < self.config.half_open_max_calls,
            CircuitState::Open => false,
        }
    }

    /// Admits one call, consuming a trial slot when HalfOpen.
    pub fn try_acquire(&self) -> Result<(), CircuitRejection> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if inner.half_open_trials < self.config.half_open_max_calls => {
                inner.half_open_trials += 1;
                tracing::debug!(
                    source = %self.source,
                    trial = inner.half_open_trials,
                    max = self.config.half_open_max_calls,
                    "admitting half-open trial"
                );
                Ok(())
            }
            state => Err(CircuitRejection {
                state,
                retry_after: inner
                    .retry_at(self.config.cooldown)
                    .map(|retry_at| retry_at.duration_since(self.clock.now())),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.total_calls = inner.total_calls.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls {
                    inner.consecutive_failures = 0;
                    self.transition(&mut inner, CircuitState::Closed, None);
                }
            }
            // A call admitted before the circuit opened finished late; the cooldown stands.
            CircuitState::Open => {}
        }
    }

    /// Records a classified failure. The message inside `failure` is already sanitized.
    pub fn record_failure(&self, failure: &ClassifiedFailure) {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let now = self.clock.now();

        inner.total_calls = inner.total_calls.saturating_add(1);
        inner.total_failures = inner.total_failures.saturating_add(1);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(now);
        inner.last_error = Some(failure.clone());

        let reason = Some(format!("{}: {}", failure.class(), failure.message()));
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.threshold_for(failure.class()) {
                    self.transition(&mut inner, CircuitState::Open, reason);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, reason);
            }
            CircuitState::Open => {}
        }
    }

    /// Forces Closed, zeroes every counter and clears history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        *inner = CircuitInner::default();
        tracing::info!(source = %self.source, from = %previous, "circuit breaker reset");
    }

    /// Current state as observed now. Never mutates.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        inner.effective_state(self.clock.now(), self.config.cooldown)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Read-only status snapshot. Never mutates.
    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.lock();
        let now = self.clock.now();
        let state = inner.effective_state(now, self.config.cooldown);

        // A lapsed open circuit has a fresh trial budget once it is materialized.
        let half_open_trials = if inner.state == CircuitState::Open {
            0
        } else {
            inner.half_open_trials
        };
        let is_available = match state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => half_open_trials < self.config.half_open_max_calls,
            CircuitState::Open => false,
        };
        let retry_after_secs = match state {
            CircuitState::Open => inner
                .retry_at(self.config.cooldown)
                .map(|retry_at| retry_at.duration_since(now).as_secs()),
            _ => None,
        };
        let success_rate = if inner.total_calls == 0 {
            1.0
        } else {
            (inner.total_calls - inner.total_failures) as f64 / inner.total_calls as f64
        };

        CircuitBreakerStatus {
            source: self.source.clone(),
            state,
            failure_count: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            success_rate,
            last_failure_time: inner.last_failure_at,
            last_error: inner
                .last_error
                .as_ref()
                .map(|failure| failure.message().to_owned()),
            last_error_class: inner.last_error.as_ref().map(ClassifiedFailure::class),
            cooldown_period_minutes: self.config.cooldown.as_secs_f64() / 60.0,
            half_open_trials,
            half_open_max_calls: self.config.half_open_max_calls,
            is_available,
            retry_after_secs,
            state_changes: inner.history.iter().cloned().collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
    }

    /// Materializes Open -> HalfOpen once the cooldown has elapsed.
    fn refresh(&self, inner: &mut CircuitInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(retry_at) = inner.retry_at(self.config.cooldown) else {
            return;
        };
        if self.clock.now() >= retry_at {
            self.transition_at(inner, CircuitState::HalfOpen, None, retry_at);
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState, reason: Option<String>) {
        let now = self.clock.now();
        self.transition_at(inner, to, reason, now);
    }

    fn transition_at(
        &self,
        inner: &mut CircuitInner,
        to: CircuitState,
        reason: Option<String>,
        at: UtcDateTime,
    ) {
        let from = inner.state;
        inner.state = to;
        inner.half_open_trials = 0;
        inner.half_open_successes = 0;
        inner.opened_at = (to == CircuitState::Open).then_some(at);

        match to {
            CircuitState::Open => tracing::warn!(
                source = %self.source,
                from = %from,
                failures = inner.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(source = %self.source, "circuit half-open; admitting trial calls")
            }
            CircuitState::Closed => tracing::info!(source = %self.source, from = %from, "circuit closed"),
        }

        let entry = StateTransition {
            timestamp: at,
            from_state: from,
            to_state: to,
            failure_count: inner.consecutive_failures,
            reason,
        };
        inner.push_history(entry, self.config.history_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sanitizer::ErrorSanitizer;

    fn breaker(threshold: u32, cooldown: Duration, trial_calls: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            UtcDateTime::parse("2025-01-01T00:00:00Z").expect("valid"),
        ));
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            credential_failure_threshold: None,
            cooldown,
            half_open_max_calls: trial_calls,
            history_limit: 4,
        };
        let breaker = CircuitBreaker::new(
            SourceId::parse("grants_gov").expect("valid"),
            config,
            clock.clone(),
        );
        (breaker, clock)
    }

    fn transient() -> ClassifiedFailure {
        ErrorSanitizer::default().classify_message(Some(503), "service unavailable")
    }

    #[test]
    fn opens_after_threshold_failures() {
        let (breaker, _) = breaker(2, Duration::from_secs(10), 1);

        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(&transient());
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(&transient());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn transitions_to_half_open_after_cooldown_then_closes_on_success() {
        let (breaker, clock) = breaker(1, Duration::from_secs(60), 1);

        breaker.record_failure(&transient());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(59));
        assert!(!breaker.can_execute());

        clock.advance(Duration::from_secs(1));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.try_acquire().expect("trial admitted");
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn half_open_trial_budget_is_bounded() {
        let (breaker, clock) = breaker(1, Duration::from_secs(1), 2);
        breaker.record_failure(&transient());
        clock.advance(Duration::from_secs(1));

        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_ok());
        let rejection = breaker.try_acquire().expect_err("third trial rejected");
        assert_eq!(rejection.state, CircuitState::HalfOpen);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn credential_fast_trip_uses_lower_threshold() {
        let (mut breaker, _) = breaker(5, Duration::from_secs(60), 1);
        breaker.config.credential_failure_threshold = Some(1);

        let credential = ErrorSanitizer::default().classify_message(Some(401), "invalid api key");
        breaker.record_failure(&credential);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn history_is_bounded_and_sanitized() {
        let (breaker, clock) = breaker(1, Duration::from_secs(1), 1);
        let leaky = ErrorSanitizer::default()
            .classify_message(Some(500), "boom at https://x.test/?api_key=TOPSECRET99");

        for _ in 0..5 {
            breaker.record_failure(&leaky);
            clock.advance(Duration::from_secs(1));
            assert!(breaker.can_execute());
        }

        let status = breaker.status();
        assert_eq!(status.state_changes.len(), 4);
        for change in &status.state_changes {
            assert!(!change.reason.clone().unwrap_or_default().contains("TOPSECRET99"));
        }
        assert!(!status.last_error.unwrap_or_default().contains("TOPSECRET99"));
    }

    #[test]
    fn status_reports_lapsed_cooldown_without_mutating() {
        let (breaker, clock) = breaker(1, Duration::from_secs(30), 1);
        breaker.record_failure(&transient());
        clock.advance(Duration::from_secs(31));

        let first = breaker.status();
        let second = breaker.status();
        assert_eq!(first.state, CircuitState::HalfOpen);
        assert!(first.is_available);
        assert_eq!(first.state_changes.len(), 1);
        assert_eq!(first, second);
    }
}
