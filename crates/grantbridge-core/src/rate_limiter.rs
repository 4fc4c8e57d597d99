//! Per-source call budgets.
//!
//! A source either uses a fixed window (`calls` per `period`, counter reset when
//! the window rolls over) or a rolling window backed by a `governor` quota.
//! Both read time from the injected [`Clock`].

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::Clock as GovernorClock;
use governor::middleware::NoOpMiddleware;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::{SourceId, UtcDateTime};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuotaClock, NoOpMiddleware<Duration>>;

/// Feeds the injected clock to `governor` as time elapsed since the limiter was built.
#[derive(Debug, Clone)]
struct QuotaClock {
    clock: Arc<dyn Clock>,
    origin: UtcDateTime,
}

impl GovernorClock for QuotaClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.clock.now().duration_since(self.origin)
    }
}

/// Window accounting strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    #[default]
    Fixed,
    Rolling,
}

impl WindowKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Rolling => "rolling",
        }
    }
}

/// Allowed call count per period for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub calls: u32,
    pub period: Duration,
    pub window: WindowKind,
}

impl RateLimitPolicy {
    pub const fn per_minute(calls: u32) -> Self {
        Self {
            calls,
            period: Duration::from_secs(60),
            window: WindowKind::Fixed,
        }
    }

    pub const fn rolling(mut self) -> Self {
        self.window = WindowKind::Rolling;
        self
    }
}

/// Returned when a call would exceed the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after: Duration,
}

/// Current budget usage for one source.
///
/// For rolling windows `window_start` is `now - period` and `call_count` counts
/// the calls granted since then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitWindow {
    pub source: SourceId,
    pub window: WindowKind,
    pub window_start: UtcDateTime,
    pub window_length_secs: u64,
    pub call_count: u32,
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Debug)]
struct FixedWindow {
    window_start: UtcDateTime,
    call_count: u32,
}

#[derive(Debug, Default)]
struct RollingLog {
    /// Grant times inside the trailing period, oldest first.
    granted: VecDeque<UtcDateTime>,
    /// Expiry of units handed back by `refund`; spent before asking `governor`.
    credits: VecDeque<UtcDateTime>,
}

impl RollingLog {
    fn prune(&mut self, now: UtcDateTime, period: Duration) {
        while self
            .granted
            .front()
            .is_some_and(|granted| now >= granted.saturating_add(period))
        {
            self.granted.pop_front();
        }
        while self.credits.front().is_some_and(|expiry| now >= *expiry) {
            self.credits.pop_front();
        }
    }
}

#[derive(Debug)]
struct LimiterInner {
    fixed: FixedWindow,
    rolling: RollingLog,
    /// Set when an upstream rate-limit response exhausted the budget early.
    blocked_until: Option<UtcDateTime>,
}

/// Rate limiter guarding one source.
pub struct SourceRateLimiter {
    source: SourceId,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    /// Zero point of the rolling limiter's time line.
    origin: UtcDateTime,
    rolling: Option<DirectRateLimiter>,
    inner: Mutex<LimiterInner>,
}

impl std::fmt::Debug for SourceRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRateLimiter")
            .field("source", &self.source)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SourceRateLimiter {
    pub fn new(source: SourceId, policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let rolling = (policy.window == WindowKind::Rolling).then(|| {
            let quota_clock = QuotaClock {
                clock: Arc::clone(&clock),
                origin: now,
            };
            RateLimiter::direct_with_clock(quota_from_window(policy.period, policy.calls), &quota_clock)
        });
        Self {
            source,
            policy,
            clock,
            origin: now,
            rolling,
            inner: Mutex::new(LimiterInner {
                fixed: FixedWindow {
                    window_start: now,
                    call_count: 0,
                },
                rolling: RollingLog::default(),
                blocked_until: None,
            }),
        }
    }

    pub const fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Consumes one unit of budget, or reports how long until budget is available.
    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        let now = self.clock.now();
        let mut inner = self.lock();

        if let Some(until) = inner.blocked_until {
            if now < until {
                return Err(self.limited(until.duration_since(now)));
            }
            inner.blocked_until = None;
        }

        if let Some(limiter) = &self.rolling {
            inner.rolling.prune(now, self.policy.period);
            if inner.rolling.credits.pop_front().is_none() {
                if let Err(not_until) = limiter.check() {
                    let elapsed = now.duration_since(self.origin);
                    return Err(self.limited(not_until.wait_time_from(elapsed)));
                }
            }
            inner.rolling.granted.push_back(now);
            return Ok(());
        }

        self.roll_over(&mut inner.fixed, now);
        if inner.fixed.call_count >= self.policy.calls {
            let resets_at = inner.fixed.window_start.saturating_add(self.policy.period);
            return Err(self.limited(resets_at.duration_since(now)));
        }
        inner.fixed.call_count += 1;
        Ok(())
    }

    /// Hands back a unit taken by [`try_acquire`](Self::try_acquire) when the call
    /// did not go ahead.
    pub fn refund(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        match self.policy.window {
            WindowKind::Fixed => {
                inner.fixed.call_count = inner.fixed.call_count.saturating_sub(1);
            }
            WindowKind::Rolling => {
                inner.rolling.prune(now, self.policy.period);
                if inner.rolling.granted.pop_back().is_some() {
                    inner
                        .rolling
                        .credits
                        .push_back(now.saturating_add(self.policy.period));
                }
            }
        }
        tracing::debug!(source = %self.source, "rate unit refunded");
    }

    /// Marks the current window as spent after the upstream reported a rate limit.
    pub fn exhaust(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        match self.policy.window {
            WindowKind::Fixed => {
                self.roll_over(&mut inner.fixed, now);
                inner.fixed.call_count = self.policy.calls;
            }
            WindowKind::Rolling => {
                inner.blocked_until = Some(now.saturating_add(self.policy.period));
            }
        }
        tracing::info!(source = %self.source, "rate window exhausted by upstream");
    }

    pub fn snapshot(&self) -> RateLimitWindow {
        let now = self.clock.now();
        let mut inner = self.lock();
        let (window_start, call_count) = match self.policy.window {
            WindowKind::Fixed => {
                if now >= inner.fixed.window_start.saturating_add(self.policy.period) {
                    (now, 0)
                } else {
                    (inner.fixed.window_start, inner.fixed.call_count)
                }
            }
            WindowKind::Rolling => {
                inner.rolling.prune(now, self.policy.period);
                let count = u32::try_from(inner.rolling.granted.len()).unwrap_or(u32::MAX);
                (now.saturating_sub(self.policy.period), count)
            }
        };
        let blocked = inner.blocked_until.is_some_and(|until| now < until);
        RateLimitWindow {
            source: self.source.clone(),
            window: self.policy.window,
            window_start,
            window_length_secs: self.policy.period.as_secs(),
            call_count,
            limit: self.policy.calls,
            remaining: if blocked {
                0
            } else {
                self.policy.calls.saturating_sub(call_count)
            },
        }
    }

    fn roll_over(&self, window: &mut FixedWindow, now: UtcDateTime) {
        if now >= window.window_start.saturating_add(self.policy.period) {
            window.window_start = now;
            window.call_count = 0;
        }
    }

    fn limited(&self, retry_after: Duration) -> RateLimited {
        tracing::debug!(
            source = %self.source,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate limited locally"
        );
        RateLimited { retry_after }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterInner> {
        self.inner
            .lock()
            .expect("rate limiter lock is not poisoned")
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = NonZeroU32::new(quota_limit).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(safe_limit.get())).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(safe_limit))
        .allow_burst(safe_limit)
}
