//! Rate limiting and backoff for calls to an external system.
//!
//! The limiter never sleeps. [`RateLimiter::admit`] tells the caller how long to
//! wait before its next call and [`RateLimiter::report`] feeds back what happened.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

use crate::types::Quota;

/// Maximum relative jitter applied to a backoff delay.
const JITTER: f64 = 0.2;

/// Result of a rate-limited call, as seen by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    RateLimited { reset_at: DateTime<Utc> },
    TransientError,
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(15 * 60),
        }
    }
}

/// Observed rate-limit state of one external system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState {
    /// Calls left in the current window, when the remote reports it.
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    /// Current backoff delay; zero after any success.
    pub backoff: Duration,
    /// No call may be made before this instant.
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: &'static str,
    policy: BackoffPolicy,
    min_interval: Duration,
    state: RateLimitState,
    /// Unjittered delay the next failure doubles from.
    base: Duration,
    last_call: Option<DateTime<Utc>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(name: &'static str, policy: BackoffPolicy) -> Self {
        Self {
            name,
            policy,
            min_interval: Duration::ZERO,
            state: RateLimitState::default(),
            base: Duration::ZERO,
            last_call: None,
        }
    }

    /// Require at least `interval` between consecutive calls.
    #[must_use]
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn state(&self) -> &RateLimitState {
        &self.state
    }

    /// How long the caller must wait before its next call. Never negative.
    #[must_use]
    pub fn admit(&self, now: DateTime<Utc>) -> Duration {
        let mut wait = Duration::ZERO;

        if let Some(blocked_until) = self.state.blocked_until {
            wait = wait.max(until(now, blocked_until));
        }

        if self.state.remaining == Some(0)
            && let Some(reset_at) = self.state.reset_at
        {
            wait = wait.max(until(now, reset_at));
        }

        if let Some(last_call) = self.last_call {
            wait = wait.max(until(now, after(last_call, self.min_interval)));
        }

        wait
    }

    /// Record the outcome of a call made at `now`.
    pub fn report(&mut self, outcome: CallOutcome, now: DateTime<Utc>) {
        self.last_call = Some(now);
        match outcome {
            CallOutcome::Success => {
                self.state.remaining = self.state.remaining.map(|r| r.saturating_sub(1));
                self.state.backoff = Duration::ZERO;
                self.state.blocked_until = None;
                self.base = Duration::ZERO;
            }
            CallOutcome::RateLimited { reset_at } => {
                debug!("{} rate limited until {reset_at}", self.name);
                self.state.remaining = Some(0);
                self.state.reset_at = Some(reset_at);
                self.state.blocked_until = Some(reset_at);
            }
            CallOutcome::TransientError => {
                self.state.backoff = self.next_backoff(rand::random::<f64>());
                self.state.blocked_until = Some(after(now, self.state.backoff));
                debug!(
                    "{} backing off for {:?} after a transient error",
                    self.name, self.state.backoff
                );
            }
        }
    }

    /// Adopt the quota the remote reported with its latest response.
    pub fn observe_quota(&mut self, quota: Quota) {
        self.state.remaining = Some(quota.remaining);
        self.state.reset_at = Some(quota.reset_at);
    }

    /// Double the base delay within the policy bounds and apply jitter.
    ///
    /// `sample` is a uniform draw from `[0, 1)`. The result never drops below
    /// the previous delay, so consecutive failures never shorten the wait.
    fn next_backoff(&mut self, sample: f64) -> Duration {
        self.base = if self.base.is_zero() {
            self.policy.floor
        } else {
            self.base.saturating_mul(2).min(self.policy.ceiling)
        };

        let factor = 1.0 + JITTER * (sample.clamp(0.0, 1.0) * 2.0 - 1.0);
        Duration::try_from_secs_f64(self.base.as_secs_f64() * factor)
            .unwrap_or(self.policy.ceiling)
            .max(self.state.backoff)
            .min(self.policy.ceiling)
    }
}

fn until(now: DateTime<Utc>, target: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

fn after(instant: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
