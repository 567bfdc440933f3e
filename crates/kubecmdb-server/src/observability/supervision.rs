//! Restart Policies and Tracking
//!
//! A supervised worker that fails is restarted after an exponentially
//! growing delay. Too many restarts inside the policy window exhaust the
//! tracker and the worker stays down.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed inside `window`; zero disables restarts.
    pub max_restarts: u32,
    pub window: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(300),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, window: Duration, initial: Duration, max: Duration) -> Self {
        Self {
            max_restarts,
            window,
            initial_backoff: initial,
            max_backoff: max,
        }
    }

    /// Run once; used for full-sync passes, which the next tick retries.
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }
}

/// Restart history of one worker.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restarts: VecDeque<Instant>,
    backoff: ExponentialBackoff,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        let backoff = ExponentialBackoff {
            initial_interval: policy.initial_backoff,
            current_interval: policy.initial_backoff,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: policy.max_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        Self {
            policy,
            restarts: VecDeque::new(),
            backoff,
        }
    }

    /// Record a failure. Returns the delay before restarting, or `None` once
    /// the policy is exhausted.
    pub fn record_restart(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.evict_expired(now);
        if self.restarts.len() >= self.policy.max_restarts as usize {
            return None;
        }
        self.restarts.push_back(now);
        Some(
            self.backoff
                .next_backoff()
                .unwrap_or(self.policy.max_backoff),
        )
    }

    /// Record a failure after a run of `ran_for`. A run that outlived the
    /// policy window starts the backoff over from the initial delay.
    pub fn record_failure(&mut self, ran_for: Duration) -> Option<Duration> {
        if ran_for >= self.policy.window {
            self.reset();
        }
        self.record_restart()
    }

    fn reset(&mut self) {
        self.backoff.reset();
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.len()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.restarts.front() {
            if now.duration_since(*front) > self.policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}
