//! Client reconnection policy.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

/// How a client with auto-reconnect re-runs the handshake after an
/// unplanned disconnect or a failed handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Start the next handshake right away, forever.
    ///
    /// Each handshake already retries for up to the connect timeout while the
    /// listener is absent, so a missing server costs one attempt per timeout.
    Immediate,

    /// Exponential backoff between attempts, without jitter.
    Backoff {
        /// Delay before the first retry.
        initial_interval: Duration,
        /// Upper bound for any single delay.
        max_interval: Duration,
        /// Growth factor applied after each attempt.
        multiplier: f64,
        /// Give up after this many consecutive failed attempts. `None` retries
        /// forever.
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Immediate
    }
}

impl ReconnectPolicy {
    /// Backoff from 100ms up to 10s, doubling, at most 10 attempts.
    pub fn backoff() -> Self {
        ReconnectPolicy::Backoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: Some(10),
        }
    }

    pub(crate) fn schedule(&self) -> ReconnectSchedule {
        match self {
            ReconnectPolicy::Immediate => ReconnectSchedule {
                backoff: None,
                attempts: 0,
                max_attempts: None,
            },
            ReconnectPolicy::Backoff {
                initial_interval,
                max_interval,
                multiplier,
                max_attempts,
            } => ReconnectSchedule {
                backoff: Some(ExponentialBackoff {
                    current_interval: *initial_interval,
                    initial_interval: *initial_interval,
                    max_interval: *max_interval,
                    multiplier: *multiplier,
                    randomization_factor: 0.0,
                    max_elapsed_time: None,
                    ..Default::default()
                }),
                attempts: 0,
                max_attempts: *max_attempts,
            },
        }
    }
}

/// Running state of one policy: consecutive attempts and the next delay.
#[derive(Debug)]
pub(crate) struct ReconnectSchedule {
    backoff: Option<ExponentialBackoff>,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl ReconnectSchedule {
    /// Delay before the next attempt, or `None` once the attempt cap is hit.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;

        match &mut self.backoff {
            None => Some(Duration::ZERO),
            Some(backoff) => backoff.next_backoff(),
        }
    }

    /// Forget past failures after a successful connect.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        if let Some(backoff) = &mut self.backoff {
            backoff.reset();
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}
