use std::fmt;
use std::time::Duration;

use crate::config::RetryPolicy;

/// Attempt counter for the passive connection
///
/// Attempts are numbered from 1. Each failure schedules the next attempt
/// `attempt * interval` later until `max_attempts` have been made.
#[derive(Debug)]
pub struct RetryState {
    attempt: u32,
    policy: RetryPolicy,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { attempt: 1, policy }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Back to the first attempt (on heartbeat)
    pub fn reset(&mut self) {
        self.attempt = 1;
    }

    /// Move on to the next attempt and return how long to wait before it,
    /// or None once every attempt has been used
    pub fn schedule_next(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.interval * self.attempt;
        self.attempt += 1;
        Some(delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "attempt {}/{}", self.attempt, self.policy.max_attempts)
    }
}
