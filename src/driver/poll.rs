//! Bounded fixed-interval polling

use std::time::Duration;

use tokio::time::Instant;

use super::DriverError;

/// Interval between checks and the total time allowed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, ceiling: Duration) -> Self {
        Self { interval, ceiling }
    }
}

/// Tracks one polling loop.
///
/// Call [`Poller::wait`] between checks; it fails with
/// [`DriverError::Timeout`] once the next check would land past the ceiling.
pub struct Poller {
    policy: PollPolicy,
    started: Instant,
    attempts: u32,
}

impl Poller {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            attempts: 0,
        }
    }

    pub async fn wait(&mut self, operation: &str) -> Result<(), DriverError> {
        if self.started.elapsed() + self.policy.interval > self.policy.ceiling {
            return Err(DriverError::timeout(operation, self.policy.ceiling));
        }
        self.attempts += 1;
        tokio::time::sleep(self.policy.interval).await;
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
