use std::time::Duration;

/// Shortest delay between two attempts, so a zero policy doesn't dial in a busy loop.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Delays between failed connection attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

/// Exponential backoff, doubling the delay after every failure up to the maximum.
///
/// The first value is the initial delay, so it is meant to be asked after the first failed
/// attempt and not before it.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Backoff {
            current: first_delay(&policy),
            policy,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        self.current = self
            .current
            .saturating_mul(2)
            .min(self.policy.max_delay)
            .max(MIN_DELAY);

        delay
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.current = first_delay(&self.policy);
    }
}

fn first_delay(policy: &ReconnectPolicy) -> Duration {
    policy.initial_delay.min(policy.max_delay).max(MIN_DELAY)
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_delay())
    }
}
