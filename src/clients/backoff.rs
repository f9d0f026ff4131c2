use std::time::Duration;

/// How a [`CollabClient`](super::CollabClient) keeps its session alive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt; doubles on every attempt.
    pub initial_delay: Duration,
    /// Reconnect attempts after an abnormal close before giving up.
    pub max_attempts: u32,
    /// Interval of the client's own `ping` frames while open.
    pub heartbeat_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Exponential backoff over a bounded number of attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            initial_delay: policy.initial_delay,
            max_attempts: policy.max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.initial_delay.saturating_mul(2u32.saturating_pow(self.attempts));
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_gives_up() {
        let mut backoff = Backoff::new(&ReconnectPolicy::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay()).map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(backoff.attempts(), 5);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(&ReconnectPolicy::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn zero_attempts_never_retries() {
        let policy = ReconnectPolicy { max_attempts: 0, ..ReconnectPolicy::default() };
        assert_eq!(Backoff::new(&policy).next_delay(), None);
    }
}
