//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy applied on top of the exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Exact exponential delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Half the delay plus uniform in `[0, delay / 2]`.
    Equal,
}

/// `min(base * factor^attempt, cap)` backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub factor: u32,
    pub jitter: Jitter,
}

impl Backoff {
    /// Doubling backoff with equal jitter.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            factor: 2,
            jitter: Jitter::Equal,
        }
    }

    /// Sets the jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.max(1).saturating_pow(attempt.min(31));
        self.base
            .checked_mul(multiplier)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Delay before retry number `attempt` with jitter applied.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => random_up_to(delay),
            Jitter::Equal => {
                let half = delay / 2;
                half + random_up_to(delay - half)
            }
        }
    }
}

fn random_up_to(max: Duration) -> Duration {
    let millis = max.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(16));
        let delays: Vec<u64> = (0..7).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay(500), Duration::from_secs(30));
    }

    #[test]
    fn test_equal_jitter_stays_in_upper_half() {
        let backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(60));
        for _ in 0..100 {
            let d = backoff.next_delay(1);
            assert!(d >= Duration::from_secs(4), "{:?}", d);
            assert!(d <= Duration::from_secs(8), "{:?}", d);
        }
    }

    #[test]
    fn test_full_jitter_bounded() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(Jitter::Full);
        for _ in 0..100 {
            assert!(backoff.next_delay(0) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(1))
            .with_jitter(Jitter::None);
        assert_eq!(backoff.next_delay(1), Duration::from_millis(500));
    }
}
