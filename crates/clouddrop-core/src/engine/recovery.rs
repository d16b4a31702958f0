//! Background P2P recovery scheduling.

use std::time::Duration;

use crate::constants::{P2P_RETRY_INITIAL_DELAY, P2P_RETRY_INTERVAL, P2P_RETRY_MAX_ATTEMPTS};

/// Retry plan for silently re-attempting a direct connection after a relay
/// commitment: one delayed first attempt, then a fixed interval, bounded.
///
/// The schedule is pure; the client binds it to a cancellable task that
/// dies with the peer, so peer-left cleanup is just an abort.
#[derive(Debug, Clone)]
pub struct RecoverySchedule {
    attempts_made: u32,
    max_attempts: u32,
    initial_delay: Duration,
    interval: Duration,
}

impl Default for RecoverySchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoverySchedule {
    pub fn new() -> Self {
        Self::with_config(
            P2P_RETRY_MAX_ATTEMPTS,
            P2P_RETRY_INITIAL_DELAY,
            P2P_RETRY_INTERVAL,
        )
    }

    pub fn with_config(max_attempts: u32, initial_delay: Duration, interval: Duration) -> Self {
        RecoverySchedule {
            attempts_made: 0,
            max_attempts,
            initial_delay,
            interval,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_made >= self.max_attempts {
            return None;
        }
        let delay = if self.attempts_made == 0 {
            self.initial_delay
        } else {
            self.interval
        };
        self.attempts_made += 1;
        Some(delay)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_then_interval() {
        let mut schedule =
            RecoverySchedule::with_config(3, Duration::from_secs(10), Duration::from_secs(30));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(schedule.next_delay(), None);
        assert_eq!(schedule.attempts_made(), 3);
    }

    #[test]
    fn default_budget_matches_protocol() {
        let mut schedule = RecoverySchedule::new();
        let mut count = 0;
        while schedule.next_delay().is_some() {
            count += 1;
        }
        assert_eq!(count, P2P_RETRY_MAX_ATTEMPTS);
    }
}
