//! ICE restart policy.

use std::time::Duration;

use crate::constants::{ICE_RESTART_DELAY, MAX_ICE_RESTARTS};

/// What to do after `iceConnectionState` hits `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Issue a fresh offer with ICE-restart semantics after `delay`.
    Restart { delay: Duration },
    /// Restarts exhausted or P2P impossible: commit to relay.
    CommitRelay,
}

/// Bounded ICE-restart counter for one peer connection.
///
/// The counter resets on a successful connect, so a link that flaps gets a
/// fresh budget each time it recovers.
#[derive(Debug, Clone)]
pub struct IceRestartPolicy {
    restarts: u32,
    max_restarts: u32,
    restart_delay: Duration,
}

impl Default for IceRestartPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl IceRestartPolicy {
    pub fn new() -> Self {
        IceRestartPolicy {
            restarts: 0,
            max_restarts: MAX_ICE_RESTARTS,
            restart_delay: ICE_RESTART_DELAY,
        }
    }

    /// Number of restarts issued since the last successful connect.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Decide on a `failed` transition. `p2p_possible` comes from the
    /// quality prediction; restarting makes no sense when the candidate
    /// set never showed a direct path.
    pub fn on_failed(&mut self, p2p_possible: bool) -> RestartDecision {
        if !p2p_possible || self.restarts >= self.max_restarts {
            return RestartDecision::CommitRelay;
        }
        self.restarts += 1;
        RestartDecision::Restart {
            delay: self.restart_delay,
        }
    }

    /// A connect succeeded; the budget refills.
    pub fn on_connected(&mut self) {
        self.restarts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restarts_until_budget_exhausted() {
        let mut policy = IceRestartPolicy::new();

        assert!(matches!(
            policy.on_failed(true),
            RestartDecision::Restart { delay } if delay == ICE_RESTART_DELAY
        ));
        assert!(matches!(policy.on_failed(true), RestartDecision::Restart { .. }));
        assert_eq!(policy.on_failed(true), RestartDecision::CommitRelay);
        assert_eq!(policy.restarts(), MAX_ICE_RESTARTS);
    }

    #[test]
    fn no_restart_when_p2p_impossible() {
        let mut policy = IceRestartPolicy::new();
        assert_eq!(policy.on_failed(false), RestartDecision::CommitRelay);
        assert_eq!(policy.restarts(), 0);
    }

    #[test]
    fn connect_resets_the_budget() {
        let mut policy = IceRestartPolicy::new();
        policy.on_failed(true);
        policy.on_failed(true);
        policy.on_connected();
        assert_eq!(policy.restarts(), 0);
        assert!(matches!(policy.on_failed(true), RestartDecision::Restart { .. }));
    }
}
