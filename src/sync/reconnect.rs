// Connection state machine
// State is plain data; every method is a pure transition that reports what changed.
// Timers and I/O live in the ConnectionManager, which drives this machine.

use std::time::Duration;

use crate::error::SyncError;

/// Connection state, one per engine. Only the ConnectionManager writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// States in which a transport loss should be retried.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

/// A state change, reported exactly once by whoever applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Exponential backoff: `base_delay * 2^(attempt-1)`, at most `max_attempts` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// What to do after the transport went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossOutcome {
    /// Schedule retry number `attempt` after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Retries used up, the machine is now FAILED
    Exhausted { attempts: u32 },
    /// Loss reported while no session was live
    Ignored,
}

/// Generation token. Asynchronous work tagged with an older epoch is stale.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: u32,
    epoch: Epoch,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        ConnectionMachine {
            state: ConnectionState::Disconnected,
            attempt: 0,
            epoch: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch == epoch
    }

    /// Invalidate everything tagged with the current epoch and return the new one.
    pub fn advance_epoch(&mut self) -> Epoch {
        self.epoch += 1;
        self.epoch
    }

    fn set(&mut self, to: ConnectionState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(Transition { from, to })
    }

    /// Start a fresh session. Allowed from DISCONNECTED, and from FAILED as the
    /// explicit recovery path.
    pub fn begin_connect(&mut self) -> Result<Transition, SyncError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.attempt = 0;
                self.advance_epoch();
                let from = self.state;
                self.state = ConnectionState::Connecting;
                Ok(Transition { from, to: ConnectionState::Connecting })
            }
            other => Err(SyncError::AlreadyActive(other)),
        }
    }

    /// The transport handshake completed.
    pub fn established(&mut self) -> Option<Transition> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.attempt = 0;
                self.set(ConnectionState::Connected)
            }
            _ => None,
        }
    }

    /// The transport closed or failed to open.
    pub fn lost(&mut self) -> (LossOutcome, Option<Transition>) {
        if !self.state.is_live() {
            return (LossOutcome::Ignored, None);
        }

        self.advance_epoch();
        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            let attempts = self.policy.max_attempts;
            let transition = self.set(ConnectionState::Failed);
            return (LossOutcome::Exhausted { attempts }, transition);
        }

        let attempt = self.attempt;
        let delay = self.policy.delay_for(attempt);
        let transition = self.set(ConnectionState::Reconnecting);
        (LossOutcome::Retry { attempt, delay }, transition)
    }

    /// Explicit teardown. Safe to call in any state.
    pub fn reset(&mut self) -> Option<Transition> {
        self.attempt = 0;
        self.advance_epoch();
        self.set(ConnectionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy::default())
    }

    #[test]
    fn test_backoff_sequence_then_failed() {
        let mut m = machine();
        m.begin_connect().unwrap();

        let mut delays = Vec::new();
        for _ in 0..5 {
            match m.lost().0 {
                LossOutcome::Retry { delay, .. } => delays.push(delay.as_millis() as u64),
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);

        let (outcome, transition) = m.lost();
        assert_eq!(outcome, LossOutcome::Exhausted { attempts: 5 });
        assert_eq!(
            transition,
            Some(Transition { from: ConnectionState::Reconnecting, to: ConnectionState::Failed })
        );

        // Terminal: further losses do nothing
        assert_eq!(m.lost(), (LossOutcome::Ignored, None));
    }

    #[test]
    fn test_reconnect_success_resets_attempts() {
        let mut m = machine();
        m.begin_connect().unwrap();
        m.lost();
        m.lost();
        assert_eq!(m.attempt(), 2);

        let t = m.established().unwrap();
        assert_eq!(t.from, ConnectionState::Reconnecting);
        assert_eq!(t.to, ConnectionState::Connected);
        assert_eq!(m.attempt(), 0);

        // Next loss starts from the base delay again
        match m.lost().0 {
            LossOutcome::Retry { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(1000));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_losses_report_single_transition() {
        let mut m = machine();
        m.begin_connect().unwrap();
        let (_, first) = m.lost();
        let (_, second) = m.lost();
        assert!(first.is_some());
        assert!(second.is_none(), "RECONNECTING -> RECONNECTING is not a transition");
    }

    #[test]
    fn test_connect_rejected_while_active() {
        let mut m = machine();
        m.begin_connect().unwrap();
        assert_eq!(
            m.begin_connect(),
            Err(SyncError::AlreadyActive(ConnectionState::Connecting))
        );
        m.established();
        assert!(m.begin_connect().is_err());
    }

    #[test]
    fn test_connect_allowed_after_failed() {
        let mut m = machine();
        m.begin_connect().unwrap();
        for _ in 0..6 {
            m.lost();
        }
        assert_eq!(m.state(), ConnectionState::Failed);

        let t = m.begin_connect().unwrap();
        assert_eq!(t.from, ConnectionState::Failed);
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn test_reset_is_idempotent_and_bumps_epoch() {
        let mut m = machine();
        m.begin_connect().unwrap();
        let before = m.epoch();

        assert!(m.reset().is_some());
        assert!(m.reset().is_none());
        assert!(m.epoch() > before);
        assert!(!m.is_current(before));
    }
}
