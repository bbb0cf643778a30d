//! Reconnection state machine and backoff schedule.
//!
//! [`ConnectionMachine`] is the pure transition table for the session's
//! [`ConnectionState`]; the session drives it and performs the I/O. Keeping
//! the table free of sockets and timers lets every transition be tested
//! directly.
//!
//! ```text
//! disconnected --connect--> connecting --handshake ok--> connected
//! connecting --handshake fail--> disconnected
//! connected --unintentional close--> reconnecting
//! reconnecting --retry ok--> connected
//! reconnecting --retry fail--> reconnecting (attempt+1) | disconnected (attempts exhausted)
//! any --disconnect--> disconnected
//! ```

use std::time::Duration;

use tickwire_types::{ConnectionState, ConnectionStatus};

/// Exponential reconnect backoff: `min(base * 2^(attempt-1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// Create a schedule with the given base delay and cap.
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before reconnect attempt `attempt` (1-based). Attempt 0 is
    /// treated as attempt 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Infinite iterator over the delays for attempts 1, 2, 3, ...
    pub fn schedule(self) -> impl Iterator<Item = Duration> {
        (1_u32..=u32::MAX).map(move |attempt| self.delay(attempt))
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller asked to connect.
    ConnectRequested,
    /// Identify was acknowledged on the first attempt.
    HandshakeSucceeded,
    /// First attempt failed or timed out.
    HandshakeFailed,
    /// The socket closed without `disconnect()` being called.
    TransportLost {
        /// Whether to start reconnecting.
        auto_reconnect: bool,
    },
    /// Caller asked to disconnect.
    DisconnectRequested,
    /// A reconnect attempt completed its handshake.
    RetrySucceeded,
    /// A reconnect attempt failed.
    RetryFailed,
}

/// An event that has no transition from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no transition from {from} on {event:?}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub from: ConnectionState,
    /// Event that was rejected.
    pub event: ConnectionEvent,
}

/// Transition table for the session's connection state.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: u32,
    max_attempts: Option<u32>,
}

impl ConnectionMachine {
    /// A machine in `disconnected`. `max_attempts` of `None` retries forever.
    pub const fn new(max_attempts: Option<u32>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            max_attempts,
        }
    }

    /// Current state.
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current status, with the attempt number while reconnecting.
    pub const fn status(&self) -> ConnectionStatus {
        match self.state {
            ConnectionState::Reconnecting => ConnectionStatus::reconnecting(self.attempt),
            state => ConnectionStatus::new(state),
        }
    }

    /// Apply an event, returning the status entered.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the state unchanged when the
    /// event does not apply to the current state.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionStatus, InvalidTransition> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self.state, event) {
            (_, E::DisconnectRequested) => self.enter_disconnected(),
            (S::Disconnected, E::ConnectRequested) => {
                self.state = S::Connecting;
                self.attempt = 0;
            }
            (S::Connecting, E::HandshakeSucceeded) | (S::Reconnecting, E::RetrySucceeded) => {
                self.state = S::Connected;
                self.attempt = 0;
            }
            (S::Connecting, E::HandshakeFailed) => self.enter_disconnected(),
            (S::Connected, E::TransportLost { auto_reconnect: true }) => self.enter_attempt(1),
            (S::Connected, E::TransportLost { auto_reconnect: false }) => {
                self.enter_disconnected();
            }
            (S::Reconnecting, E::RetryFailed) => self.enter_attempt(self.attempt.saturating_add(1)),
            (from, event) => return Err(InvalidTransition { from, event }),
        }
        Ok(self.status())
    }

    fn enter_attempt(&mut self, attempt: u32) {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            self.enter_disconnected();
        } else {
            self.state = ConnectionState::Reconnecting;
            self.attempt = attempt;
        }
    }

    const fn enter_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let backoff = Backoff::new(Duration::from_millis(1_000), Duration::from_millis(30_000));
        let delays: Vec<Duration> = backoff.schedule().take(8).collect();
        assert_eq!(
            delays,
            ms(&[1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000])
        );
    }

    #[test]
    fn backoff_survives_huge_attempts() {
        let backoff = Backoff::new(Duration::from_millis(1_000), Duration::from_millis(30_000));
        assert_eq!(backoff.delay(40), Duration::from_millis(30_000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(30_000));
        assert_eq!(backoff.delay(0), Duration::from_millis(1_000));
    }

    #[test]
    fn first_connect_happy_path() {
        let mut machine = ConnectionMachine::new(None);
        assert_eq!(
            machine.apply(ConnectionEvent::ConnectRequested).map(|s| s.state),
            Ok(ConnectionState::Connecting)
        );
        assert_eq!(
            machine.apply(ConnectionEvent::HandshakeSucceeded).map(|s| s.state),
            Ok(ConnectionState::Connected)
        );
    }

    #[test]
    fn failed_handshake_returns_to_disconnected() {
        let mut machine = ConnectionMachine::new(None);
        let _ = machine.apply(ConnectionEvent::ConnectRequested);
        assert_eq!(
            machine.apply(ConnectionEvent::HandshakeFailed).map(|s| s.state),
            Ok(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn reconnect_attempts_count_and_reset() {
        let mut machine = ConnectionMachine::new(None);
        let _ = machine.apply(ConnectionEvent::ConnectRequested);
        let _ = machine.apply(ConnectionEvent::HandshakeSucceeded);

        let lost = machine.apply(ConnectionEvent::TransportLost { auto_reconnect: true });
        assert_eq!(lost, Ok(ConnectionStatus::reconnecting(1)));
        let retry = machine.apply(ConnectionEvent::RetryFailed);
        assert_eq!(retry, Ok(ConnectionStatus::reconnecting(2)));
        let ok = machine.apply(ConnectionEvent::RetrySucceeded);
        assert_eq!(ok, Ok(ConnectionStatus::new(ConnectionState::Connected)));

        // The counter starts over after a successful retry.
        let lost_again = machine.apply(ConnectionEvent::TransportLost { auto_reconnect: true });
        assert_eq!(lost_again, Ok(ConnectionStatus::reconnecting(1)));
    }

    #[test]
    fn exhausting_attempts_disconnects() {
        let mut machine = ConnectionMachine::new(Some(2));
        let _ = machine.apply(ConnectionEvent::ConnectRequested);
        let _ = machine.apply(ConnectionEvent::HandshakeSucceeded);
        let _ = machine.apply(ConnectionEvent::TransportLost { auto_reconnect: true });
        assert_eq!(
            machine.apply(ConnectionEvent::RetryFailed),
            Ok(ConnectionStatus::reconnecting(2))
        );
        assert_eq!(
            machine.apply(ConnectionEvent::RetryFailed).map(|s| s.state),
            Ok(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn zero_max_attempts_never_reconnects() {
        let mut machine = ConnectionMachine::new(Some(0));
        let _ = machine.apply(ConnectionEvent::ConnectRequested);
        let _ = machine.apply(ConnectionEvent::HandshakeSucceeded);
        assert_eq!(
            machine
                .apply(ConnectionEvent::TransportLost { auto_reconnect: true })
                .map(|s| s.state),
            Ok(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn transport_loss_without_auto_reconnect_disconnects() {
        let mut machine = ConnectionMachine::new(None);
        let _ = machine.apply(ConnectionEvent::ConnectRequested);
        let _ = machine.apply(ConnectionEvent::HandshakeSucceeded);
        assert_eq!(
            machine
                .apply(ConnectionEvent::TransportLost { auto_reconnect: false })
                .map(|s| s.state),
            Ok(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn disconnect_applies_from_every_state() {
        for setup in [
            &[][..],
            &[ConnectionEvent::ConnectRequested][..],
            &[ConnectionEvent::ConnectRequested, ConnectionEvent::HandshakeSucceeded][..],
            &[
                ConnectionEvent::ConnectRequested,
                ConnectionEvent::HandshakeSucceeded,
                ConnectionEvent::TransportLost { auto_reconnect: true },
            ][..],
        ] {
            let mut machine = ConnectionMachine::new(None);
            for event in setup {
                let _ = machine.apply(*event);
            }
            assert_eq!(
                machine.apply(ConnectionEvent::DisconnectRequested).map(|s| s.state),
                Ok(ConnectionState::Disconnected)
            );
        }
    }

    #[test]
    fn invalid_transitions_leave_state_alone() {
        let mut machine = ConnectionMachine::new(None);
        let err = machine.apply(ConnectionEvent::HandshakeSucceeded);
        assert_eq!(
            err,
            Err(InvalidTransition {
                from: ConnectionState::Disconnected,
                event: ConnectionEvent::HandshakeSucceeded,
            })
        );
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        let _ = machine.apply(ConnectionEvent::ConnectRequested);
        assert!(machine.apply(ConnectionEvent::ConnectRequested).is_err());
        assert!(machine.apply(ConnectionEvent::RetrySucceeded).is_err());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }
}
