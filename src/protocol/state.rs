//! Connection state machine.
//!
//! States only move forward: `Connecting -> Connected -> Disconnected`, with
//! `Connecting -> Disconnected` allowed for a failed handshake. Disconnected
//! is terminal; entering it again is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        })
    }
}

/// Lock-free holder of a [`ConnectionState`] that enforces legal transitions.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Connecting -> Connected`. Returns false from any other state.
    pub fn connect(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Enter `Disconnected`. Returns whether this call made the transition.
    pub fn disconnect(&self) -> bool {
        self.0.swap(ConnectionState::Disconnected as u8, Ordering::AcqRel)
            != ConnectionState::Disconnected as u8
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        let state = StateCell::new();
        assert_eq!(state.get(), ConnectionState::Connecting);

        assert!(state.connect());
        assert_eq!(state.get(), ConnectionState::Connected);
        assert!(!state.connect());

        assert!(state.disconnect());
        assert_eq!(state.get(), ConnectionState::Disconnected);
        assert!(!state.disconnect());
        assert!(!state.connect());
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn failed_handshake_skips_connected() {
        let state = StateCell::new();
        assert!(state.disconnect());
        assert!(!state.connect());
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }
}
