//! Session lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

/// `Connecting → Authenticating → Active → Closed`, with `Disconnecting` as a
/// short stop on the way to `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Authenticating = 1,
    Active = 2,
    Disconnecting = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Connecting,
            1 => SessionState::Authenticating,
            2 => SessionState::Active,
            3 => SessionState::Disconnecting,
            _ => SessionState::Closed,
        }
    }
}

/// Shared, lock-free state holder. `Closed` is terminal.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `next`; returns false if the session was already closed
    pub(crate) fn set(&self, next: SessionState) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != SessionState::Closed as u8).then_some(next as u8)
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_terminal() {
        let cell = StateCell::new(SessionState::Connecting);
        assert!(cell.set(SessionState::Active));
        assert!(cell.set(SessionState::Closed));
        assert!(!cell.set(SessionState::Active));
        assert_eq!(cell.get(), SessionState::Closed);
    }
}
