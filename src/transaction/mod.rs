//! SIP transaction state machines and their supporting pieces (RFC 3261 §17).
//!
//! Each live transaction is a spawned event loop owning its own FSM state and
//! timers, fed through an internal command channel so every state machine is
//! serialised with respect to itself. Correlation handles (the command
//! senders) live in the [`store`]; the TU talks to a transaction through the
//! receiver halves of its bounded channels.

pub mod client;
pub mod key;
pub(crate) mod store;
pub mod server;

use std::sync::atomic::{AtomicU8, Ordering};

pub use client::ClientTransaction;
pub use key::TransactionKey;
pub use server::ServerTransaction;

/// The states of the four RFC 3261 transaction machines.
///
/// Client transactions start in `Calling`, server transactions in
/// `Proceeding`; `Confirmed` exists only for INVITE server transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Request sent, no response seen yet (client only).
    Calling,
    /// A provisional response has been received (client) or may be sent
    /// (server); waiting for a final response.
    Proceeding,
    /// A final response has been received (client) or sent (server);
    /// absorbing retransmissions until the linger timer expires.
    Completed,
    /// ACK received for a non-2xx final response (INVITE server only).
    Confirmed,
    /// Finished. The transaction has removed itself from the store and its
    /// TU channels are closed.
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        *self == TransactionState::Terminated
    }
}

/// Lock-free cell holding a [`TransactionState`], shared between a
/// transaction's event loop and the handles observing it.
#[derive(Debug)]
pub struct AtomicTransactionState {
    value: AtomicU8,
}

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        AtomicTransactionState {
            value: AtomicU8::new(encode(state)),
        }
    }

    pub fn get(&self) -> TransactionState {
        decode(self.value.load(Ordering::Acquire))
    }

    /// Stores `state` and returns the previous value.
    pub fn set(&self, state: TransactionState) -> TransactionState {
        decode(self.value.swap(encode(state), Ordering::AcqRel))
    }
}

fn encode(state: TransactionState) -> u8 {
    match state {
        TransactionState::Calling => 0,
        TransactionState::Proceeding => 1,
        TransactionState::Completed => 2,
        TransactionState::Confirmed => 3,
        TransactionState::Terminated => 4,
    }
}

fn decode(value: u8) -> TransactionState {
    match value {
        0 => TransactionState::Calling,
        1 => TransactionState::Proceeding,
        2 => TransactionState::Completed,
        3 => TransactionState::Confirmed,
        _ => TransactionState::Terminated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_round_trips_every_state() {
        for state in [
            TransactionState::Calling,
            TransactionState::Proceeding,
            TransactionState::Completed,
            TransactionState::Confirmed,
            TransactionState::Terminated,
        ] {
            let cell = AtomicTransactionState::new(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn set_returns_previous_state() {
        let cell = AtomicTransactionState::new(TransactionState::Calling);
        assert_eq!(cell.set(TransactionState::Proceeding), TransactionState::Calling);
        assert_eq!(cell.get(), TransactionState::Proceeding);
        assert!(!cell.get().is_terminated());
        cell.set(TransactionState::Terminated);
        assert!(cell.get().is_terminated());
    }
}
