//! # SIP Transaction Layer
//!
//! An implementation of the SIP transaction layer defined in
//! [RFC 3261](https://datatracker.ietf.org/doc/html/rfc3261) section 17:
//! the short-lived state machines that turn unreliable, retransmitted wire
//! traffic into correlated request/response exchanges with at-most-once
//! delivery to the layer above.
//!
//! The transaction layer sits between the transport and the Transaction
//! User (TU, typically a dialog or call-control layer):
//!
//! ```text
//! +--------------------------------------+
//! |        Transaction User (TU)         |
//! |  (dialog management, call control)   |
//! +--------------------------------------+
//!         requests() / responses() / send()
//! +--------------------------------------+
//! |        Transaction Layer             |
//! |           (this crate)               |
//! +--------------------------------------+
//!         listen() / send() / inbound stream
//! +--------------------------------------+
//! |        Transport Layer               |
//! |        (UDP, TCP, TLS, ...)          |
//! +--------------------------------------+
//! ```
//!
//! ## Responsibilities
//!
//! 1. **Reliability**: retransmission timers (A/G with exponential backoff)
//!    make request/response delivery dependable over UDP; on reliable
//!    transports the retransmission machinery switches itself off.
//! 2. **State machines**: the four RFC 3261 transaction automata
//!    (INVITE/non-INVITE × client/server), each running as its own task so
//!    an FSM is never re-entered concurrently.
//! 3. **Correlation**: branch/method keying per §17.1.3 and §17.2.3, with
//!    the RFC 2543 fallback for cookieless branches, so retransmissions and
//!    responses find their transaction.
//! 4. **ACK handling**: ACKs for non-2xx finals are absorbed by the INVITE
//!    server transaction and surfaced on its [`ServerTransaction::ack`]
//!    stream; ACKs for 2xx responses pass through transaction-less.
//! 5. **TU interface**: [`TransactionManager::send`] for client
//!    transactions, [`Incoming`] for new server transactions and unmatched
//!    responses.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sip_transaction::prelude::*;
//!
//! # fn parse(_bytes: &[u8]) -> Option<Message> { None }
//! # async fn example() -> Result<()> {
//! let transport = Arc::new(UdpTransport::new(parse));
//! let (manager, mut incoming) = TransactionManager::new(
//!     transport,
//!     "0.0.0.0:5060",
//!     None,
//! ).await?;
//!
//! // Server side: take new transactions off the requests stream.
//! if let Some(tx) = incoming.requests.recv().await {
//!     let ringing = Response::new(180, "Ringing");
//!     tx.respond(ringing)?;
//! }
//!
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod manager;
pub mod message;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use error::{Error, Result};
pub use manager::{Incoming, TransactionManager};
pub use message::{Message, Method, Request, Response};
pub use timer::{after_func, TimerHandle, TimerSettings};
pub use transaction::{
    ClientTransaction, ServerTransaction, TransactionKey, TransactionState,
};
pub use transport::Transport;

pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::manager::{Incoming, TransactionManager};
    pub use crate::message::{
        copy_headers, generate_branch, CSeq, HasHeaders, Header, Message, Method, NameAddr,
        Request, Response, Uri, Via, ViaHop, RFC3261_BRANCH_MAGIC_COOKIE,
    };
    pub use crate::timer::{after_func, TimerHandle, TimerSettings};
    pub use crate::transaction::{
        ClientTransaction, ServerTransaction, TransactionKey, TransactionState,
    };
    pub use crate::transport::{Transport, UdpTransport};
}
