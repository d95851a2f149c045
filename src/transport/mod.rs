//! The transport contract consumed by the transaction layer (RFC 3261 §18).
//!
//! Concrete transports (UDP listener, TCP/TLS connection tables) live
//! outside the core; the manager only needs addressed delivery, a stream of
//! parsed inbound messages, and the reliability flag that decides which
//! retransmission timers get armed.

pub mod udp;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::Message;

pub use udp::UdpTransport;

/// Addressed message delivery plus an inbound stream of parsed messages.
///
/// Addresses are `host:port` strings. Implementations must be cheap to share
/// behind an `Arc` and safe to call from many tasks at once.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Begin receiving on `addr`.
    async fn listen(&self, addr: &str) -> Result<()>;

    /// Send `msg` to `addr`. A failure here feeds the owning transaction's
    /// `transport_err` input.
    async fn send(&self, addr: &str, msg: Message) -> Result<()>;

    /// Shut the transport down. Idempotent; the inbound stream closes and
    /// subsequent sends fail.
    async fn stop(&self);

    /// Whether delivery and ordering are guaranteed (TCP/TLS). On reliable
    /// transports timer A never runs and the linger timers collapse to zero.
    fn is_reliable(&self) -> bool;

    /// The inbound message stream. Yields `Some` exactly once; the
    /// transaction manager takes it at construction.
    fn take_incoming(&self) -> Option<mpsc::Receiver<Message>>;
}
