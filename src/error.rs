use std::io;

use thiserror::Error;

use crate::transaction::TransactionKey;

/// A type alias for handling `Result`s with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the transaction layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A message was missing a header required for correlation
    /// (Via, CSeq, Call-ID, From tag).
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The top Via branch was absent, empty, or not in RFC 3261 form.
    #[error("empty or malformed branch parameter: {0}")]
    MalformedBranch(String),

    /// The transport failed to deliver a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport has been stopped; no further sends are possible.
    #[error("transport closed")]
    TransportClosed,

    /// A transaction expired without receiving a final response or ACK
    /// (timer B on the client side, timer H on the server side).
    #[error("transaction {0} timed out")]
    Timeout(TransactionKey),

    /// The peer end of an internal channel was dropped.
    #[error("channel closed")]
    ChannelClosed,

    /// The transaction has already reached its terminal state.
    #[error("transaction terminated")]
    Terminated,

    /// A reserved part of the TU surface that is not implemented yet.
    #[error("{0} is not supported")]
    NotSupported(&'static str),

    /// I/O error from the transport adapter.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
