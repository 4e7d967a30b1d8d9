//! Crate-wide error type.
//!
//! Decode and handler failures are recovered locally (frame dropped, error
//! pseudo-event). Transport failures and liveness expiries are fatal to the
//! channel but never to the server.

use thiserror::Error;

use crate::protocol::DecodeError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    /// A user callback failed; routed to the `error` pseudo-event.
    #[error("handler failed: {0}")]
    Handler(String),

    /// An ACK reply arrived with no parked waiter for its id.
    #[error("no waiter parked for ack id {0}")]
    WaiterNotFound(u64),

    /// `emit_ack` deadline expired before the reply arrived.
    #[error("acknowledgement timed out")]
    AckTimeout,

    /// Lookup of an unknown session id.
    #[error("connection not found")]
    ConnectionNotFound,

    /// Channel operation performed on a detached channel.
    #[error("server not set")]
    ServerNotSet,

    /// The channel closed underneath the caller.
    #[error("channel closed")]
    Closed,

    #[error("transport write failed: {0}")]
    Write(String),

    #[error("transport read failed: {0}")]
    Read(String),
}
