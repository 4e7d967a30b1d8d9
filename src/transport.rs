//! Transport adaptor: negotiated connection parameters and the frame-level
//! connection contract the session engine consumes.
//!
//! The engine never touches the WebSocket directly. It reads and writes
//! [`Frame`]s through boxed trait objects, so tests (and alternative
//! transports) can supply their own implementations.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use crate::config::{DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT};
use crate::error::Error;
use crate::protocol::{Frame, ProtocolVersion};

/// What the transport negotiated for a connection: wire revision, framing
/// mode, and the liveness parameters advertised in the open header.
#[derive(Debug, Clone)]
pub struct Transport {
    pub protocol: ProtocolVersion,
    /// Binary framing: CONNECT (and any structured packet) goes out as a
    /// MessagePack record instead of the digit-framed text form.
    pub binary: bool,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Transport {
    pub fn v3() -> Self {
        Self {
            protocol: ProtocolVersion::V3,
            binary: false,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn v4() -> Self {
        Self {
            protocol: ProtocolVersion::V4,
            ..Self::v3()
        }
    }

    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn ping_params(&self) -> (Duration, Duration) {
        (self.ping_interval, self.ping_timeout)
    }
}

/// Read half of a frame connection. `Ok(None)` means the peer ended the
/// stream.
#[async_trait]
pub trait FrameRead: Send {
    async fn read_frame(&mut self) -> Result<Option<Frame>, Error>;
}

/// Write half of a frame connection.
#[async_trait]
pub trait FrameWrite: Send {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), Error>;
    /// Best-effort transport-level close.
    async fn close(&mut self);
}

pub type BoxFrameRead = Box<dyn FrameRead>;
pub type BoxFrameWrite = Box<dyn FrameWrite>;

/// Split an upgraded WebSocket into the two frame halves.
pub(crate) fn split_socket(socket: WebSocket) -> (BoxFrameRead, BoxFrameWrite) {
    let (sink, stream) = socket.split();
    (
        Box::new(WsFrameRead { inner: stream }),
        Box::new(WsFrameWrite { inner: sink }),
    )
}

struct WsFrameRead {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameRead for WsFrameRead {
    async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(Error::Read(e.to_string())),
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(Frame::Text(text))),
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(Some(Frame::Binary(bytes))),
                Some(Ok(WsMessage::Close(_))) => return Ok(Some(Frame::Close)),
                // WebSocket-level ping/pong is transport noise; liveness
                // runs on protocol frames.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            }
        }
    }
}

struct WsFrameWrite {
    inner: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl FrameWrite for WsFrameWrite {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let msg = match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(bytes) => WsMessage::Binary(bytes),
            Frame::Close => WsMessage::Close(None),
        };
        self.inner
            .send(msg)
            .await
            .map_err(|e| Error::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(WsMessage::Close(None)).await;
        let _ = self.inner.close().await;
    }
}
