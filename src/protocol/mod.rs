//! Wire-format types: packet kinds, decoded messages, and the open header.
//!
//! The protocol is two layers of single-digit framing. The outer
//! (transport-level) digit selects OPEN/CLOSE/PING/PONG/MESSAGE/UPGRADE;
//! inside a MESSAGE, a second digit selects the message kind, followed by an
//! optional namespace, an optional ack id, and a JSON payload.

pub mod binary;
pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The default namespace.
pub const DEFAULT_NSP: &str = "/";

// Outer packet prefixes, one ASCII digit each.
pub const OPEN_FRAME: char = '0';
pub const CLOSE_FRAME: char = '1';
pub const PING_FRAME: char = '2';
pub const PONG_FRAME: char = '3';
pub const MESSAGE_FRAME: char = '4';
pub const UPGRADE_FRAME: char = '5';

/// Negotiated wire revision. v3 clients ping the server; in v4 the server
/// pings and the client answers with a pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3,
    V4,
}

/// Message kinds carried inside a MESSAGE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl MessageKind {
    pub fn from_digit(c: char) -> Option<Self> {
        Some(match c {
            '0' => Self::Connect,
            '1' => Self::Disconnect,
            '2' => Self::Event,
            '3' => Self::Ack,
            '4' => Self::ConnectError,
            '5' => Self::BinaryEvent,
            '6' => Self::BinaryAck,
            _ => return None,
        })
    }

    pub fn digit(self) -> char {
        (b'0' + self as u8) as char
    }

    pub fn from_index(idx: u8) -> Option<Self> {
        Some(match idx {
            0 => Self::Connect,
            1 => Self::Disconnect,
            2 => Self::Event,
            3 => Self::Ack,
            4 => Self::ConnectError,
            5 => Self::BinaryEvent,
            6 => Self::BinaryAck,
            _ => return None,
        })
    }
}

/// A decoded unit exchanged with the application layer.
///
/// `ack_id` is present exactly when the sender requests (EVENT) or answers
/// (ACK) a correlated reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub nsp: String,
    /// Event method name; EVENT/ACK only.
    pub method: Option<String>,
    /// Positional arguments, decoded JSON values.
    pub args: Vec<Value>,
    pub ack_id: Option<u64>,
}

impl Message {
    pub fn event(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::event_in(DEFAULT_NSP, method, args)
    }

    pub fn event_in(nsp: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            kind: MessageKind::Event,
            nsp: nsp.into(),
            method: Some(method.into()),
            args,
            ack_id: None,
        }
    }

    pub fn ack(nsp: impl Into<String>, ack_id: u64, args: Vec<Value>) -> Self {
        Self {
            kind: MessageKind::Ack,
            nsp: nsp.into(),
            method: None,
            args,
            ack_id: Some(ack_id),
        }
    }

    pub fn connect(nsp: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: MessageKind::Connect,
            nsp: nsp.into(),
            method: None,
            args: payload.into_iter().collect(),
            ack_id: None,
        }
    }

    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Disconnect,
            nsp: nsp.into(),
            method: None,
            args: Vec::new(),
            ack_id: None,
        }
    }

    pub fn with_ack_id(mut self, id: u64) -> Self {
        self.ack_id = Some(id);
        self
    }
}

/// The handshake header, sent once immediately after connection
/// establishment as `0{json}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenHeader {
    pub sid: String,
    /// Always empty in pure-WebSocket mode.
    pub upgrades: Vec<String>,
    #[serde(rename = "pingInterval")]
    pub ping_interval: u64,
    #[serde(rename = "pingTimeout")]
    pub ping_timeout: u64,
}

/// A frame as read from or written to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// What the decoder hands to the inbound pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Raw open-header JSON. Clients never send this; kept for symmetry.
    Open(String),
    Close,
    /// Ping with its payload (the upgrade-probe text, usually empty).
    Ping(String),
    Pong(String),
    Upgrade,
    Message(Message),
}

/// Typed decoding failure. Decode errors are local to one frame: the frame
/// is dropped and the channel stays alive.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown packet prefix {0:?}")]
    BadPrefix(char),
    #[error("unknown message kind {0:?}")]
    BadKind(char),
    #[error("malformed ack id")]
    BadAckId,
    #[error("payload does not match message kind")]
    BadPayload,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary record encode: {0}")]
    BinaryEncode(#[from] rmp_serde::encode::Error),
    #[error("binary record decode: {0}")]
    BinaryDecode(#[from] rmp_serde::decode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_digits_round_trip() {
        for kind in [
            MessageKind::Connect,
            MessageKind::Disconnect,
            MessageKind::Event,
            MessageKind::Ack,
            MessageKind::ConnectError,
            MessageKind::BinaryEvent,
            MessageKind::BinaryAck,
        ] {
            assert_eq!(MessageKind::from_digit(kind.digit()), Some(kind));
        }
        assert_eq!(MessageKind::from_digit('7'), None);
        assert_eq!(MessageKind::from_digit('x'), None);
    }

    #[test]
    fn open_header_field_names() {
        let hdr = OpenHeader {
            sid: "abc".into(),
            upgrades: vec![],
            ping_interval: 25000,
            ping_timeout: 20000,
        };
        let json = serde_json::to_string(&hdr).unwrap();
        assert_eq!(
            json,
            r#"{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#
        );
    }
}
