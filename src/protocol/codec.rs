//! Text-frame encoder/decoder for the two-layer digit framing.
//!
//! ```text
//! 0{"sid":...}          open header
//! 2probe / 3probe       ping / pong, optional payload
//! 42["msg","hi"]        MESSAGE + EVENT on the default namespace
//! 42/chat,7["msg","hi"] MESSAGE + EVENT, namespace /chat, ack id 7
//! 43/chat,7["ok",1]     MESSAGE + ACK answering it
//! ```

use serde_json::Value;

use super::{
    binary, Decoded, DecodeError, Frame, Message, MessageKind, OpenHeader, CLOSE_FRAME,
    DEFAULT_NSP, MESSAGE_FRAME, OPEN_FRAME, PING_FRAME, PONG_FRAME, UPGRADE_FRAME,
};

/// Decode one transport frame. Binary frames carry MessagePack packet
/// records; text frames use the digit framing.
pub fn decode(frame: &Frame) -> Result<Decoded, DecodeError> {
    match frame {
        Frame::Close => Ok(Decoded::Close),
        Frame::Binary(bytes) => Ok(Decoded::Message(binary::decode_record(bytes)?)),
        Frame::Text(text) => decode_text(text),
    }
}

fn decode_text(text: &str) -> Result<Decoded, DecodeError> {
    let mut chars = text.chars();
    let prefix = chars.next().ok_or(DecodeError::Empty)?;
    let rest = &text[prefix.len_utf8()..];

    match prefix {
        OPEN_FRAME => Ok(Decoded::Open(rest.to_string())),
        CLOSE_FRAME => Ok(Decoded::Close),
        PING_FRAME => Ok(Decoded::Ping(rest.to_string())),
        PONG_FRAME => Ok(Decoded::Pong(rest.to_string())),
        UPGRADE_FRAME => Ok(Decoded::Upgrade),
        MESSAGE_FRAME => Ok(Decoded::Message(decode_message(rest)?)),
        other => Err(DecodeError::BadPrefix(other)),
    }
}

/// Decode the inner message after the MESSAGE digit has been consumed.
pub fn decode_message(body: &str) -> Result<Message, DecodeError> {
    let kind_digit = body.chars().next().ok_or(DecodeError::Empty)?;
    let kind = MessageKind::from_digit(kind_digit).ok_or(DecodeError::BadKind(kind_digit))?;
    let mut rest = &body[1..];

    // Namespace, terminated by `,`. A bare trailing namespace (no comma) is
    // accepted for payload-less CONNECT/DISCONNECT.
    let nsp = if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => {
                let nsp = rest[..idx].to_string();
                rest = &rest[idx + 1..];
                nsp
            }
            None => {
                let nsp = rest.to_string();
                rest = "";
                nsp
            }
        }
    } else {
        DEFAULT_NSP.to_string()
    };

    // Ack id: a run of decimal digits before the payload.
    let digits_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let ack_id = if digits_len > 0 {
        let id = rest[..digits_len]
            .parse::<u64>()
            .map_err(|_| DecodeError::BadAckId)?;
        rest = &rest[digits_len..];
        Some(id)
    } else {
        None
    };

    let payload: Option<Value> = if rest.is_empty() {
        None
    } else {
        Some(serde_json::from_str(rest)?)
    };

    let (method, args) = match kind {
        MessageKind::Event | MessageKind::BinaryEvent => {
            let Some(Value::Array(mut items)) = payload else {
                return Err(DecodeError::BadPayload);
            };
            if items.is_empty() {
                return Err(DecodeError::BadPayload);
            }
            let Value::String(method) = items.remove(0) else {
                return Err(DecodeError::BadPayload);
            };
            (Some(method), items)
        }
        MessageKind::Ack | MessageKind::BinaryAck => match payload {
            Some(Value::Array(items)) => (None, items),
            Some(_) => return Err(DecodeError::BadPayload),
            None => (None, Vec::new()),
        },
        MessageKind::Connect | MessageKind::ConnectError => {
            (None, payload.into_iter().collect())
        }
        MessageKind::Disconnect => (None, Vec::new()),
    };

    Ok(Message {
        kind,
        nsp,
        method,
        args,
        ack_id,
    })
}

/// Encode a message into one text frame.
pub fn encode_message(msg: &Message) -> Result<String, DecodeError> {
    let payload = match msg.kind {
        MessageKind::Event | MessageKind::BinaryEvent => {
            let method = msg.method.as_ref().ok_or(DecodeError::BadPayload)?;
            let mut items = Vec::with_capacity(msg.args.len() + 1);
            items.push(Value::String(method.clone()));
            items.extend(msg.args.iter().cloned());
            Some(serde_json::to_string(&Value::Array(items))?)
        }
        MessageKind::Ack | MessageKind::BinaryAck => {
            Some(serde_json::to_string(&Value::Array(msg.args.clone()))?)
        }
        MessageKind::Connect | MessageKind::ConnectError => match msg.args.first() {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        },
        MessageKind::Disconnect => None,
    };

    let mut out = String::new();
    out.push(MESSAGE_FRAME);
    out.push(msg.kind.digit());
    if msg.nsp != DEFAULT_NSP {
        out.push_str(&msg.nsp);
        if msg.ack_id.is_some() || payload.is_some() {
            out.push(',');
        }
    }
    if let Some(id) = msg.ack_id {
        out.push_str(&id.to_string());
    }
    if let Some(payload) = payload {
        out.push_str(&payload);
    }
    Ok(out)
}

/// The handshake header frame, `0{json}`.
pub fn encode_open(header: &OpenHeader) -> Result<String, DecodeError> {
    Ok(format!("{OPEN_FRAME}{}", serde_json::to_string(header)?))
}

pub fn encode_ping(data: &str) -> String {
    format!("{PING_FRAME}{data}")
}

pub fn encode_pong(data: &str) -> String {
    format!("{PONG_FRAME}{data}")
}

pub fn encode_close() -> String {
    CLOSE_FRAME.to_string()
}
