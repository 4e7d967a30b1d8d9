//! MessagePack packet records for binary transports.
//!
//! On a v4 binary transport the digit framing is replaced by a structured
//! record `{type, data, nsp, id}` serialized as MessagePack and carried in a
//! binary frame. `id` is 0 when no ack is requested; real ack ids start
//! at 1.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DecodeError, Message, MessageKind, DEFAULT_NSP};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PacketRecord {
    #[serde(rename = "type")]
    pub kind: u8,
    pub data: Value,
    pub nsp: String,
    pub id: u64,
}

/// Serialize a message as a MessagePack packet record.
pub fn encode_record(msg: &Message) -> Result<Vec<u8>, DecodeError> {
    let data = match msg.kind {
        MessageKind::Event | MessageKind::BinaryEvent => {
            let method = msg.method.as_ref().ok_or(DecodeError::BadPayload)?;
            let mut items = Vec::with_capacity(msg.args.len() + 1);
            items.push(Value::String(method.clone()));
            items.extend(msg.args.iter().cloned());
            Value::Array(items)
        }
        MessageKind::Ack | MessageKind::BinaryAck => Value::Array(msg.args.clone()),
        MessageKind::Connect | MessageKind::ConnectError => {
            msg.args.first().cloned().unwrap_or(Value::Null)
        }
        MessageKind::Disconnect => Value::Null,
    };
    let record = PacketRecord {
        kind: msg.kind as u8,
        data,
        nsp: msg.nsp.clone(),
        id: msg.ack_id.unwrap_or(0),
    };
    Ok(rmp_serde::to_vec_named(&record)?)
}

/// Deserialize a MessagePack packet record back into a message.
pub fn decode_record(bytes: &[u8]) -> Result<Message, DecodeError> {
    let record: PacketRecord = rmp_serde::from_slice(bytes)?;
    let kind = MessageKind::from_index(record.kind)
        .ok_or(DecodeError::BadKind(char::from_digit(record.kind.min(9) as u32, 10).unwrap_or('?')))?;

    let nsp = if record.nsp.is_empty() {
        DEFAULT_NSP.to_string()
    } else {
        record.nsp
    };
    let ack_id = (record.id != 0).then_some(record.id);

    let (method, args) = match kind {
        MessageKind::Event | MessageKind::BinaryEvent => {
            let Value::Array(mut items) = record.data else {
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
        MessageKind::Ack | MessageKind::BinaryAck => match record.data {
            Value::Array(items) => (None, items),
            Value::Null => (None, Vec::new()),
            _ => return Err(DecodeError::BadPayload),
        },
        MessageKind::Connect | MessageKind::ConnectError => match record.data {
            Value::Null => (None, Vec::new()),
            value => (None, vec![value]),
        },
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
