//! Phoenix Wire Protocol
//!
//! Single responsibility: Encode and decode channel messages in the two
//! serializer `2.0.0` wire formats. No I/O and no shared state.
//!
//! # Wire Format
//!
//! ## Text frames
//! ```text
//! [join_ref | null, ref, topic, event, payload]
//! ```
//! Refs are decimal strings. Replies carry `event = "phx_reply"` and a
//! payload of `{"status": "ok" | "error", "response": <any>}`.
//!
//! ## Binary frames
//! ```text
//! [kind:1][join_ref_len:1][ref_len:1][topic_len:1][event_len:1]
//! [join_ref][ref][topic][event][payload...]
//! ```
//! `kind` is 0 for push, 1 for reply, 2 for broadcast. Reply payloads are
//! `[status_len:1][status][json]`.
//!
//! ## Binary file payload
//! ```text
//! [meta_len:4 big-endian][meta json][raw file bytes]
//! ```

use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::{CourierError, Result};

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT_TOPIC: &str = "phoenix";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Upper bound for a framed binary file payload (metadata + content).
pub const MAX_BINARY_FILE_PAYLOAD: usize = 100 * 1024 * 1024;

const BINARY_HEADER_LEN: usize = 5;

/// Kind byte leading every binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Push = 0,
    Reply = 1,
    Broadcast = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = CourierError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Push),
            1 => Ok(Self::Reply),
            2 => Ok(Self::Broadcast),
            other => Err(CourierError::Codec(format!("unknown message kind {}", other))),
        }
    }
}

/// Message body, either structured JSON or raw bytes from a binary frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// JSON view of the payload; raw bytes have none.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Binary(_) => None,
        }
    }
}

/// A decoded wire message. Both encodings produce this shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub join_ref: Option<u64>,
    pub reference: Option<u64>,
    pub topic: String,
    pub event: String,
    pub payload: Payload,
    /// Reply status, present only on replies.
    pub status: Option<String>,
}

impl Message {
    pub fn is_reply(&self) -> bool {
        self.status.is_some()
    }
}

/// Encode a text frame.
///
/// A `join_ref` of `None` or `Some(0)` is written as `null`. A missing payload
/// is written as an empty object.
pub fn encode_text(
    join_ref: Option<u64>,
    reference: u64,
    topic: &str,
    event: &str,
    payload: Option<&Value>,
) -> String {
    let join_ref = match join_ref {
        Some(r) if r != 0 => Value::String(r.to_string()),
        _ => Value::Null,
    };
    let payload = payload
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    Value::Array(vec![
        join_ref,
        Value::String(reference.to_string()),
        Value::String(topic.to_string()),
        Value::String(event.to_string()),
        payload,
    ])
    .to_string()
}

/// Decode a text frame.
pub fn decode_text(data: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| CourierError::Codec(format!("invalid JSON frame: {}", e)))?;

    let Value::Array(mut parts) = value else {
        return Err(CourierError::Codec("text frame is not an array".into()));
    };
    if parts.len() != 5 {
        return Err(CourierError::Codec(format!(
            "text frame has {} elements, expected 5",
            parts.len()
        )));
    }

    let payload = parts.pop().unwrap_or(Value::Null);
    let event = take_string(parts.pop(), "event")?;
    let topic = take_string(parts.pop(), "topic")?;
    let reference = parse_ref(parts.pop())?;
    let join_ref = parse_ref(parts.pop())?;

    if event == PHX_REPLY {
        let Value::Object(mut reply) = payload else {
            return Err(CourierError::Codec("reply payload is not an object".into()));
        };
        let status = match reply.remove("status") {
            Some(Value::String(s)) => s,
            _ => return Err(CourierError::Codec("reply payload has no status".into())),
        };
        let response = reply.remove("response").unwrap_or(Value::Null);

        return Ok(Message {
            join_ref,
            reference,
            topic,
            event,
            payload: Payload::Json(response),
            status: Some(status),
        });
    }

    Ok(Message {
        join_ref,
        reference,
        topic,
        event,
        payload: Payload::Json(payload),
        status: None,
    })
}

/// Encode a binary frame. The payload is appended verbatim.
pub fn encode_binary(
    kind: MessageKind,
    join_ref: Option<u64>,
    reference: u64,
    topic: &str,
    event: &str,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let join_ref = join_ref.filter(|r| *r != 0).map(|r| r.to_string()).unwrap_or_default();
    let reference = reference.to_string();

    let fields = [
        ("join_ref", join_ref.as_bytes()),
        ("ref", reference.as_bytes()),
        ("topic", topic.as_bytes()),
        ("event", event.as_bytes()),
    ];

    let strings_len: usize = fields.iter().map(|(_, f)| f.len()).sum();
    let mut buf = Vec::with_capacity(BINARY_HEADER_LEN + strings_len + payload.len());
    buf.push(kind as u8);
    for (name, field) in &fields {
        let len = u8::try_from(field.len()).map_err(|_| {
            CourierError::Codec(format!("{} is {} bytes, max 255", name, field.len()))
        })?;
        buf.push(len);
    }
    for (_, field) in &fields {
        buf.extend_from_slice(field);
    }
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Decode a binary frame.
pub fn decode_binary(data: &[u8]) -> Result<Message> {
    if data.len() < BINARY_HEADER_LEN {
        return Err(CourierError::Codec(format!(
            "binary frame is {} bytes, shorter than its header",
            data.len()
        )));
    }

    let kind = MessageKind::try_from(data[0])?;
    let lens = [
        data[1] as usize,
        data[2] as usize,
        data[3] as usize,
        data[4] as usize,
    ];

    let mut offset = BINARY_HEADER_LEN;
    let mut fields = Vec::with_capacity(4);
    for len in lens {
        let end = offset + len;
        let bytes = data
            .get(offset..end)
            .ok_or_else(|| CourierError::Codec("binary frame truncated".into()))?;
        let field = std::str::from_utf8(bytes)
            .map_err(|_| CourierError::Codec("binary frame field is not UTF-8".into()))?;
        fields.push(field.to_string());
        offset = end;
    }

    let event = fields.pop().unwrap_or_default();
    let topic = fields.pop().unwrap_or_default();
    let reference = parse_ref_str(&fields.pop().unwrap_or_default())?;
    let join_ref = parse_ref_str(&fields.pop().unwrap_or_default())?;
    let body = &data[offset..];

    if kind == MessageKind::Reply {
        let (status, response) = decode_reply_payload(body)?;
        return Ok(Message {
            join_ref,
            reference,
            topic,
            event,
            payload: Payload::Json(response),
            status: Some(status),
        });
    }

    Ok(Message {
        join_ref,
        reference,
        topic,
        event,
        payload: Payload::Binary(body.to_vec()),
        status: None,
    })
}

/// Encode a reply body for a binary reply frame.
pub fn encode_reply_payload(status: &str, response: &Value) -> Result<Vec<u8>> {
    let status_len = u8::try_from(status.len())
        .map_err(|_| CourierError::Codec("reply status longer than 255 bytes".into()))?;
    let mut buf = vec![status_len];
    buf.extend_from_slice(status.as_bytes());
    if !response.is_null() {
        buf.extend_from_slice(&serde_json::to_vec(response)?);
    }
    Ok(buf)
}

fn decode_reply_payload(body: &[u8]) -> Result<(String, Value)> {
    let (&status_len, rest) = body
        .split_first()
        .ok_or_else(|| CourierError::Codec("binary reply has no status".into()))?;
    let status_len = status_len as usize;
    if rest.len() < status_len {
        return Err(CourierError::Codec("binary reply status truncated".into()));
    }
    let status = std::str::from_utf8(&rest[..status_len])
        .map_err(|_| CourierError::Codec("binary reply status is not UTF-8".into()))?
        .to_string();

    let json = &rest[status_len..];
    let response = if json.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(json)
            .map_err(|e| CourierError::Codec(format!("binary reply payload: {}", e)))?
    };

    Ok((status, response))
}

/// Frame a file for upload: length-prefixed JSON metadata followed by the
/// raw content.
pub fn encode_binary_file(metadata: &BTreeMap<String, String>, content: &[u8]) -> Result<Vec<u8>> {
    let meta = serde_json::to_vec(metadata)?;
    let meta_len = u32::try_from(meta.len())
        .map_err(|_| CourierError::Codec("file metadata exceeds 4 GiB".into()))?;

    let total = 4 + meta.len() + content.len();
    if total > MAX_BINARY_FILE_PAYLOAD {
        return Err(CourierError::Codec(format!(
            "file payload is {} bytes, limit is {}",
            total, MAX_BINARY_FILE_PAYLOAD
        )));
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&meta_len.to_be_bytes());
    buf.extend_from_slice(&meta);
    buf.extend_from_slice(content);
    Ok(buf)
}

/// Split a framed file payload back into metadata and content.
pub fn decode_binary_file(data: &[u8]) -> Result<(BTreeMap<String, String>, Vec<u8>)> {
    let prefix: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CourierError::Codec("file payload shorter than length prefix".into()))?;
    let meta_len = u32::from_be_bytes(prefix) as usize;

    let meta = data
        .get(4..4 + meta_len)
        .ok_or_else(|| CourierError::Codec("file metadata truncated".into()))?;
    let metadata = serde_json::from_slice(meta)
        .map_err(|e| CourierError::Codec(format!("file metadata: {}", e)))?;

    Ok((metadata, data[4 + meta_len..].to_vec()))
}

fn take_string(value: Option<Value>, field: &str) -> Result<String> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(CourierError::Codec(format!("{} is not a string", field))),
    }
}

fn parse_ref(value: Option<Value>) -> Result<Option<u64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_ref_str(&s),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| CourierError::Codec(format!("ref {} is not a u64", n))),
        Some(other) => Err(CourierError::Codec(format!("invalid ref {}", other))),
    }
}

fn parse_ref_str(s: &str) -> Result<Option<u64>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|_| CourierError::Codec(format!("ref {:?} is not a u64", s)))
}
