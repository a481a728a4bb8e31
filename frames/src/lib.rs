//! Push-channel frame model and codecs.
//!
//! The storefront server pushes conversation events over a websocket. Each
//! event is a [`Frame`]: an envelope with routing metadata plus a free-form
//! JSON `data` payload. Binary websocket messages carry the protobuf
//! encoding ([`encode_frame`] / [`decode_frame`]); text messages carry the
//! same envelope as JSON ([`encode_text_frame`] / [`decode_text_frame`]).

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event name for a newly stored conversation message.
pub const EVENT_MESSAGE_NEW: &str = "message:new";
/// Event name sent once the server has accepted the channel credential.
pub const EVENT_SESSION_CONNECTED: &str = "session:connected";

/// Error returned by the frame decoders.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `status` integer on the wire does not map to a known [`Status`] variant.
    #[error("invalid frame status: {0}")]
    InvalidStatus(i32),
    /// A text frame was not a valid JSON envelope.
    #[error("failed to decode text frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Position of a frame within an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Client-originated request.
    Request,
    /// Non-terminal streamed item.
    Item,
    /// Terminal success; unsolicited pushes also use this status.
    Done,
    /// Terminal failure.
    Error,
}

impl Status {
    /// True for statuses that carry a committed server record.
    #[must_use]
    pub fn is_delivery(self) -> bool {
        matches!(self, Self::Item | Self::Done)
    }

    fn as_wire(self) -> i32 {
        let wire = match self {
            Self::Request => WireStatus::Request,
            Self::Item => WireStatus::Item,
            Self::Done => WireStatus::Done,
            Self::Error => WireStatus::Error,
        };
        wire as i32
    }

    fn from_wire(value: i32) -> Result<Self, CodecError> {
        match WireStatus::try_from(value) {
            Ok(WireStatus::Request) => Ok(Self::Request),
            Ok(WireStatus::Item) => Ok(Self::Item),
            Ok(WireStatus::Done) => Ok(Self::Done),
            Ok(WireStatus::Error) => Ok(Self::Error),
            Err(_) => Err(CodecError::InvalidStatus(value)),
        }
    }
}

/// One event on the push channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unique frame identifier.
    pub id: String,
    /// Request this frame answers, if any.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Milliseconds since the Unix epoch when the server emitted the frame.
    pub ts: i64,
    /// Originating participant id, when the event has one.
    #[serde(default)]
    pub from: Option<String>,
    /// Addressed participant id, when the event has one.
    #[serde(default)]
    pub to: Option<String>,
    /// Namespaced event name, e.g. `"message:new"`.
    pub event: String,
    pub status: Status,
    /// Event payload.
    #[serde(default = "empty_object")]
    pub data: Value,
}

impl Frame {
    /// Build a terminal frame for `event` with the given payload.
    #[must_use]
    pub fn done(id: impl Into<String>, event: impl Into<String>, ts: i64, data: Value) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            ts,
            from: None,
            to: None,
            event: event.into(),
            status: Status::Done,
            data,
        }
    }

    /// True when this frame is a delivered `message:new` event.
    #[must_use]
    pub fn is_message_delivery(&self) -> bool {
        self.event == EVENT_MESSAGE_NEW && self.status.is_delivery()
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = WireFrame {
        id: frame.id.clone(),
        parent_id: frame.parent_id.clone(),
        ts: frame.ts,
        from: frame.from.clone(),
        to: frame.to.clone(),
        event: frame.event.clone(),
        status: frame.status.as_wire(),
        data: Some(to_proto(&frame.data)),
    };
    // A growable Vec never reports `BufferTooSmall`, the only encode error.
    wire.encode_to_vec()
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::InvalidStatus`] for out-of-range status values.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    Ok(Frame {
        id: wire.id,
        parent_id: wire.parent_id,
        ts: wire.ts,
        from: wire.from,
        to: wire.to,
        event: wire.event,
        status: Status::from_wire(wire.status)?,
        data: wire.data.as_ref().map_or_else(empty_object, from_proto),
    })
}

/// Encode a frame as a JSON text message.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the payload cannot be serialized.
pub fn encode_text_frame(frame: &Frame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a JSON text message into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Json`] when the text is not a frame envelope.
pub fn decode_text_frame(text: &str) -> Result<Frame, CodecError> {
    Ok(serde_json::from_str(text)?)
}

fn to_proto(value: &Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match value {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue as i32),
        Value::Bool(v) => Kind::BoolValue(*v),
        Value::Number(v) => Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => Kind::StringValue(v.clone()),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue { values: items.iter().map(to_proto).collect() }),
        Value::Object(fields) => Kind::StructValue(prost_types::Struct {
            fields: fields.iter().map(|(k, v)| (k.clone(), to_proto(v))).collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

fn from_proto(value: &prost_types::Value) -> Value {
    use prost_types::value::Kind;

    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(v)) => Value::Bool(*v),
        Some(Kind::NumberValue(v)) => number_value(*v),
        Some(Kind::StringValue(v)) => Value::String(v.clone()),
        Some(Kind::ListValue(list)) => Value::Array(list.values.iter().map(from_proto).collect()),
        Some(Kind::StructValue(s)) => Value::Object(s.fields.iter().map(|(k, v)| (k.clone(), from_proto(v))).collect()),
    }
}

/// Protobuf numbers are doubles; restore integers so ids and timestamps
/// survive the trip as JSON integers.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn number_value(v: f64) -> Value {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        return Value::from(v as i64);
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    parent_id: Option<String>,
    #[prost(int64, tag = "3")]
    ts: i64,
    #[prost(string, optional, tag = "4")]
    from: Option<String>,
    #[prost(string, optional, tag = "5")]
    to: Option<String>,
    #[prost(string, tag = "6")]
    event: String,
    #[prost(enumeration = "WireStatus", tag = "7")]
    status: i32,
    #[prost(message, optional, tag = "8")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireStatus {
    Request = 0,
    Done = 1,
    Error = 2,
    Item = 4,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
