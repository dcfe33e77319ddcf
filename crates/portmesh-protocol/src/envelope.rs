//! The wire-level message record exchanged between ports.
//!
//! On the wire an envelope travels wrapped under a single marker key:
//!
//! ```text
//! { "@portmesh": { "type": "message", "eventId": "message-…", "payload": …, … } }
//! ```
//!
//! Anything that does not decode into that exact shape is treated as a plain
//! payload and passes through unmodified, so user data that happens to use a
//! reserved field name is never mistaken for protocol metadata.

use crate::ids::{EventId, PortId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key wrapping an encoded envelope.
pub const WIRE_MARKER: &str = "@portmesh";
/// Default event type.
pub const MESSAGE_TYPE: &str = "message";
/// Suffix appended to an event id to form its replication stream type.
pub const MUTATE_SUFFIX: &str = ".mutate";
/// Handshake open ping.
pub const CONNECT_PING: &str = "@connect";
/// Handshake close ping.
pub const DISCONNECT_PING: &str = "@disconnect";
/// Lifecycle notification types. Delivered to listeners only.
pub const OPEN_EVENT: &str = "open";
pub const CLOSE_EVENT: &str = "close";
pub const ERROR_EVENT: &str = "error";
/// Participant identity a server announces in its pings.
pub const SERVER_IDENTITY: &str = "server";
/// Most sub-channels one envelope may carry.
pub const MAX_SUB_CHANNELS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub event_id: EventId,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub live: bool,
    /// Receivers stop applying replication batches after one flagged done.
    #[serde(default)]
    pub honour_done: bool,
    #[serde(default)]
    pub bubbles: bool,
    #[serde(default)]
    pub forwarded: bool,
    /// Informational back-reference to the port that relayed this envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relayed_from: Option<PortId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_channel_count: Option<usize>,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, event_id: EventId, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_id,
            payload,
            live: false,
            honour_done: false,
            bubbles: false,
            forwarded: false,
            relayed_from: None,
            sub_channel_count: None,
        }
    }

    /// Envelope for a raw value that arrived without protocol metadata.
    pub fn plain(payload: Value) -> Self {
        Self::new(MESSAGE_TYPE, EventId::for_type(MESSAGE_TYPE), payload)
    }

    pub fn is_control(&self) -> bool {
        self.event_type == CONNECT_PING || self.event_type == DISCONNECT_PING
    }

    /// Wrap under [`WIRE_MARKER`].
    pub fn encode(&self) -> Result<Value, serde_json::Error> {
        let mut wire = Map::new();
        wire.insert(WIRE_MARKER.to_owned(), serde_json::to_value(self)?);
        Ok(Value::Object(wire))
    }

    /// Decode a wire value, falling back to a plain envelope when the value
    /// is not exactly one marker-wrapped envelope.
    pub fn decode(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.len() == 1 && map.contains_key(WIRE_MARKER) => {
                let inner = map.remove(WIRE_MARKER).unwrap_or(Value::Null);
                match serde_json::from_value::<Envelope>(inner.clone()) {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        map.insert(WIRE_MARKER.to_owned(), inner);
                        Self::plain(Value::Object(map))
                    }
                }
            }
            other => Self::plain(other),
        }
    }

    /// True when `value` carries a marker-wrapped envelope.
    pub fn is_wire_shaped(value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|map| map.len() == 1 && map.contains_key(WIRE_MARKER))
    }

    pub fn is_structured(&self) -> bool {
        self.payload.is_object() || self.payload.is_array()
    }
}

/// Payload of [`CONNECT_PING`] and [`DISCONNECT_PING`] envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlPing {
    /// Participant identity in client/server broadcast mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ControlPing {
    pub fn from_payload(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
