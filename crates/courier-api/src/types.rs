use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header field carrying the caller-supplied correlation id of an outgoing
/// message. The durable history store matches delivery status updates against
/// the same key.
pub const EVENT_ID_KEY: &str = "x-commhistory-event-id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum ChannelState {
    Null,
    PendingRequest,
    Requested,
    PendingReady,
    Ready,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum ChannelEvent {
    StateChanged { state: ChannelState },
    SendingSucceeded { event_id: i64 },
    SendingFailed { event_id: i64 },
    RequestSucceeded,
    RequestFailed { name: String, message: String },
    SequenceChanged { sequence: u64 },
}

/// One part of an outgoing or inbound message: a free-form field map. A text
/// message is a header part (correlation id) followed by a body part with
/// `content-type` and `content`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessagePart {
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl MessagePart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(|v| v.as_i64())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundMessage {
    pub handle: u64,
    pub parts: Vec<MessagePart>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferCounters {
    pub version: u32,
    pub bytes_sent: u64,
    pub bytes_to_send: u64,
    pub bytes_received: u64,
    pub bytes_to_receive: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum TransferEvent {
    PathChanged { path: String },
    InboundChanged { inbound: bool },
    ValidChanged { valid: bool },
    RunningChanged { running: bool },
    ProgressChanged { progress: f64 },
}
