//! Maps raw inbound frames onto the closed set of simulation events.

use crate::protocol::{
    parse_timestamp, AgentSpawnPayload, ContainmentTriggerPayload, ForkDetectedPayload,
    HeartbeatPayload, InboundEnvelope, LayerCompletePayload, MemoryPatchPayload, ProtocolError,
    StatusUpdatePayload, TraceUpdatePayload,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    StatusUpdate,
    LayerComplete,
    TraceUpdate,
    AgentSpawn,
    MemoryPatch,
    ForkDetected,
    ContainmentTrigger,
    Heartbeat,
    Message,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::StatusUpdate,
        EventKind::LayerComplete,
        EventKind::TraceUpdate,
        EventKind::AgentSpawn,
        EventKind::MemoryPatch,
        EventKind::ForkDetected,
        EventKind::ContainmentTrigger,
        EventKind::Heartbeat,
        EventKind::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StatusUpdate => "status_update",
            EventKind::LayerComplete => "layer_complete",
            EventKind::TraceUpdate => "trace_update",
            EventKind::AgentSpawn => "agent_spawn",
            EventKind::MemoryPatch => "memory_patch",
            EventKind::ForkDetected => "fork_detected",
            EventKind::ContainmentTrigger => "containment_trigger",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Message => "message",
        }
    }

    fn from_discriminator(raw: &str) -> Self {
        match raw {
            "status_update" => EventKind::StatusUpdate,
            "layer_complete" => EventKind::LayerComplete,
            "trace_update" => EventKind::TraceUpdate,
            "agent_spawn" => EventKind::AgentSpawn,
            "memory_patch" => EventKind::MemoryPatch,
            "fork_detected" => EventKind::ForkDetected,
            "containment_trigger" => EventKind::ContainmentTrigger,
            "heartbeat" => EventKind::Heartbeat,
            _ => EventKind::Message,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    StatusUpdate(StatusUpdatePayload),
    LayerComplete(LayerCompletePayload),
    TraceUpdate(TraceUpdatePayload),
    AgentSpawn(AgentSpawnPayload),
    MemoryPatch(MemoryPatchPayload),
    ForkDetected(ForkDetectedPayload),
    ContainmentTrigger(ContainmentTriggerPayload),
    Heartbeat(HeartbeatPayload),
    /// Discriminators this client does not know yet; kept for forward compatibility.
    Message { kind: String, data: Value },
}

impl SimEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SimEvent::StatusUpdate(_) => EventKind::StatusUpdate,
            SimEvent::LayerComplete(_) => EventKind::LayerComplete,
            SimEvent::TraceUpdate(_) => EventKind::TraceUpdate,
            SimEvent::AgentSpawn(_) => EventKind::AgentSpawn,
            SimEvent::MemoryPatch(_) => EventKind::MemoryPatch,
            SimEvent::ForkDetected(_) => EventKind::ForkDetected,
            SimEvent::ContainmentTrigger(_) => EventKind::ContainmentTrigger,
            SimEvent::Heartbeat(_) => EventKind::Heartbeat,
            SimEvent::Message { .. } => EventKind::Message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event: SimEvent,
    /// Frame timestamp when the server sent one, otherwise the arrival time.
    pub at: DateTime<Utc>,
}

impl NormalizedEvent {
    pub fn new(event: SimEvent, at: DateTime<Utc>) -> Self {
        Self { event, at }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

pub fn normalize(value: &Value, received_at: DateTime<Utc>) -> Result<NormalizedEvent, ProtocolError> {
    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    if !matches!(object.get("type"), Some(Value::String(_))) {
        return Err(ProtocolError::MissingType);
    }
    let envelope: InboundEnvelope =
        serde_json::from_value(value.clone()).map_err(|err| ProtocolError::InvalidPayload {
            kind: "envelope",
            reason: err.to_string(),
        })?;
    let at = envelope
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);
    let kind = EventKind::from_discriminator(&envelope.kind);
    let data = match envelope.data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    let event = match kind {
        EventKind::StatusUpdate => SimEvent::StatusUpdate(decode(kind, data)?),
        EventKind::LayerComplete => SimEvent::LayerComplete(decode(kind, data)?),
        EventKind::TraceUpdate => SimEvent::TraceUpdate(decode(kind, data)?),
        EventKind::AgentSpawn => SimEvent::AgentSpawn(decode(kind, data)?),
        EventKind::MemoryPatch => SimEvent::MemoryPatch(decode(kind, data)?),
        EventKind::ForkDetected => SimEvent::ForkDetected(decode(kind, data)?),
        EventKind::ContainmentTrigger => SimEvent::ContainmentTrigger(decode(kind, data)?),
        EventKind::Heartbeat => SimEvent::Heartbeat(decode(kind, data)?),
        EventKind::Message => SimEvent::Message {
            kind: envelope.kind,
            data,
        },
    };
    Ok(NormalizedEvent::new(event, at))
}

/// Parses a text frame and normalizes it; malformed input is logged and yields nothing.
pub fn normalize_text(text: &str, received_at: DateTime<Utc>) -> Option<NormalizedEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!("inbound_malformed_json: {err}");
            return None;
        }
    };
    match normalize(&value, received_at) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!("inbound_malformed_frame: {err}");
            None
        }
    }
}

fn decode<T: DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|err| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        reason: err.to_string(),
    })
}
