use crate::model::{Confidence, Mode, SessionStatus, StageNumber, StageStatus, TraceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const NORMAL_CLOSE_CODE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no type discriminator")]
    MissingType,
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
    #[error("frame encode failed: {0}")]
    Encode(String),
}

/// Raw inbound frame before its `data` body is decoded against the discriminator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_status: Option<StageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contained: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agents: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_plugins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub reset: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerCompletePayload {
    pub stage: StageNumber,
    pub confidence: Confidence,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub forked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub stage: StageNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    #[serde(default)]
    pub message: String,
    pub event_type: TraceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSpawnPayload {
    pub stage: StageNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryPatchPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageNumber>,
    #[serde(default)]
    pub patch: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_plugins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForkDetectedPayload {
    pub stage: StageNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainmentTriggerPayload {
    #[serde(default = "last_stage")]
    pub stage: StageNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<String>,
}

fn last_stage() -> StageNumber {
    StageNumber::LAST
}

/// Client-issued frames. Every variant is wrapped in an [`OutboundEnvelope`] on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    HeartbeatResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_time: Option<String>,
    },
    Step {
        target_stage: StageNumber,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ModeChange {
        mode: Mode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Pause {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Resume {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ContainmentTrigger {
        target_stage: StageNumber,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Escalate {
        target_stage: StageNumber,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Reset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Ping => "ping",
            ControlMessage::HeartbeatResponse { .. } => "heartbeat_response",
            ControlMessage::Step { .. } => "step",
            ControlMessage::ModeChange { .. } => "mode_change",
            ControlMessage::Pause { .. } => "pause",
            ControlMessage::Resume { .. } => "resume",
            ControlMessage::ContainmentTrigger { .. } => "containment_trigger",
            ControlMessage::Escalate { .. } => "escalate",
            ControlMessage::Reset { .. } => "reset",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEnvelope {
    pub session_id: String,
    pub client_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: ControlMessage,
}

impl OutboundEnvelope {
    pub fn new(session_id: &str, client_id: &str, msg: ControlMessage) -> Self {
        Self {
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            msg,
        }
    }
}

pub fn encode_control(
    session_id: &str,
    client_id: &str,
    msg: ControlMessage,
) -> Result<String, ProtocolError> {
    let envelope = OutboundEnvelope::new(session_id, client_id, msg);
    serde_json::to_string(&envelope).map_err(|err| ProtocolError::Encode(err.to_string()))
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(value: u8) -> StageNumber {
        StageNumber::new(value).expect("valid stage")
    }

    #[test]
    fn control_frames_carry_session_and_flat_type() {
        let frame = encode_control(
            "sim-1",
            "client-a",
            ControlMessage::Step {
                target_stage: stage(4),
                reason: Some("operator".to_string()),
            },
        )
        .expect("encode");
        let value: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "step");
        assert_eq!(value["session_id"], "sim-1");
        assert_eq!(value["client_id"], "client-a");
        assert_eq!(value["target_stage"], 4);
        assert_eq!(value["reason"], "operator");

        let decoded: OutboundEnvelope = serde_json::from_str(&frame).expect("decode");
        assert_eq!(
            decoded.msg,
            ControlMessage::Step {
                target_stage: stage(4),
                reason: Some("operator".to_string()),
            }
        );
    }

    #[test]
    fn ping_frame_has_no_payload_fields() {
        let frame = encode_control("sim-1", "client-a", ControlMessage::Ping).expect("encode");
        let value: Value = serde_json::from_str(&frame).expect("json");
        let object = value.as_object().expect("object");
        assert_eq!(object["type"], "ping");
        assert!(!object.contains_key("reason"));
        assert_eq!(ControlMessage::Ping.kind(), "ping");
    }

    #[test]
    fn containment_payload_defaults_to_final_stage() {
        let payload: ContainmentTriggerPayload =
            serde_json::from_value(serde_json::json!({"reason": "policy"})).expect("payload");
        assert_eq!(payload.stage, StageNumber::LAST);
    }

    #[test]
    fn envelope_tolerates_missing_data() {
        let envelope: InboundEnvelope =
            serde_json::from_str(r#"{"type":"heartbeat"}"#).expect("envelope");
        assert_eq!(envelope.kind, "heartbeat");
        assert!(envelope.data.is_null());
        assert!(envelope.timestamp.is_none());
    }
}
