//! Wire protocol for the real-time transport
//!
//! JSON frames with camelCase field names, matching the transport contract:
//!
//! ```text
//! client -> server   {"type":"subscribe","subscriptions":[...],"organizationId":...,"userId":...}
//! both directions    {"type":"ping"} / {"type":"pong"}
//! server -> client   {"type":<category>,"action":...,"data":...,"timestamp":...,"organizationId":...}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RealtimeError;
use crate::types::{EventKind, FieldEvent};

/// Event categories a client can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Attendance,
    Patrols,
    Alerts,
    System,
}

impl Category {
    /// All subscribable categories
    pub fn all() -> Vec<Category> {
        vec![
            Category::Attendance,
            Category::Patrols,
            Category::Alerts,
            Category::System,
        ]
    }

    /// The category a field event is published under
    pub fn for_event(kind: EventKind) -> Category {
        match kind {
            EventKind::CheckIn | EventKind::CheckOut => Category::Attendance,
            EventKind::CheckpointVisit => Category::Patrols,
            EventKind::Incident | EventKind::BackupRequest => Category::Alerts,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Attendance => write!(f, "attendance"),
            Category::Patrols => write!(f, "patrols"),
            Category::Alerts => write!(f, "alerts"),
            Category::System => write!(f, "system"),
        }
    }
}

/// Frames sent from the client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        subscriptions: Vec<Category>,
        organization_id: String,
        user_id: String,
    },
    Ping,
    Pong,
}

/// A server-confirmed event republished to dashboards
///
/// Created only from server-confirmed field events; never from unsynced
/// local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub category: Category,
    pub action: String,
    pub data: serde_json::Value,
    pub organization_id: String,
    /// Unix timestamp (milliseconds)
    pub timestamp: i64,
}

impl RealtimeMessage {
    /// Build the republish message for a server-confirmed event.
    ///
    /// Refuses events without a `server_id`: only confirmed state is
    /// fanned out.
    pub fn from_confirmed(
        event: &FieldEvent,
        organization_id: &str,
    ) -> Result<Self, RealtimeError> {
        let server_id = event
            .server_id
            .as_deref()
            .ok_or(RealtimeError::Unconfirmed(event.id))?;

        Ok(Self {
            category: Category::for_event(event.kind),
            action: event.kind.to_string(),
            data: json!({
                "serverId": server_id,
                "eventId": event.id.to_string(),
                "idempotencyKey": event.idempotency_key.to_string(),
                "actorId": event.actor_id,
                "capturedAt": event.captured_at_ms,
                "location": {
                    "lat": event.captured_location.lat,
                    "lon": event.captured_location.lon,
                    "accuracyMeters": event.captured_location.accuracy_meters,
                },
                "checkpointId": event.checkpoint_id.as_ref().map(|c| c.as_str()),
            }),
            organization_id: organization_id.to_string(),
            timestamp: crate::types::now_ms(),
        })
    }
}

/// Frames received from the server: heartbeat control or a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Control(ControlFrame),
    Message(RealtimeMessage),
}

/// Heartbeat frames, either direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Ping,
    Pong,
}

/// Encode a client frame as wire text
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, RealtimeError> {
    serde_json::to_string(frame).map_err(|e| RealtimeError::Protocol(e.to_string()))
}

/// Encode a message for the server-to-client direction (used by the
/// in-memory server endpoint and tests)
pub fn encode_message(message: &RealtimeMessage) -> Result<String, RealtimeError> {
    serde_json::to_string(message).map_err(|e| RealtimeError::Protocol(e.to_string()))
}

/// Decode a frame received from the server
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, RealtimeError> {
    serde_json::from_str(text).map_err(|e| RealtimeError::Protocol(e.to_string()))
}
