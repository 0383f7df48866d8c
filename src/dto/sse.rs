use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dto::session::{MemberSummary, ProgressSummary, SessionSummary, TurnSummary},
    state::session_view::SessionUpdate,
};

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    pub event: Option<String>,
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    pub session_id: Uuid,
    /// Human-readable message confirming the subscription.
    pub message: String,
    /// Whether the backend is running without a storage backend connection.
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the backend enters or leaves degraded mode.
pub struct SystemStatus {
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
/// One session change, shaped `{"type": ..., "data": ...}`.
pub enum SessionUpdateEvent {
    Member(MemberSummary),
    Status(SessionSummary),
    Progress(ProgressSummary),
    Turn(TurnSummary),
}

impl SessionUpdateEvent {
    /// SSE event name for this update.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Member(_) => "member",
            Self::Status(_) => "status",
            Self::Progress(_) => "progress",
            Self::Turn(_) => "turn",
        }
    }
}

impl From<SessionUpdate> for SessionUpdateEvent {
    fn from(update: SessionUpdate) -> Self {
        match update {
            SessionUpdate::Member(member) => Self::Member(member.into()),
            SessionUpdate::Status(session) => Self::Status(session.into()),
            SessionUpdate::Progress(progress) => Self::Progress(progress.into()),
            SessionUpdate::Turn(turn) => Self::Turn(turn.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::dao::models::ProgressEntity;

    #[test]
    fn updates_are_tagged_with_type_and_data() {
        let event = SessionUpdateEvent::from(SessionUpdate::Progress(ProgressEntity {
            session_id: Uuid::new_v4(),
            user_id: "alice".into(),
            reps: 7,
            completed: false,
            updated_at: SystemTime::now(),
        }));

        assert_eq!(event.name(), "progress");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["data"]["user_id"], "alice");
        assert_eq!(json["data"]["reps"], 7);
    }
}
