use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::{
    dto::{
        session::SessionSnapshotResponse,
        sse::SessionUpdateEvent,
        validation::validate_user_id,
    },
    services::live_session::{LiveCommand, LiveUpdate},
};

/// Reasons an inbound participant frame is refused.
#[derive(Debug, Error)]
pub enum InboundMessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid user id: {0}")]
    InvalidUserId(validator::ValidationError),
}

#[derive(Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
/// Messages accepted from participant WebSocket clients.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParticipantInboundMessage {
    /// Must be the first frame of a connection.
    Identification { user_id: String },
    AddRep,
    EndTurn,
    #[serde(other)]
    Unknown,
}

impl ParticipantInboundMessage {
    /// Parse a text frame and validate the identity it may carry.
    pub fn from_json_str(text: &str) -> Result<Self, InboundMessageError> {
        let message: Self = serde_json::from_str(text)?;
        if let Self::Identification { user_id } = &message {
            validate_user_id(user_id).map_err(InboundMessageError::InvalidUserId)?;
        }
        Ok(message)
    }

    /// Agent command carried by this frame, if any.
    pub fn command(&self) -> Option<LiveCommand> {
        match self {
            Self::AddRep => Some(LiveCommand::AddRep),
            Self::EndTurn => Some(LiveCommand::EndTurn),
            Self::Identification { .. } | Self::Unknown => None,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Messages sent to participant WebSocket clients.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParticipantOutboundMessage {
    /// Full session state, sent right after identification.
    Snapshot { snapshot: SessionSnapshotResponse },
    /// A change of the session.
    Update { update: SessionUpdateEvent },
    /// Local countdown of the running turn.
    Countdown { turn: CountdownView },
    /// A command could not be carried out.
    Error { message: String },
}

#[derive(Debug, Serialize, ToSchema)]
/// Presentation clock of the running turn.
pub struct CountdownView {
    pub current_player: String,
    pub turn_index: u64,
    pub remaining_ms: u64,
}

impl From<LiveUpdate> for ParticipantOutboundMessage {
    fn from(update: LiveUpdate) -> Self {
        match update {
            LiveUpdate::Snapshot(snapshot) => Self::Snapshot {
                snapshot: snapshot.into(),
            },
            LiveUpdate::Session(update) => Self::Update {
                update: update.into(),
            },
            LiveUpdate::Countdown(countdown) => Self::Countdown {
                turn: CountdownView {
                    current_player: countdown.current_player,
                    turn_index: countdown.turn_index,
                    remaining_ms: u64::try_from(countdown.remaining.as_millis())
                        .unwrap_or(u64::MAX),
                },
            },
            LiveUpdate::Rejected(message) => Self::Error { message },
        }
    }
}
