//! DTO definitions used by the session REST API, the SSE stream and the documentation layer.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{
        MemberEntity, ProgressEntity, SessionEntity, SessionStatus, TurnStateEntity, TurnStatus,
    },
    dto::{
        format_system_time,
        validation::{validate_room_code, validate_user_id},
    },
    services::room_service::ParticipantProfile,
    state::session_view::SessionSnapshot,
};

/// Session lifecycle status exposed to clients.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusDto {
    Waiting,
    Started,
    Ended,
}

impl From<SessionStatus> for SessionStatusDto {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Waiting => Self::Waiting,
            SessionStatus::Started => Self::Started,
            SessionStatus::Ended => Self::Ended,
        }
    }
}

/// Profile of the participant creating a room.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateSessionRequest {
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: String,
    #[validate(length(min = 1, max = 64))]
    pub display_name: String,
    #[validate(url)]
    pub avatar_url: Option<String>,
}

impl From<CreateSessionRequest> for ParticipantProfile {
    fn from(request: CreateSessionRequest) -> Self {
        Self {
            user_id: request.user_id,
            display_name: request.display_name,
            avatar_url: request.avatar_url,
        }
    }
}

/// Identifiers of a freshly created room.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub room_code: String,
}

/// Join request: room code plus the joining participant's profile.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct JoinSessionRequest {
    #[validate(custom(function = "validate_room_code"))]
    pub code: String,
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: String,
    #[validate(length(min = 1, max = 64))]
    pub display_name: String,
    #[validate(url)]
    pub avatar_url: Option<String>,
}

impl JoinSessionRequest {
    /// Split the request into the room code and the participant profile.
    pub fn into_parts(self) -> (String, ParticipantProfile) {
        (
            self.code,
            ParticipantProfile {
                user_id: self.user_id,
                display_name: self.display_name,
                avatar_url: self.avatar_url,
            },
        )
    }
}

/// Outcome of a successful join.
#[derive(Debug, Serialize, ToSchema)]
pub struct JoinSessionResponse {
    pub session_id: Uuid,
    pub status: SessionStatusDto,
}

/// Request to end a session, issued by one of its members.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct EndSessionRequest {
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: String,
}

/// Session row as exposed to clients.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub room_code: String,
    pub status: SessionStatusDto,
    /// RFC3339 timestamp.
    pub created_at: String,
    /// RFC3339 timestamp.
    pub updated_at: String,
}

impl From<SessionEntity> for SessionSummary {
    fn from(session: SessionEntity) -> Self {
        Self {
            id: session.id,
            room_code: session.room_code,
            status: session.status.into(),
            created_at: format_system_time(session.created_at),
            updated_at: format_system_time(session.updated_at),
        }
    }
}

/// Member of a session with its profile snapshot.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq, Eq)]
pub struct MemberSummary {
    pub user_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// RFC3339 timestamp.
    pub joined_at: String,
}

impl From<MemberEntity> for MemberSummary {
    fn from(member: MemberEntity) -> Self {
        Self {
            user_id: member.user_id,
            display_name: member.display_name,
            avatar_url: member.avatar_url,
            joined_at: format_system_time(member.joined_at),
        }
    }
}

/// Authoritative turn row.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq, Eq)]
pub struct TurnSummary {
    pub current_player: String,
    pub turn_index: u64,
    /// RFC3339 timestamp at which the turn times out.
    pub deadline: String,
    pub ended: bool,
}

impl From<TurnStateEntity> for TurnSummary {
    fn from(turn: TurnStateEntity) -> Self {
        Self {
            current_player: turn.current_player,
            turn_index: turn.turn_index,
            deadline: format_system_time(turn.deadline),
            ended: turn.status == TurnStatus::Ended,
        }
    }
}

/// Rep counter of one participant.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq, Eq)]
pub struct ProgressSummary {
    pub user_id: String,
    pub reps: u32,
    pub completed: bool,
}

impl From<ProgressEntity> for ProgressSummary {
    fn from(progress: ProgressEntity) -> Self {
        Self {
            user_id: progress.user_id,
            reps: progress.reps,
            completed: progress.completed,
        }
    }
}

/// Full session state returned by `GET /sessions/{id}` and sent to devices on connect.
#[derive(Debug, Serialize, ToSchema, Clone, PartialEq, Eq)]
pub struct SessionSnapshotResponse {
    pub session: SessionSummary,
    /// Members in join order (the turn order).
    pub members: Vec<MemberSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<TurnSummary>,
    pub progress: Vec<ProgressSummary>,
}

impl From<SessionSnapshot> for SessionSnapshotResponse {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            session: snapshot.session.into(),
            members: snapshot.members.into_iter().map(Into::into).collect(),
            turn: snapshot.turn.map(Into::into),
            progress: snapshot.progress.into_iter().map(Into::into).collect(),
        }
    }
}
