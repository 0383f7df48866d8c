use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::MongoDaoError;
use crate::dao::models::{
    AdmissionPolicy, MemberEntity, ProgressEntity, SessionEntity, SessionStatus, TurnGuard,
    TurnStateEntity, TurnStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    id: String,
    room_code: String,
    status: SessionStatus,
    /// Mirrors `status != ended`; backs the partial unique index on open room codes.
    open: bool,
    /// Number of member rows; guards admissions.
    #[serde(default)]
    member_count: i64,
    created_at: DateTime,
    updated_at: DateTime,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: value.id.to_string(),
            room_code: value.room_code,
            status: value.status,
            open: value.status.is_open(),
            member_count: 0,
            created_at: DateTime::from_system_time(value.created_at),
            updated_at: DateTime::from_system_time(value.updated_at),
        }
    }
}

impl MongoSessionDocument {
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn member_count(&self) -> usize {
        usize::try_from(self.member_count).unwrap_or(0)
    }
}

impl TryFrom<MongoSessionDocument> for SessionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("sessions", &value.id)?,
            room_code: value.room_code,
            status: value.status,
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoMemberDocument {
    session_id: String,
    user_id: String,
    display_name: String,
    avatar_url: Option<String>,
    joined_at: DateTime,
}

impl From<MemberEntity> for MongoMemberDocument {
    fn from(value: MemberEntity) -> Self {
        Self {
            session_id: value.session_id.to_string(),
            user_id: value.user_id,
            display_name: value.display_name,
            avatar_url: value.avatar_url,
            joined_at: DateTime::from_system_time(value.joined_at),
        }
    }
}

impl TryFrom<MongoMemberDocument> for MemberEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoMemberDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            session_id: parse_id("members", &value.session_id)?,
            user_id: value.user_id,
            display_name: value.display_name,
            avatar_url: value.avatar_url,
            joined_at: value.joined_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoTurnDocument {
    #[serde(rename = "_id")]
    session_id: String,
    current_player: String,
    turn_index: i64,
    deadline: DateTime,
    status: TurnStatus,
}

impl From<TurnStateEntity> for MongoTurnDocument {
    fn from(value: TurnStateEntity) -> Self {
        Self {
            session_id: value.session_id.to_string(),
            current_player: value.current_player,
            turn_index: index_to_i64(value.turn_index),
            deadline: DateTime::from_system_time(value.deadline),
            status: value.status,
        }
    }
}

impl TryFrom<MongoTurnDocument> for TurnStateEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoTurnDocument) -> Result<Self, Self::Error> {
        let session_id = parse_id("turn_states", &value.session_id)?;
        let turn_index =
            u64::try_from(value.turn_index).map_err(|_| MongoDaoError::Malformed {
                collection: "turn_states",
                id: session_id,
                reason: format!("negative turn index {}", value.turn_index),
            })?;
        Ok(Self {
            session_id,
            current_player: value.current_player,
            turn_index,
            deadline: value.deadline.to_system_time(),
            status: value.status,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoProgressDocument {
    session_id: String,
    user_id: String,
    reps: i64,
    completed: bool,
    updated_at: DateTime,
}

impl From<ProgressEntity> for MongoProgressDocument {
    fn from(value: ProgressEntity) -> Self {
        Self {
            session_id: value.session_id.to_string(),
            user_id: value.user_id,
            reps: i64::from(value.reps),
            completed: value.completed,
            updated_at: DateTime::from_system_time(value.updated_at),
        }
    }
}

impl TryFrom<MongoProgressDocument> for ProgressEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoProgressDocument) -> Result<Self, Self::Error> {
        let session_id = parse_id("progress", &value.session_id)?;
        let reps = u32::try_from(value.reps).map_err(|_| MongoDaoError::Malformed {
            collection: "progress",
            id: session_id,
            reason: format!("rep count {} out of range", value.reps),
        })?;
        Ok(Self {
            session_id,
            user_id: value.user_id,
            reps,
            completed: value.completed,
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

fn parse_id(collection: &'static str, raw: &str) -> Result<Uuid, MongoDaoError> {
    Uuid::parse_str(raw).map_err(|err| MongoDaoError::Malformed {
        collection,
        id: Uuid::nil(),
        reason: format!("invalid session id `{raw}`: {err}"),
    })
}

pub fn index_to_i64(index: u64) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

pub fn member_key(session_id: Uuid, user_id: &str) -> Document {
    doc! {"session_id": session_id.to_string(), "user_id": user_id}
}

/// Filter matching a session document only while `policy` admits one more member.
pub fn admission_filter(session_id: Uuid, policy: &AdmissionPolicy) -> Document {
    let mut statuses = vec![SessionStatus::Waiting.as_str()];
    if policy.allow_late_join {
        statuses.push(SessionStatus::Started.as_str());
    }
    let mut filter = doc! {"_id": session_id.to_string(), "status": {"$in": statuses}};
    if let Some(max) = policy.max_members {
        filter.insert(
            "member_count",
            doc! {"$lt": i64::try_from(max).unwrap_or(i64::MAX)},
        );
    }
    filter
}

/// Pipeline taking one seat and starting the session once the threshold is reached.
pub fn admission_update(policy: &AdmissionPolicy) -> Vec<Document> {
    let threshold = i64::try_from(policy.start_threshold).unwrap_or(i64::MAX);
    vec![doc! {"$set": {
        "member_count": {"$add": ["$member_count", 1]},
        "status": {"$cond": [
            {"$and": [
                {"$eq": ["$status", SessionStatus::Waiting.as_str()]},
                {"$gte": [{"$add": ["$member_count", 1]}, threshold]},
            ]},
            SessionStatus::Started.as_str(),
            "$status",
        ]},
        "updated_at": "$$NOW",
    }}]
}

/// Filter matching the turn row only while it still holds the guarded values.
pub fn turn_guard_filter(session_id: Uuid, guard: &TurnGuard) -> Document {
    doc! {
        "_id": session_id.to_string(),
        "current_player": guard.current_player.as_str(),
        "turn_index": index_to_i64(guard.turn_index),
        "status": TurnStatus::Active.as_str(),
    }
}
