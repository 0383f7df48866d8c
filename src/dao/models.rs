use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Lifecycle status of a live training room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Room created, waiting for enough participants.
    Waiting,
    /// Turn play has begun.
    Started,
    /// Session was explicitly ended; the room code is released.
    Ended,
}

impl SessionStatus {
    /// Whether the room code of a session in this status is still reserved.
    pub fn is_open(self) -> bool {
        !matches!(self, SessionStatus::Ended)
    }

    /// Stable lowercase label used by storage backends and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Started => "started",
            SessionStatus::Ended => "ended",
        }
    }
}

/// One live multiplayer training room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEntity {
    /// Server generated identifier.
    pub id: Uuid,
    /// Short human-enterable join code, unique among open sessions.
    pub room_code: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Last status change.
    pub updated_at: SystemTime,
}

/// Association between a session and a participant, with a profile snapshot taken at join time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberEntity {
    /// Session the participant belongs to.
    pub session_id: Uuid,
    /// Opaque participant identity.
    pub user_id: String,
    /// Display name snapshot.
    pub display_name: String,
    /// Avatar snapshot.
    pub avatar_url: Option<String>,
    /// Join timestamp; defines the round-robin order.
    pub joined_at: SystemTime,
}

/// Status carried by the singleton turn row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The current player's countdown is running.
    Active,
    /// The session ended; no further advances are accepted.
    Ended,
}

impl TurnStatus {
    /// Stable lowercase label used by storage backends.
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Active => "active",
            TurnStatus::Ended => "ended",
        }
    }
}

/// Authoritative turn record, one per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnStateEntity {
    /// Session this turn belongs to (also the row key).
    pub session_id: Uuid,
    /// User id of the member holding the turn.
    pub current_player: String,
    /// Starts at 0 and grows by exactly one per advance.
    pub turn_index: u64,
    /// Absolute instant at which the current turn times out.
    pub deadline: SystemTime,
    /// Whether the turn is still running.
    pub status: TurnStatus,
}

impl TurnStateEntity {
    /// Predicate values a conditional advance of this row must match.
    pub fn guard(&self) -> TurnGuard {
        TurnGuard {
            current_player: self.current_player.clone(),
            turn_index: self.turn_index,
        }
    }
}

/// Expected previous values of a compare-and-swap turn update.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnGuard {
    /// Current player observed by the caller.
    pub current_player: String,
    /// Turn index observed by the caller.
    pub turn_index: u64,
}

/// Per (session, user) repetition counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEntity {
    /// Session the counter belongs to.
    pub session_id: Uuid,
    /// Participant the counter belongs to.
    pub user_id: String,
    /// Number of repetitions recorded so far.
    pub reps: u32,
    /// Set once the session has been ended.
    pub completed: bool,
    /// Last write timestamp.
    pub updated_at: SystemTime,
}

/// Rules a store enforces in the same step as a membership insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Whether new members may join a started session.
    pub allow_late_join: bool,
    /// Upper bound on members per session.
    pub max_members: Option<usize>,
    /// Member count at which a waiting session becomes started.
    pub start_threshold: usize,
}

impl AdmissionPolicy {
    /// Check whether a session in `status` holding `member_count` members takes a new one.
    pub fn check(&self, status: SessionStatus, member_count: usize) -> Result<(), AdmissionRefusal> {
        match status {
            SessionStatus::Ended => return Err(AdmissionRefusal::Ended),
            SessionStatus::Started if !self.allow_late_join => {
                return Err(AdmissionRefusal::AlreadyStarted);
            }
            SessionStatus::Waiting | SessionStatus::Started => {}
        }
        if self.max_members.is_some_and(|max| member_count >= max) {
            return Err(AdmissionRefusal::Full);
        }
        Ok(())
    }

    /// Whether admitting a member into a session in `status` moves it to started.
    pub fn starts(&self, status: SessionStatus, member_count_after: usize) -> bool {
        status == SessionStatus::Waiting && member_count_after >= self.start_threshold
    }
}

/// Why a store refused a new member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRefusal {
    /// No session with that id.
    NotFound,
    /// The session was ended.
    Ended,
    /// The session started and late joins are disabled.
    AlreadyStarted,
    /// The member cap is reached.
    Full,
}

/// Outcome of a conditional membership insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The member row was created. `session` is the row after the join, `started` tells
    /// whether this join moved it out of waiting.
    Admitted {
        member: MemberEntity,
        session: SessionEntity,
        started: bool,
    },
    /// The (session, user) pair already existed; nothing was written.
    AlreadyMember { session: SessionEntity },
    /// The admission rules refused the join; nothing was written.
    Refused(AdmissionRefusal),
}
