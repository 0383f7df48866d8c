use std::time::{Duration, SystemTime};

use thiserror::Error;
use uuid::Uuid;

use crate::dao::{
    models::{MemberEntity, TurnGuard, TurnStateEntity, TurnStatus},
    session_store::sort_members,
};

/// Phases of turn play as seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPhase {
    /// No turn row exists yet (fewer than two members, or not observed).
    Uninitialized,
    /// The current player's countdown is running.
    Work {
        /// Member holding the turn.
        current_player: String,
        /// Index of the running turn.
        turn_index: u64,
        /// Instant at which the turn times out.
        deadline: SystemTime,
    },
    /// The session ended; no more advances.
    Ended,
}

/// Reasons a turn advance cannot be planned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    /// No turn row has been observed yet.
    #[error("turn play has not started")]
    NotInitialized,
    /// The turn row was marked ended.
    #[error("turn play has ended")]
    Ended,
    /// Only the current player may end a turn.
    #[error("`{user}` does not hold the turn (current player is `{current}`)")]
    NotYourTurn {
        /// Participant who asked.
        user: String,
        /// Participant holding the turn.
        current: String,
    },
    /// An advance for this turn was already issued and is awaiting its outcome.
    #[error("an advance of turn {turn_index} is already in flight")]
    AdvancePending {
        /// Turn the pending advance targets.
        turn_index: u64,
    },
    /// The roster is empty.
    #[error("session has no members")]
    NoMembers,
}

/// Display-only view of the running turn, recomputed on every local tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    /// Member holding the turn.
    pub current_player: String,
    /// Index of the running turn.
    pub turn_index: u64,
    /// Time left before the deadline, saturating at zero.
    pub remaining: Duration,
}

impl Countdown {
    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.remaining.is_zero()
    }
}

/// A planned compare-and-swap advance: apply `next` only if the row still matches `guard`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnAdvance {
    /// Values the stored row must still hold.
    pub guard: TurnGuard,
    /// Row to write when the guard matches.
    pub next: TurnStateEntity,
}

/// Round-robin successor of `current` over `members` (join order).
///
/// An unknown `current` hands the turn to the first member.
pub fn next_player<'a>(members: &'a [String], current: &str) -> Option<&'a str> {
    if members.is_empty() {
        return None;
    }
    let next_index = members
        .iter()
        .position(|member| member == current)
        .map_or(0, |index| (index + 1) % members.len());
    Some(members[next_index].as_str())
}

/// Initial turn row for a session: first member in join order, index 0.
pub fn initial_turn(
    session_id: Uuid,
    members: &[String],
    now: SystemTime,
    turn_duration: Duration,
) -> Option<TurnStateEntity> {
    let first = members.first()?;
    Some(TurnStateEntity {
        session_id,
        current_player: first.clone(),
        turn_index: 0,
        deadline: now + turn_duration,
        status: TurnStatus::Active,
    })
}

/// Plan the advance of `turn` to the next member, restarting the deadline from `now`.
pub fn plan_advance(
    turn: &TurnStateEntity,
    members: &[String],
    now: SystemTime,
    turn_duration: Duration,
) -> Result<TurnAdvance, TurnError> {
    if turn.status == TurnStatus::Ended {
        return Err(TurnError::Ended);
    }
    let next_player = next_player(members, &turn.current_player).ok_or(TurnError::NoMembers)?;
    Ok(TurnAdvance {
        guard: turn.guard(),
        next: TurnStateEntity {
            session_id: turn.session_id,
            current_player: next_player.to_owned(),
            turn_index: turn.turn_index + 1,
            deadline: now + turn_duration,
            status: TurnStatus::Active,
        },
    })
}

/// Per-participant turn coordinator.
///
/// The cached turn row is the logical clock and is only ever replaced by rows received from
/// the store or the change feed. Countdowns are derived from it on demand and never advance
/// it. At most one timeout advance is issued per observed turn.
#[derive(Debug, Clone)]
pub struct TurnCoordinator {
    session_id: Uuid,
    local_user: String,
    turn_duration: Duration,
    roster: Vec<String>,
    turn: Option<TurnStateEntity>,
    in_flight: Option<TurnGuard>,
    init_proposed: bool,
}

impl TurnCoordinator {
    /// Create a coordinator for `local_user` in `session_id`.
    pub fn new(session_id: Uuid, local_user: impl Into<String>, turn_duration: Duration) -> Self {
        Self {
            session_id,
            local_user: local_user.into(),
            turn_duration,
            roster: Vec::new(),
            turn: None,
            in_flight: None,
            init_proposed: false,
        }
    }

    /// Participant this coordinator acts for.
    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Members in join order.
    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    /// Last authoritative turn row received.
    pub fn turn(&self) -> Option<&TurnStateEntity> {
        self.turn.as_ref()
    }

    /// Current phase derived from the cached turn row.
    pub fn phase(&self) -> TurnPhase {
        match &self.turn {
            None => TurnPhase::Uninitialized,
            Some(turn) if turn.status == TurnStatus::Ended => TurnPhase::Ended,
            Some(turn) => TurnPhase::Work {
                current_player: turn.current_player.clone(),
                turn_index: turn.turn_index,
                deadline: turn.deadline,
            },
        }
    }

    /// Replace the roster and, the first time two or more members are known while no turn
    /// exists, propose the initial turn row to create.
    pub fn observe_members(
        &mut self,
        members: &[MemberEntity],
        now: SystemTime,
    ) -> Option<TurnStateEntity> {
        let mut ordered = members.to_vec();
        sort_members(&mut ordered);
        self.roster = ordered.into_iter().map(|member| member.user_id).collect();

        if self.turn.is_some() || self.init_proposed || self.roster.len() < 2 {
            return None;
        }
        let proposal = initial_turn(self.session_id, &self.roster, now, self.turn_duration)?;
        self.init_proposed = true;
        Some(proposal)
    }

    /// Allow the initial turn to be proposed again after the creating write failed.
    pub fn init_failed(&mut self) {
        self.init_proposed = false;
    }

    /// Overwrite the cached turn with an authoritative row.
    ///
    /// Rows older than the cached turn index are ignored. Returns whether the cache changed.
    pub fn observe_turn(&mut self, turn: TurnStateEntity) -> bool {
        if turn.session_id != self.session_id {
            return false;
        }
        if let Some(cached) = &self.turn {
            if turn.turn_index < cached.turn_index || *cached == turn {
                return false;
            }
        }
        if self
            .in_flight
            .as_ref()
            .is_some_and(|guard| *guard != turn.guard())
        {
            self.in_flight = None;
        }
        self.turn = Some(turn);
        true
    }

    /// Display countdown for the running turn, if any.
    pub fn countdown(&self, now: SystemTime) -> Option<Countdown> {
        let turn = self.turn.as_ref()?;
        if turn.status == TurnStatus::Ended {
            return None;
        }
        Some(Countdown {
            current_player: turn.current_player.clone(),
            turn_index: turn.turn_index,
            remaining: turn.deadline.duration_since(now).unwrap_or_default(),
        })
    }

    /// Timeout check run on every local tick.
    ///
    /// Yields an advance once per turn, and only when the local participant holds the turn
    /// and its deadline has passed.
    pub fn poll_timeout(&mut self, now: SystemTime) -> Option<TurnAdvance> {
        let turn = self.turn.as_ref()?;
        if turn.status != TurnStatus::Active
            || turn.current_player != self.local_user
            || now < turn.deadline
        {
            return None;
        }
        let guard = turn.guard();
        if self.in_flight.as_ref() == Some(&guard) {
            return None;
        }
        let advance = plan_advance(turn, &self.roster, now, self.turn_duration).ok()?;
        self.in_flight = Some(guard);
        Some(advance)
    }

    /// Manual "end turn": same conditional advance as a timeout, issued immediately.
    pub fn end_turn(&mut self, now: SystemTime) -> Result<TurnAdvance, TurnError> {
        let turn = self.turn.as_ref().ok_or(TurnError::NotInitialized)?;
        if turn.status == TurnStatus::Ended {
            return Err(TurnError::Ended);
        }
        if turn.current_player != self.local_user {
            return Err(TurnError::NotYourTurn {
                user: self.local_user.clone(),
                current: turn.current_player.clone(),
            });
        }
        let guard = turn.guard();
        if self.in_flight.as_ref() == Some(&guard) {
            return Err(TurnError::AdvancePending {
                turn_index: turn.turn_index,
            });
        }
        let advance = plan_advance(turn, &self.roster, now, self.turn_duration)?;
        self.in_flight = Some(guard);
        Ok(advance)
    }

    /// Re-arm the single-shot guard after the advance write failed outright.
    ///
    /// A CAS that matched no row is not a failure and must not be reported here.
    pub fn advance_failed(&mut self, guard: &TurnGuard) {
        if self.in_flight.as_ref() == Some(guard) {
            self.in_flight = None;
        }
    }
}
