use indexmap::IndexMap;

use crate::{
    dao::models::{
        MemberEntity, ProgressEntity, SessionEntity, SessionStatus, TurnStateEntity, TurnStatus,
    },
    state::feed::ChangeRecord,
};

/// Everything known about a session at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session row.
    pub session: SessionEntity,
    /// Members in join order.
    pub members: Vec<MemberEntity>,
    /// Turn row, absent until two members joined.
    pub turn: Option<TurnStateEntity>,
    /// One row per participant who recorded at least one rep.
    pub progress: Vec<ProgressEntity>,
}

/// Typed change delivered to session subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// A participant joined.
    Member(MemberEntity),
    /// The session status changed.
    Status(SessionEntity),
    /// A rep counter was written.
    Progress(ProgressEntity),
    /// The turn row was created or advanced.
    Turn(TurnStateEntity),
}

impl From<ChangeRecord> for SessionUpdate {
    fn from(record: ChangeRecord) -> Self {
        match record {
            ChangeRecord::Session(session) => SessionUpdate::Status(session),
            ChangeRecord::Member(member) => SessionUpdate::Member(member),
            ChangeRecord::TurnState(turn) => SessionUpdate::Turn(turn),
            ChangeRecord::Progress(progress) => SessionUpdate::Progress(progress),
        }
    }
}

/// Locally cached copy of one session, reconciled from feed deliveries.
///
/// Every apply is a replace keyed by row identity, so duplicated deliveries leave the view
/// unchanged. Rows older than the cached one (lower turn index, fewer reps) are dropped, so a
/// late echo cannot rewind the cache.
#[derive(Debug, Clone)]
pub struct SessionView {
    session: SessionEntity,
    members: IndexMap<String, MemberEntity>,
    turn: Option<TurnStateEntity>,
    progress: IndexMap<String, ProgressEntity>,
}

impl SessionView {
    pub fn new(snapshot: SessionSnapshot) -> Self {
        let mut view = Self {
            session: snapshot.session,
            members: IndexMap::new(),
            turn: snapshot.turn,
            progress: IndexMap::new(),
        };
        for member in snapshot.members {
            view.apply_member(member);
        }
        for progress in snapshot.progress {
            view.apply_progress(progress);
        }
        view
    }

    pub fn session(&self) -> &SessionEntity {
        &self.session
    }

    /// Members in join order.
    pub fn members(&self) -> impl Iterator<Item = &MemberEntity> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn turn(&self) -> Option<&TurnStateEntity> {
        self.turn.as_ref()
    }

    pub fn progress_of(&self, user_id: &str) -> Option<&ProgressEntity> {
        self.progress.get(user_id)
    }

    /// Cached rep count of `user_id`, 0 when nothing was recorded.
    pub fn reps_of(&self, user_id: &str) -> u32 {
        self.progress_of(user_id).map_or(0, |progress| progress.reps)
    }

    /// Whether the session or its turn row was ended.
    pub fn is_ended(&self) -> bool {
        self.session.status == SessionStatus::Ended
            || self
                .turn
                .as_ref()
                .is_some_and(|turn| turn.status == TurnStatus::Ended)
    }

    /// Apply one update, returning whether the cached state changed.
    pub fn apply(&mut self, update: SessionUpdate) -> bool {
        match update {
            SessionUpdate::Member(member) => self.apply_member(member),
            SessionUpdate::Status(session) => self.apply_status(session),
            SessionUpdate::Progress(progress) => self.apply_progress(progress),
            SessionUpdate::Turn(turn) => self.apply_turn(turn),
        }
    }

    fn apply_member(&mut self, member: MemberEntity) -> bool {
        if member.session_id != self.session.id || self.members.contains_key(&member.user_id) {
            return false;
        }
        self.members.insert(member.user_id.clone(), member);
        self.members.sort_by(|_, left, _, right| {
            (left.joined_at, &left.user_id).cmp(&(right.joined_at, &right.user_id))
        });
        true
    }

    fn apply_status(&mut self, session: SessionEntity) -> bool {
        if session.id != self.session.id || session == self.session {
            return false;
        }
        // ended is terminal
        if self.session.status == SessionStatus::Ended && session.status != SessionStatus::Ended {
            return false;
        }
        self.session = session;
        true
    }

    /// Replace the cached counter of the row's participant unless the cache is already ahead.
    pub fn apply_progress(&mut self, progress: ProgressEntity) -> bool {
        if progress.session_id != self.session.id {
            return false;
        }
        if let Some(cached) = self.progress.get(&progress.user_id) {
            // counters only grow and completion is final
            if *cached == progress
                || (progress.reps, progress.completed) < (cached.reps, cached.completed)
            {
                return false;
            }
        }
        self.progress.insert(progress.user_id.clone(), progress);
        true
    }

    fn apply_turn(&mut self, turn: TurnStateEntity) -> bool {
        if turn.session_id != self.session.id {
            return false;
        }
        if let Some(cached) = &self.turn {
            if turn.turn_index < cached.turn_index || *cached == turn {
                return false;
            }
        }
        self.turn = Some(turn);
        true
    }

    /// Rebuild a snapshot from the cache.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            members: self.members.values().cloned().collect(),
            turn: self.turn.clone(),
            progress: self.progress.values().cloned().collect(),
        }
    }
}
