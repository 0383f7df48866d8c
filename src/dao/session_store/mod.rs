mod feeding;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

pub use feeding::FeedingStore;
pub use memory::MemorySessionStore;

use crate::dao::models::{
    Admission, AdmissionPolicy, MemberEntity, ProgressEntity, SessionEntity, SessionStatus,
    TurnGuard, TurnStateEntity,
};
use crate::dao::storage::StorageResult;
use futures::future::BoxFuture;
use uuid::Uuid;

/// Abstraction over the shared session state: rooms, memberships, the turn row and progress.
///
/// Conditional writes report the number of affected rows. Zero means the predicate no longer
/// matched; callers treat it as a successful no-op, never as an error.
pub trait SessionStore: Send + Sync {
    /// Create a session. Fails with a conflict when an open session already uses the room code.
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    fn find_open_session_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Move a session from `expected` to `next`, returning the number of rows changed.
    fn update_session_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> BoxFuture<'static, StorageResult<u64>>;

    /// Insert a membership row if `policy` admits it, in one step with the status and member
    /// count checks. Moves a waiting session to started once the threshold is reached.
    /// An existing (session, user) pair yields [`Admission::AlreadyMember`], never an error.
    fn admit_member(
        &self,
        member: MemberEntity,
        policy: AdmissionPolicy,
    ) -> BoxFuture<'static, StorageResult<Admission>>;
    /// Members of a session in join order.
    fn list_members(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<MemberEntity>>>;

    fn find_turn_state(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<TurnStateEntity>>>;
    /// Insert the turn row unless one already exists for the session; returns whether it was created.
    fn init_turn_state(&self, turn: TurnStateEntity) -> BoxFuture<'static, StorageResult<bool>>;
    /// Replace the turn row only if it still matches `guard`; returns the number of rows changed.
    fn compare_and_swap_turn(
        &self,
        guard: TurnGuard,
        next: TurnStateEntity,
    ) -> BoxFuture<'static, StorageResult<u64>>;
    /// Mark the turn row of a session as ended.
    fn end_turn_state(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>>;

    /// Insert or replace the progress row keyed by (session, user).
    fn upsert_progress(&self, progress: ProgressEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn list_progress(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ProgressEntity>>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Order members by join time, breaking ties on the user id so every reader agrees.
pub fn sort_members(members: &mut [MemberEntity]) {
    members.sort_by(|a, b| {
        a.joined_at
            .cmp(&b.joined_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}
