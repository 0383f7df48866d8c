//! In-process session store used when no database is configured and by the test suite.

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{SessionStore, sort_members};
use crate::dao::{
    models::{
        Admission, AdmissionPolicy, AdmissionRefusal, MemberEntity, ProgressEntity,
        SessionEntity, SessionStatus, TurnGuard, TurnStateEntity, TurnStatus,
    },
    storage::{StorageError, StorageResult},
};

/// Session store keeping every table behind a single async lock.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    tables: Arc<RwLock<Tables>>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, SessionEntity>,
    members: HashMap<(Uuid, String), MemberEntity>,
    turns: HashMap<Uuid, TurnStateEntity>,
    progress: HashMap<(Uuid, String), ProgressEntity>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            let code_taken = guard
                .sessions
                .values()
                .any(|existing| existing.status.is_open() && existing.room_code == session.room_code);
            if code_taken {
                return Err(StorageError::Conflict(format!(
                    "room code `{}` already in use",
                    session.room_code
                )));
            }
            if guard.sessions.contains_key(&session.id) {
                return Err(StorageError::Conflict(format!(
                    "session `{}` already exists",
                    session.id
                )));
            }
            guard.sessions.insert(session.id, session);
            Ok(())
        })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move { Ok(tables.read().await.sessions.get(&id).cloned()) })
    }

    fn find_open_session_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            Ok(guard
                .sessions
                .values()
                .find(|session| session.status.is_open() && session.room_code == code)
                .cloned())
        })
    }

    fn update_session_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            match guard.sessions.get_mut(&id) {
                Some(session) if session.status == expected => {
                    session.status = next;
                    session.updated_at = SystemTime::now();
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
    }

    fn admit_member(
        &self,
        member: MemberEntity,
        policy: AdmissionPolicy,
    ) -> BoxFuture<'static, StorageResult<Admission>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            let Some(session) = guard.sessions.get(&member.session_id).cloned() else {
                return Ok(Admission::Refused(AdmissionRefusal::NotFound));
            };
            let key = (member.session_id, member.user_id.clone());
            if guard.members.contains_key(&key) {
                return Ok(Admission::AlreadyMember { session });
            }

            let member_count = guard
                .members
                .keys()
                .filter(|(session_id, _)| *session_id == member.session_id)
                .count();
            if let Err(refusal) = policy.check(session.status, member_count) {
                return Ok(Admission::Refused(refusal));
            }

            guard.members.insert(key, member.clone());
            let started = policy.starts(session.status, member_count + 1);
            let session = match guard.sessions.get_mut(&member.session_id) {
                Some(row) if started => {
                    row.status = SessionStatus::Started;
                    row.updated_at = SystemTime::now();
                    row.clone()
                }
                _ => session,
            };
            Ok(Admission::Admitted {
                member,
                session,
                started,
            })
        })
    }

    fn list_members(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<MemberEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            let mut members: Vec<MemberEntity> = guard
                .members
                .values()
                .filter(|member| member.session_id == session_id)
                .cloned()
                .collect();
            sort_members(&mut members);
            Ok(members)
        })
    }

    fn find_turn_state(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<TurnStateEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move { Ok(tables.read().await.turns.get(&session_id).cloned()) })
    }

    fn init_turn_state(&self, turn: TurnStateEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            if guard.turns.contains_key(&turn.session_id) {
                return Ok(false);
            }
            guard.turns.insert(turn.session_id, turn);
            Ok(true)
        })
    }

    fn compare_and_swap_turn(
        &self,
        expected: TurnGuard,
        next: TurnStateEntity,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            match guard.turns.get_mut(&next.session_id) {
                Some(current)
                    if current.status == TurnStatus::Active && current.guard() == expected =>
                {
                    *current = next;
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
    }

    fn end_turn_state(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            match guard.turns.get_mut(&session_id) {
                Some(turn) if turn.status != TurnStatus::Ended => {
                    turn.status = TurnStatus::Ended;
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
    }

    fn upsert_progress(&self, progress: ProgressEntity) -> BoxFuture<'static, StorageResult<()>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            guard
                .progress
                .insert((progress.session_id, progress.user_id.clone()), progress);
            Ok(())
        })
    }

    fn list_progress(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ProgressEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            let mut rows: Vec<ProgressEntity> = guard
                .progress
                .values()
                .filter(|row| row.session_id == session_id)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.user_id.cmp(&b.user_id));
            Ok(rows)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    fn session(code: &str) -> SessionEntity {
        let now = SystemTime::now();
        SessionEntity {
            id: Uuid::new_v4(),
            room_code: code.into(),
            status: SessionStatus::Waiting,
            created_at: now,
            updated_at: now,
        }
    }

    fn member(session_id: Uuid, user_id: &str, offset_ms: u64) -> MemberEntity {
        MemberEntity {
            session_id,
            user_id: user_id.into(),
            display_name: user_id.to_uppercase(),
            avatar_url: None,
            joined_at: SystemTime::UNIX_EPOCH + Duration::from_millis(offset_ms),
        }
    }

    fn turn(session_id: Uuid, player: &str, index: u64) -> TurnStateEntity {
        TurnStateEntity {
            session_id,
            current_player: player.into(),
            turn_index: index,
            deadline: SystemTime::UNIX_EPOCH + Duration::from_secs(60),
            status: TurnStatus::Active,
        }
    }

    #[tokio::test]
    async fn open_room_codes_are_unique() {
        let store = MemorySessionStore::new();
        store.insert_session(session("ABC123")).await.unwrap();

        let err = store.insert_session(session("ABC123")).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn ended_sessions_release_their_code() {
        let store = MemorySessionStore::new();
        let first = session("ABC123");
        let first_id = first.id;
        store.insert_session(first).await.unwrap();
        store
            .update_session_status(first_id, SessionStatus::Waiting, SessionStatus::Ended)
            .await
            .unwrap();

        store.insert_session(session("ABC123")).await.unwrap();
        let found = store
            .find_open_session_by_code("ABC123".into())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(found.id, first_id);
    }

    #[tokio::test]
    async fn status_update_is_conditional() {
        let store = MemorySessionStore::new();
        let row = session("QWE987");
        let id = row.id;
        store.insert_session(row).await.unwrap();

        let first = store
            .update_session_status(id, SessionStatus::Waiting, SessionStatus::Started)
            .await
            .unwrap();
        let second = store
            .update_session_status(id, SessionStatus::Waiting, SessionStatus::Started)
            .await
            .unwrap();
        assert_eq!((first, second), (1, 0));
    }

    const OPEN_POLICY: AdmissionPolicy = AdmissionPolicy {
        allow_late_join: true,
        max_members: None,
        start_threshold: usize::MAX,
    };

    async fn store_with_session() -> (MemorySessionStore, Uuid) {
        let store = MemorySessionStore::new();
        let row = session("JOIN42");
        let id = row.id;
        store.insert_session(row).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn duplicate_member_insert_is_reported_not_failed() {
        let (store, id) = store_with_session().await;

        let first = store
            .admit_member(member(id, "alice", 1), OPEN_POLICY)
            .await
            .unwrap();
        assert!(matches!(first, Admission::Admitted { .. }));
        let second = store
            .admit_member(member(id, "alice", 2), OPEN_POLICY)
            .await
            .unwrap();
        assert!(matches!(second, Admission::AlreadyMember { .. }));
        assert_eq!(store.list_members(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn members_are_listed_in_join_order() {
        let (store, id) = store_with_session().await;
        let (other, other_id) = store_with_session().await;
        store.admit_member(member(id, "carol", 30), OPEN_POLICY).await.unwrap();
        store.admit_member(member(id, "alice", 10), OPEN_POLICY).await.unwrap();
        store.admit_member(member(id, "bob", 20), OPEN_POLICY).await.unwrap();
        other
            .admit_member(member(other_id, "zed", 0), OPEN_POLICY)
            .await
            .unwrap();

        let order: Vec<String> = store
            .list_members(id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        assert_eq!(order, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn admission_starts_the_session_and_closes_it_to_late_joiners() {
        let (store, id) = store_with_session().await;
        let policy = AdmissionPolicy {
            allow_late_join: false,
            max_members: None,
            start_threshold: 2,
        };

        let host = store.admit_member(member(id, "alice", 1), policy).await.unwrap();
        assert!(matches!(host, Admission::Admitted { started: false, .. }));
        let guest = store.admit_member(member(id, "bob", 2), policy).await.unwrap();
        let Admission::Admitted { session, started, .. } = guest else {
            panic!("bob should be admitted, got {guest:?}");
        };
        assert!(started);
        assert_eq!(session.status, SessionStatus::Started);

        let late = store.admit_member(member(id, "carol", 3), policy).await.unwrap();
        assert_eq!(late, Admission::Refused(AdmissionRefusal::AlreadyStarted));
        let rejoin = store.admit_member(member(id, "alice", 4), policy).await.unwrap();
        assert!(matches!(rejoin, Admission::AlreadyMember { .. }));
    }

    #[tokio::test]
    async fn admission_respects_member_cap() {
        let (store, id) = store_with_session().await;
        let policy = AdmissionPolicy {
            max_members: Some(1),
            ..OPEN_POLICY
        };

        store.admit_member(member(id, "alice", 1), policy).await.unwrap();
        let full = store.admit_member(member(id, "bob", 2), policy).await.unwrap();
        assert_eq!(full, Admission::Refused(AdmissionRefusal::Full));

        let missing = store
            .admit_member(member(Uuid::new_v4(), "bob", 2), policy)
            .await
            .unwrap();
        assert_eq!(missing, Admission::Refused(AdmissionRefusal::NotFound));
    }

    #[tokio::test]
    async fn init_turn_state_keeps_first_writer() {
        let store = MemorySessionStore::new();
        let id = Uuid::new_v4();

        assert!(store.init_turn_state(turn(id, "alice", 0)).await.unwrap());
        store
            .compare_and_swap_turn(turn(id, "alice", 0).guard(), turn(id, "bob", 1))
            .await
            .unwrap();
        assert!(!store.init_turn_state(turn(id, "alice", 0)).await.unwrap());

        let stored = store.find_turn_state(id).await.unwrap().unwrap();
        assert_eq!(stored.turn_index, 1);
        assert_eq!(stored.current_player, "bob");
    }

    #[tokio::test]
    async fn compare_and_swap_requires_matching_guard() {
        let store = MemorySessionStore::new();
        let id = Uuid::new_v4();
        store.init_turn_state(turn(id, "alice", 0)).await.unwrap();

        let stale = TurnGuard {
            current_player: "bob".into(),
            turn_index: 0,
        };
        assert_eq!(
            store.compare_and_swap_turn(stale, turn(id, "carol", 1)).await.unwrap(),
            0
        );

        let fresh = turn(id, "alice", 0).guard();
        assert_eq!(
            store
                .compare_and_swap_turn(fresh.clone(), turn(id, "bob", 1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store.compare_and_swap_turn(fresh, turn(id, "bob", 1)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn ended_turn_rejects_advances() {
        let store = MemorySessionStore::new();
        let id = Uuid::new_v4();
        store.init_turn_state(turn(id, "alice", 0)).await.unwrap();
        assert_eq!(store.end_turn_state(id).await.unwrap(), 1);
        assert_eq!(store.end_turn_state(id).await.unwrap(), 0);

        let affected = store
            .compare_and_swap_turn(turn(id, "alice", 0).guard(), turn(id, "bob", 1))
            .await
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn progress_upsert_replaces_the_row() {
        let store = MemorySessionStore::new();
        let id = Uuid::new_v4();
        let mut row = ProgressEntity {
            session_id: id,
            user_id: "alice".into(),
            reps: 1,
            completed: false,
            updated_at: SystemTime::now(),
        };
        store.upsert_progress(row.clone()).await.unwrap();
        row.reps = 2;
        store.upsert_progress(row).await.unwrap();

        let rows = store.list_progress(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reps, 2);
    }
}
