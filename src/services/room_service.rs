use std::{sync::Arc, time::SystemTime};

use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::{
        models::{
            Admission, AdmissionRefusal, MemberEntity, ProgressEntity, SessionEntity,
            SessionStatus,
        },
        session_store::SessionStore,
        storage::StorageError,
    },
    error::ServiceError,
    state::{SharedState, session_view::SessionSnapshot},
};

/// Characters used in room codes; look-alikes (0/O, 1/I) are left out.
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const END_SESSION_ATTEMPTS: usize = 3;

/// Identity and profile snapshot of a participant joining a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantProfile {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Result of a room creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session_id: Uuid,
    pub room_code: String,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedSession {
    pub session_id: Uuid,
    pub status: SessionStatus,
}

/// Generate a random room code of `length` characters.
pub fn generate_room_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Canonical form of a user-entered room code.
pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Create a waiting room with a fresh code and join `host` as its first member.
pub async fn create_session(
    state: &SharedState,
    host: ParticipantProfile,
) -> Result<CreatedSession, ServiceError> {
    let store = state.require_store().await?;
    let config = state.config();

    let mut attempt = 0;
    let session = loop {
        attempt += 1;
        let now = SystemTime::now();
        let session = SessionEntity {
            id: Uuid::new_v4(),
            room_code: generate_room_code(config.room_code_length),
            status: SessionStatus::Waiting,
            created_at: now,
            updated_at: now,
        };
        match store.insert_session(session.clone()).await {
            Ok(()) => break session,
            Err(StorageError::Conflict(reason)) if attempt < config.room_code_attempts => {
                warn!(attempt, %reason, "room code collision; generating a new one");
            }
            Err(err) => return Err(err.into()),
        }
    };

    info!(session_id = %session.id, room_code = %session.room_code, host = %host.user_id, "session created");
    admit(&store, &config, session.id, host).await?;

    Ok(CreatedSession {
        session_id: session.id,
        room_code: session.room_code,
    })
}

/// Join the open session identified by `code`.
///
/// A participant who is already a member always gets back in, whatever the session status.
pub async fn join_session_by_code(
    state: &SharedState,
    code: &str,
    profile: ParticipantProfile,
) -> Result<JoinedSession, ServiceError> {
    let store = state.require_store().await?;
    let config = state.config();
    let code = normalize_room_code(code);

    let session = store
        .find_open_session_by_code(code.clone())
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("no open session with code `{code}`")))?;

    let session = admit(&store, &config, session.id, profile).await?;
    Ok(JoinedSession {
        session_id: session.id,
        status: session.status,
    })
}

/// Add `profile` to the members of `session_id`. Returns whether a row was created.
pub async fn join_session_room(
    state: &SharedState,
    session_id: Uuid,
    profile: ParticipantProfile,
) -> Result<bool, ServiceError> {
    let store = state.require_store().await?;
    let member = new_member(session_id, profile);
    let admission = store
        .admit_member(member, state.config().admission_policy())
        .await?;
    let created = matches!(admission, Admission::Admitted { .. });
    settle(session_id, admission)?;
    Ok(created)
}

/// End a session: status, turn row and every progress row are marked finished.
///
/// Only members may end a session; ending an ended session is a no-op.
pub async fn end_session(
    state: &SharedState,
    session_id: Uuid,
    user_id: &str,
) -> Result<SessionEntity, ServiceError> {
    let store = state.require_store().await?;
    let members = store.list_members(session_id).await?;
    let mut session = load_session(&store, session_id).await?;
    if !members.iter().any(|member| member.user_id == user_id) {
        return Err(ServiceError::Unauthorized(format!(
            "`{user_id}` is not a member of session `{session_id}`"
        )));
    }

    let mut attempts = 0;
    while session.status != SessionStatus::Ended {
        attempts += 1;
        if attempts > END_SESSION_ATTEMPTS {
            return Err(ServiceError::Timeout);
        }
        store
            .update_session_status(session_id, session.status, SessionStatus::Ended)
            .await?;
        session = load_session(&store, session_id).await?;
    }

    store.end_turn_state(session_id).await?;
    let now = SystemTime::now();
    for progress in store.list_progress(session_id).await? {
        if progress.completed {
            continue;
        }
        store
            .upsert_progress(ProgressEntity {
                completed: true,
                updated_at: now,
                ..progress
            })
            .await?;
    }

    info!(%session_id, ended_by = %user_id, "session ended");
    Ok(session)
}

/// Session row, ordered members, turn row and progress rows of `session_id`.
pub async fn session_snapshot(
    state: &SharedState,
    session_id: Uuid,
) -> Result<SessionSnapshot, ServiceError> {
    let store = state.require_store().await?;
    let session = load_session(&store, session_id).await?;
    let members = store.list_members(session_id).await?;
    let turn = store.find_turn_state(session_id).await?;
    let progress = store.list_progress(session_id).await?;
    Ok(SessionSnapshot {
        session,
        members,
        turn,
        progress,
    })
}

async fn load_session(
    store: &Arc<dyn SessionStore>,
    session_id: Uuid,
) -> Result<SessionEntity, ServiceError> {
    store
        .find_session(session_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))
}

fn new_member(session_id: Uuid, profile: ParticipantProfile) -> MemberEntity {
    MemberEntity {
        session_id,
        user_id: profile.user_id,
        display_name: profile.display_name,
        avatar_url: profile.avatar_url,
        joined_at: SystemTime::now(),
    }
}

/// Admit `profile` into `session_id` and return the session row after the join.
///
/// Status, capacity and the start transition are decided by the store in one step, so
/// concurrent joiners cannot both slip past the limits.
async fn admit(
    store: &Arc<dyn SessionStore>,
    config: &AppConfig,
    session_id: Uuid,
    profile: ParticipantProfile,
) -> Result<SessionEntity, ServiceError> {
    let admission = store
        .admit_member(new_member(session_id, profile), config.admission_policy())
        .await?;
    settle(session_id, admission)
}

fn settle(session_id: Uuid, admission: Admission) -> Result<SessionEntity, ServiceError> {
    match admission {
        Admission::Admitted {
            member,
            session,
            started,
        } => {
            info!(%session_id, user_id = %member.user_id, "member joined session");
            if started {
                info!(%session_id, "session started");
            }
            Ok(session)
        }
        Admission::AlreadyMember { session } => {
            debug!(%session_id, "member rejoined session");
            Ok(session)
        }
        Admission::Refused(refusal) => Err(match refusal {
            AdmissionRefusal::NotFound => {
                ServiceError::NotFound(format!("session `{session_id}` not found"))
            }
            AdmissionRefusal::Ended => ServiceError::InvalidState("session has ended".into()),
            AdmissionRefusal::AlreadyStarted => {
                ServiceError::InvalidState("session already started".into())
            }
            AdmissionRefusal::Full => ServiceError::InvalidState("room is full".into()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        dao::{
            models::{AdmissionPolicy, TurnGuard, TurnStateEntity},
            session_store::MemorySessionStore,
            storage::StorageResult,
        },
        services::test_support::{profile, state_with},
        state::AppState,
    };

    #[test]
    fn room_codes_use_the_unambiguous_alphabet() {
        let code = generate_room_code(8);
        assert_eq!(code.len(), 8);
        assert!(code.bytes().all(|c| ROOM_CODE_ALPHABET.contains(&c)));
        assert_eq!(normalize_room_code("  ab3k9z "), "AB3K9Z");
    }

    #[tokio::test]
    async fn created_session_waits_with_the_host_as_member() {
        let state = state_with(AppConfig::default()).await;
        let created = create_session(&state, profile("alice")).await.unwrap();

        let snapshot = session_snapshot(&state, created.session_id).await.unwrap();
        assert_eq!(snapshot.session.status, SessionStatus::Waiting);
        assert_eq!(snapshot.session.room_code, created.room_code);
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.members[0].user_id, "alice");
        assert!(snapshot.turn.is_none());
    }

    #[tokio::test]
    async fn second_member_starts_the_session() {
        let state = state_with(AppConfig::default()).await;
        let created = create_session(&state, profile("alice")).await.unwrap();

        let joined = join_session_by_code(
            &state,
            &created.room_code.to_lowercase(),
            profile("bob"),
        )
        .await
        .unwrap();

        assert_eq!(joined.session_id, created.session_id);
        assert_eq!(joined.status, SessionStatus::Started);
    }

    #[tokio::test]
    async fn joining_twice_yields_one_member_row() {
        let state = state_with(AppConfig {
            start_threshold: 3,
            ..AppConfig::default()
        })
        .await;
        let created = create_session(&state, profile("alice")).await.unwrap();

        join_session_by_code(&state, &created.room_code, profile("bob"))
            .await
            .unwrap();
        join_session_by_code(&state, &created.room_code, profile("bob"))
            .await
            .unwrap();
        assert!(
            !join_session_room(&state, created.session_id, profile("bob"))
                .await
                .unwrap()
        );

        let snapshot = session_snapshot(&state, created.session_id).await.unwrap();
        let bobs = snapshot
            .members
            .iter()
            .filter(|member| member.user_id == "bob")
            .count();
        assert_eq!(bobs, 1);
    }

    #[tokio::test]
    async fn late_join_is_rejected_once_started() {
        let state = state_with(AppConfig::default()).await;
        let created = create_session(&state, profile("alice")).await.unwrap();
        join_session_by_code(&state, &created.room_code, profile("bob"))
            .await
            .unwrap();

        let late = join_session_by_code(&state, &created.room_code, profile("carol")).await;
        assert!(
            matches!(late, Err(ServiceError::InvalidState(message)) if message.contains("already started"))
        );

        let rejoin = join_session_by_code(&state, &created.room_code, profile("bob"))
            .await
            .unwrap();
        assert_eq!(rejoin.status, SessionStatus::Started);
    }

    #[tokio::test]
    async fn late_join_can_be_enabled() {
        let state = state_with(AppConfig {
            allow_late_join: true,
            ..AppConfig::default()
        })
        .await;
        let created = create_session(&state, profile("alice")).await.unwrap();
        join_session_by_code(&state, &created.room_code, profile("bob"))
            .await
            .unwrap();

        let late = join_session_by_code(&state, &created.room_code, profile("carol"))
            .await
            .unwrap();
        assert_eq!(late.status, SessionStatus::Started);
    }

    #[tokio::test]
    async fn member_cap_is_enforced() {
        let state = state_with(AppConfig {
            max_members: Some(2),
            start_threshold: 3,
            ..AppConfig::default()
        })
        .await;
        let created = create_session(&state, profile("alice")).await.unwrap();
        join_session_by_code(&state, &created.room_code, profile("bob"))
            .await
            .unwrap();

        let full = join_session_by_code(&state, &created.room_code, profile("carol")).await;
        assert!(matches!(full, Err(ServiceError::InvalidState(message)) if message == "room is full"));
    }

    /// Store whose reads take a while, so concurrent joins interleave between lookup and write.
    struct SlowReads(MemorySessionStore);

    impl SlowReads {
        fn delayed<T: Send + 'static>(
            future: BoxFuture<'static, StorageResult<T>>,
        ) -> BoxFuture<'static, StorageResult<T>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                future.await
            })
        }
    }

    impl SessionStore for SlowReads {
        fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
            self.0.insert_session(session)
        }
        fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
            Self::delayed(self.0.find_session(id))
        }
        fn find_open_session_by_code(
            &self,
            code: String,
        ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
            Self::delayed(self.0.find_open_session_by_code(code))
        }
        fn update_session_status(
            &self,
            id: Uuid,
            expected: SessionStatus,
            next: SessionStatus,
        ) -> BoxFuture<'static, StorageResult<u64>> {
            self.0.update_session_status(id, expected, next)
        }
        fn admit_member(
            &self,
            member: MemberEntity,
            policy: AdmissionPolicy,
        ) -> BoxFuture<'static, StorageResult<Admission>> {
            self.0.admit_member(member, policy)
        }
        fn list_members(
            &self,
            session_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<Vec<MemberEntity>>> {
            Self::delayed(self.0.list_members(session_id))
        }
        fn find_turn_state(
            &self,
            session_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<Option<TurnStateEntity>>> {
            self.0.find_turn_state(session_id)
        }
        fn init_turn_state(&self, turn: TurnStateEntity) -> BoxFuture<'static, StorageResult<bool>> {
            self.0.init_turn_state(turn)
        }
        fn compare_and_swap_turn(
            &self,
            guard: TurnGuard,
            next: TurnStateEntity,
        ) -> BoxFuture<'static, StorageResult<u64>> {
            self.0.compare_and_swap_turn(guard, next)
        }
        fn end_turn_state(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>> {
            self.0.end_turn_state(session_id)
        }
        fn upsert_progress(&self, progress: ProgressEntity) -> BoxFuture<'static, StorageResult<()>> {
            self.0.upsert_progress(progress)
        }
        fn list_progress(
            &self,
            session_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<Vec<ProgressEntity>>> {
            self.0.list_progress(session_id)
        }
        fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
            self.0.health_check()
        }
        fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
            self.0.try_reconnect()
        }
    }

    #[tokio::test]
    async fn concurrent_joins_cannot_exceed_the_member_cap() {
        let state = AppState::new(AppConfig {
            max_members: Some(2),
            ..AppConfig::default()
        });
        state
            .set_session_store(Arc::new(SlowReads(MemorySessionStore::new())))
            .await;
        let created = create_session(&state, profile("alice")).await.unwrap();

        let (bob, carol) = tokio::join!(
            join_session_by_code(&state, &created.room_code, profile("bob")),
            join_session_by_code(&state, &created.room_code, profile("carol")),
        );

        let admitted = [&bob, &carol].iter().filter(|result| result.is_ok()).count();
        assert_eq!(admitted, 1, "bob: {bob:?}, carol: {carol:?}");
        let refused = if bob.is_err() { bob } else { carol };
        assert!(matches!(refused, Err(ServiceError::InvalidState(_))));

        let snapshot = session_snapshot(&state, created.session_id).await.unwrap();
        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(snapshot.session.status, SessionStatus::Started);
    }

    #[tokio::test]
    async fn concurrent_joins_after_the_start_threshold_are_refused_without_late_join() {
        let state = AppState::new(AppConfig::default());
        state
            .set_session_store(Arc::new(SlowReads(MemorySessionStore::new())))
            .await;
        let created = create_session(&state, profile("alice")).await.unwrap();

        let (bob, carol) = tokio::join!(
            join_session_by_code(&state, &created.room_code, profile("bob")),
            join_session_by_code(&state, &created.room_code, profile("carol")),
        );

        let refused: Vec<_> = [bob, carol].into_iter().filter_map(Result::err).collect();
        assert_eq!(refused.len(), 1);
        assert!(
            matches!(&refused[0], ServiceError::InvalidState(message) if message.contains("already started"))
        );
        let snapshot = session_snapshot(&state, created.session_id).await.unwrap();
        assert_eq!(snapshot.members.len(), 2);
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let state = state_with(AppConfig::default()).await;
        let result = join_session_by_code(&state, "ZZZZZZ", profile("bob")).await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn ending_marks_everything_finished_and_releases_the_code() {
        let state = state_with(AppConfig::default()).await;
        let created = create_session(&state, profile("alice")).await.unwrap();
        join_session_by_code(&state, &created.room_code, profile("bob"))
            .await
            .unwrap();
        let store = state.require_store().await.unwrap();
        store
            .upsert_progress(ProgressEntity {
                session_id: created.session_id,
                user_id: "alice".into(),
                reps: 4,
                completed: false,
                updated_at: SystemTime::now(),
            })
            .await
            .unwrap();

        let outsider = end_session(&state, created.session_id, "mallory").await;
        assert!(matches!(outsider, Err(ServiceError::Unauthorized(_))));

        let ended = end_session(&state, created.session_id, "bob").await.unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        let again = end_session(&state, created.session_id, "alice").await.unwrap();
        assert_eq!(again.status, SessionStatus::Ended);

        let snapshot = session_snapshot(&state, created.session_id).await.unwrap();
        assert!(snapshot.progress.iter().all(|row| row.completed));
        assert_eq!(snapshot.progress[0].reps, 4);

        let rejoin = join_session_by_code(&state, &created.room_code, profile("bob")).await;
        assert!(matches!(rejoin, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn degraded_mode_rejects_room_operations() {
        let state = AppState::new(AppConfig::default());
        let result = create_session(&state, profile("alice")).await;
        assert!(matches!(result, Err(ServiceError::Degraded)));
    }
}
