use std::sync::Arc;

use futures::future::BoxFuture;
use uuid::Uuid;

use super::SessionStore;
use crate::{
    dao::{
        models::{
            Admission, AdmissionPolicy, MemberEntity, ProgressEntity, SessionEntity,
            SessionStatus, TurnGuard, TurnStateEntity,
        },
        storage::StorageResult,
    },
    state::feed::{ChangeEvent, ChangeFeed, ChangeRecord},
};

/// Store decorator publishing a change event after every write that affected a row.
///
/// Conditional writes that matched nothing and duplicate member inserts stay silent.
#[derive(Clone)]
pub struct FeedingStore {
    inner: Arc<dyn SessionStore>,
    feed: Arc<ChangeFeed>,
}

impl FeedingStore {
    pub fn new(inner: Arc<dyn SessionStore>, feed: Arc<ChangeFeed>) -> Self {
        Self { inner, feed }
    }
}

impl SessionStore for FeedingStore {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.inner.insert_session(session.clone()).await?;
            store
                .feed
                .publish(ChangeEvent::insert(ChangeRecord::Session(session)));
            Ok(())
        })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        self.inner.find_session(id)
    }

    fn find_open_session_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        self.inner.find_open_session_by_code(code)
    }

    fn update_session_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            let affected = store.inner.update_session_status(id, expected, next).await?;
            if affected > 0 {
                if let Some(session) = store.inner.find_session(id).await? {
                    store
                        .feed
                        .publish(ChangeEvent::update(ChangeRecord::Session(session)));
                }
            }
            Ok(affected)
        })
    }

    fn admit_member(
        &self,
        member: MemberEntity,
        policy: AdmissionPolicy,
    ) -> BoxFuture<'static, StorageResult<Admission>> {
        let store = self.clone();
        Box::pin(async move {
            let admission = store.inner.admit_member(member, policy).await?;
            if let Admission::Admitted {
                member,
                session,
                started,
            } = &admission
            {
                store
                    .feed
                    .publish(ChangeEvent::insert(ChangeRecord::Member(member.clone())));
                if *started {
                    store
                        .feed
                        .publish(ChangeEvent::update(ChangeRecord::Session(session.clone())));
                }
            }
            Ok(admission)
        })
    }

    fn list_members(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<MemberEntity>>> {
        self.inner.list_members(session_id)
    }

    fn find_turn_state(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<TurnStateEntity>>> {
        self.inner.find_turn_state(session_id)
    }

    fn init_turn_state(&self, turn: TurnStateEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let created = store.inner.init_turn_state(turn.clone()).await?;
            if created {
                store
                    .feed
                    .publish(ChangeEvent::insert(ChangeRecord::TurnState(turn)));
            }
            Ok(created)
        })
    }

    fn compare_and_swap_turn(
        &self,
        guard: TurnGuard,
        next: TurnStateEntity,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            let affected = store
                .inner
                .compare_and_swap_turn(guard, next.clone())
                .await?;
            if affected > 0 {
                store
                    .feed
                    .publish(ChangeEvent::update(ChangeRecord::TurnState(next)));
            }
            Ok(affected)
        })
    }

    fn end_turn_state(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            let affected = store.inner.end_turn_state(session_id).await?;
            if affected > 0 {
                if let Some(turn) = store.inner.find_turn_state(session_id).await? {
                    store
                        .feed
                        .publish(ChangeEvent::update(ChangeRecord::TurnState(turn)));
                }
            }
            Ok(affected)
        })
    }

    fn upsert_progress(&self, progress: ProgressEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.inner.upsert_progress(progress.clone()).await?;
            store
                .feed
                .publish(ChangeEvent::update(ChangeRecord::Progress(progress)));
            Ok(())
        })
    }

    fn list_progress(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ProgressEntity>>> {
        self.inner.list_progress(session_id)
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.health_check()
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.try_reconnect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use futures::StreamExt;

    use super::*;
    use crate::{
        dao::{models::TurnStatus, session_store::MemorySessionStore},
        state::feed::{ChangeFilter, ChangeKind, FeedMessage, Table},
    };

    fn turn(session_id: Uuid, player: &str, index: u64) -> TurnStateEntity {
        TurnStateEntity {
            session_id,
            current_player: player.into(),
            turn_index: index,
            deadline: SystemTime::now(),
            status: TurnStatus::Active,
        }
    }

    #[tokio::test]
    async fn only_effective_writes_are_published() {
        let feed = Arc::new(ChangeFeed::new(16));
        let store = FeedingStore::new(Arc::new(MemorySessionStore::new()), feed.clone());
        let session_id = Uuid::new_v4();
        let mut sub = feed.subscribe(
            "turn",
            ChangeFilter {
                table: Table::TurnStates,
                session_id,
            },
        );

        assert!(store.init_turn_state(turn(session_id, "a", 0)).await.unwrap());
        assert!(!store.init_turn_state(turn(session_id, "a", 0)).await.unwrap());
        let guard = turn(session_id, "a", 0).guard();
        assert_eq!(
            store
                .compare_and_swap_turn(guard.clone(), turn(session_id, "b", 1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .compare_and_swap_turn(guard, turn(session_id, "b", 1))
                .await
                .unwrap(),
            0
        );
        store.end_turn_state(session_id).await.unwrap();

        let mut indexes = Vec::new();
        for _ in 0..3 {
            match sub.next().await {
                Some(FeedMessage::Change(ChangeEvent {
                    record: ChangeRecord::TurnState(turn),
                    ..
                })) => indexes.push((turn.turn_index, turn.status)),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(
            indexes,
            vec![
                (0, TurnStatus::Active),
                (1, TurnStatus::Active),
                (1, TurnStatus::Ended)
            ]
        );
    }

    #[tokio::test]
    async fn admission_publishes_the_member_and_the_start() {
        let feed = Arc::new(ChangeFeed::new(16));
        let store = FeedingStore::new(Arc::new(MemorySessionStore::new()), feed.clone());
        let now = SystemTime::now();
        let session = SessionEntity {
            id: Uuid::new_v4(),
            room_code: "FEED01".into(),
            status: SessionStatus::Waiting,
            created_at: now,
            updated_at: now,
        };
        let session_id = session.id;
        store.insert_session(session).await.unwrap();
        let mut members = feed.subscribe(
            "members",
            ChangeFilter {
                table: Table::Members,
                session_id,
            },
        );
        let mut sessions = feed.subscribe(
            "sessions",
            ChangeFilter {
                table: Table::Sessions,
                session_id,
            },
        );
        let policy = AdmissionPolicy {
            allow_late_join: false,
            max_members: None,
            start_threshold: 2,
        };
        let member = |user_id: &str| MemberEntity {
            session_id,
            user_id: user_id.into(),
            display_name: user_id.into(),
            avatar_url: None,
            joined_at: SystemTime::now(),
        };

        store.admit_member(member("a"), policy).await.unwrap();
        store.admit_member(member("a"), policy).await.unwrap();
        store.admit_member(member("b"), policy).await.unwrap();
        store.admit_member(member("c"), policy).await.unwrap();

        let mut joined = Vec::new();
        for _ in 0..2 {
            match members.next().await {
                Some(FeedMessage::Change(ChangeEvent {
                    kind: ChangeKind::Insert,
                    record: ChangeRecord::Member(member),
                })) => joined.push(member.user_id),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(joined, vec!["a", "b"]);

        match sessions.next().await {
            Some(FeedMessage::Change(ChangeEvent {
                kind: ChangeKind::Update,
                record: ChangeRecord::Session(session),
            })) => assert_eq!(session.status, SessionStatus::Started),
            other => panic!("unexpected message: {other:?}"),
        }
        drop(store);
        drop(feed);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), members.next())
                .await
                .map_or(true, |message| message.is_none())
        );
    }
}
