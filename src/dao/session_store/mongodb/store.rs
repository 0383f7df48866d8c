use std::{sync::Arc, time::SystemTime};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{DateTime, doc},
    options::{IndexOptions, ReturnDocument},
};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    models::{
        MongoMemberDocument, MongoProgressDocument, MongoSessionDocument, MongoTurnDocument,
        admission_filter, admission_update, doc_id, index_to_i64, member_key, turn_guard_filter,
    },
};
use crate::dao::{
    models::{
        Admission, AdmissionPolicy, AdmissionRefusal, MemberEntity, ProgressEntity,
        SessionEntity, SessionStatus, TurnGuard, TurnStateEntity, TurnStatus,
    },
    session_store::SessionStore,
    storage::StorageResult,
};

const SESSION_COLLECTION: &str = "sessions";
const MEMBER_COLLECTION: &str = "members";
const TURN_COLLECTION: &str = "turn_states";
const PROGRESS_COLLECTION: &str = "progress";

/// MongoDB-backed [`SessionStore`].
#[derive(Clone)]
pub struct MongoSessionStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    #[allow(dead_code)]
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

impl MongoSessionStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        info!("MongoDB session store ready");
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let open_codes = IndexModel::builder()
            .keys(doc! {"room_code": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("open_room_code_idx".to_owned()))
                    .unique(Some(true))
                    .partial_filter_expression(Some(doc! {"open": true}))
                    .build(),
            )
            .build();
        self.sessions()
            .await
            .create_index(open_codes)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: SESSION_COLLECTION,
                index: "room_code",
                source,
            })?;

        for (collection, name) in [
            (MEMBER_COLLECTION, "member_session_user_idx"),
            (PROGRESS_COLLECTION, "progress_session_user_idx"),
        ] {
            let index = IndexModel::builder()
                .keys(doc! {"session_id": 1, "user_id": 1})
                .options(
                    IndexOptions::builder()
                        .name(Some(name.to_owned()))
                        .unique(Some(true))
                        .build(),
                )
                .build();
            self.database()
                .await
                .collection::<mongodb::bson::Document>(collection)
                .create_index(index)
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection,
                    index: "session_id,user_id",
                    source,
                })?;
        }

        Ok(())
    }

    async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    async fn sessions(&self) -> Collection<MongoSessionDocument> {
        self.database().await.collection(SESSION_COLLECTION)
    }

    async fn members(&self) -> Collection<MongoMemberDocument> {
        self.database().await.collection(MEMBER_COLLECTION)
    }

    async fn turns(&self) -> Collection<MongoTurnDocument> {
        self.database().await.collection(TURN_COLLECTION)
    }

    async fn progress(&self) -> Collection<MongoProgressDocument> {
        self.database().await.collection(PROGRESS_COLLECTION)
    }

    async fn insert_session(&self, session: SessionEntity) -> MongoResult<()> {
        let id = session.id;
        let code = session.room_code.clone();
        let document: MongoSessionDocument = session.into();
        match self.sessions().await.insert_one(&document).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(MongoDaoError::RoomCodeTaken { code }),
            Err(source) => Err(MongoDaoError::SaveSession { id, source }),
        }
    }

    async fn find_session(&self, id: Uuid) -> MongoResult<Option<SessionEntity>> {
        self.sessions()
            .await
            .find_one(doc_id(id))
            .await
            .map_err(|source| MongoDaoError::LoadSession { id, source })?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn find_open_session_by_code(&self, code: String) -> MongoResult<Option<SessionEntity>> {
        self.sessions()
            .await
            .find_one(doc! {"room_code": code.as_str(), "open": true})
            .await
            .map_err(|source| MongoDaoError::LookupCode {
                code: code.clone(),
                source,
            })?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn update_session_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> MongoResult<u64> {
        let result = self
            .sessions()
            .await
            .update_one(
                doc! {"_id": id.to_string(), "status": expected.as_str()},
                doc! {"$set": {
                    "status": next.as_str(),
                    "open": next.is_open(),
                    "updated_at": DateTime::now(),
                }},
            )
            .await
            .map_err(|source| MongoDaoError::SaveSession { id, source })?;
        Ok(result.matched_count)
    }

    async fn admit_member(
        &self,
        member: MemberEntity,
        policy: AdmissionPolicy,
    ) -> MongoResult<Admission> {
        let id = member.session_id;
        let existing = self
            .members()
            .await
            .find_one(member_key(id, &member.user_id))
            .await
            .map_err(|source| MongoDaoError::LoadSession { id, source })?;
        if existing.is_some() {
            return self.already_member(id).await;
        }

        let before = self
            .sessions()
            .await
            .find_one_and_update(admission_filter(id, &policy), admission_update(&policy))
            .return_document(ReturnDocument::Before)
            .await
            .map_err(|source| MongoDaoError::SaveSession { id, source })?;
        let Some(before) = before else {
            return self.refusal(id, policy).await;
        };

        if !self.insert_member(member.clone()).await? {
            // same user joining twice concurrently: give the seat back
            self.sessions()
                .await
                .update_one(doc_id(id), doc! {"$inc": {"member_count": -1}})
                .await
                .map_err(|source| MongoDaoError::SaveSession { id, source })?;
            return self.already_member(id).await;
        }

        let started = policy.starts(before.status(), before.member_count() + 1);
        let mut session: SessionEntity = before.try_into()?;
        if started {
            session.status = SessionStatus::Started;
            session.updated_at = SystemTime::now();
        }
        Ok(Admission::Admitted {
            member,
            session,
            started,
        })
    }

    async fn already_member(&self, id: Uuid) -> MongoResult<Admission> {
        Ok(match self.find_session(id).await? {
            Some(session) => Admission::AlreadyMember { session },
            None => Admission::Refused(AdmissionRefusal::NotFound),
        })
    }

    /// Explain why the guarded admission update matched nothing.
    async fn refusal(&self, id: Uuid, policy: AdmissionPolicy) -> MongoResult<Admission> {
        let document = self
            .sessions()
            .await
            .find_one(doc_id(id))
            .await
            .map_err(|source| MongoDaoError::LoadSession { id, source })?;
        let refusal = match document {
            None => AdmissionRefusal::NotFound,
            Some(document) => policy
                .check(document.status(), document.member_count())
                .err()
                .unwrap_or(AdmissionRefusal::Full),
        };
        Ok(Admission::Refused(refusal))
    }

    async fn insert_member(&self, member: MemberEntity) -> MongoResult<bool> {
        let id = member.session_id;
        let result = self
            .members()
            .await
            .update_one(
                member_key(member.session_id, &member.user_id),
                doc! {"$setOnInsert": {
                    "display_name": member.display_name.as_str(),
                    "avatar_url": member.avatar_url.clone(),
                    "joined_at": DateTime::from_system_time(member.joined_at),
                }},
            )
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Write {
                collection: MEMBER_COLLECTION,
                id,
                source,
            })?;
        Ok(result.upserted_id.is_some())
    }

    async fn list_members(&self, session_id: Uuid) -> MongoResult<Vec<MemberEntity>> {
        let documents: Vec<MongoMemberDocument> = self
            .members()
            .await
            .find(doc! {"session_id": session_id.to_string()})
            .sort(doc! {"joined_at": 1, "user_id": 1})
            .await
            .map_err(|source| MongoDaoError::LoadSession {
                id: session_id,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadSession {
                id: session_id,
                source,
            })?;

        documents.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_turn_state(&self, session_id: Uuid) -> MongoResult<Option<TurnStateEntity>> {
        self.turns()
            .await
            .find_one(doc_id(session_id))
            .await
            .map_err(|source| MongoDaoError::LoadSession {
                id: session_id,
                source,
            })?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn init_turn_state(&self, turn: TurnStateEntity) -> MongoResult<bool> {
        let id = turn.session_id;
        let result = self
            .turns()
            .await
            .update_one(
                doc_id(id),
                doc! {"$setOnInsert": {
                    "current_player": turn.current_player.as_str(),
                    "turn_index": index_to_i64(turn.turn_index),
                    "deadline": DateTime::from_system_time(turn.deadline),
                    "status": turn.status.as_str(),
                }},
            )
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Write {
                collection: TURN_COLLECTION,
                id,
                source,
            })?;
        Ok(result.upserted_id.is_some())
    }

    async fn compare_and_swap_turn(
        &self,
        guard: TurnGuard,
        next: TurnStateEntity,
    ) -> MongoResult<u64> {
        let id = next.session_id;
        let document: MongoTurnDocument = next.into();
        let result = self
            .turns()
            .await
            .replace_one(turn_guard_filter(id, &guard), &document)
            .await
            .map_err(|source| MongoDaoError::Write {
                collection: TURN_COLLECTION,
                id,
                source,
            })?;
        Ok(result.matched_count)
    }

    async fn end_turn_state(&self, session_id: Uuid) -> MongoResult<u64> {
        let result = self
            .turns()
            .await
            .update_one(
                doc! {"_id": session_id.to_string(), "status": TurnStatus::Active.as_str()},
                doc! {"$set": {"status": TurnStatus::Ended.as_str()}},
            )
            .await
            .map_err(|source| MongoDaoError::Write {
                collection: TURN_COLLECTION,
                id: session_id,
                source,
            })?;
        Ok(result.matched_count)
    }

    async fn upsert_progress(&self, progress: ProgressEntity) -> MongoResult<()> {
        let id = progress.session_id;
        let filter = member_key(progress.session_id, &progress.user_id);
        let document: MongoProgressDocument = progress.into();
        self.progress()
            .await
            .replace_one(filter, &document)
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Write {
                collection: PROGRESS_COLLECTION,
                id,
                source,
            })?;
        Ok(())
    }

    async fn list_progress(&self, session_id: Uuid) -> MongoResult<Vec<ProgressEntity>> {
        let documents: Vec<MongoProgressDocument> = self
            .progress()
            .await
            .find(doc! {"session_id": session_id.to_string()})
            .sort(doc! {"user_id": 1})
            .await
            .map_err(|source| MongoDaoError::LoadSession {
                id: session_id,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadSession {
                id: session_id,
                source,
            })?;

        documents.into_iter().map(TryInto::try_into).collect()
    }
}

impl SessionStore for MongoSessionStore {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert_session(session).await.map_err(Into::into) })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_session(id).await.map_err(Into::into) })
    }

    fn find_open_session_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_open_session_by_code(code)
                .await
                .map_err(Into::into)
        })
    }

    fn update_session_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .update_session_status(id, expected, next)
                .await
                .map_err(Into::into)
        })
    }

    fn admit_member(
        &self,
        member: MemberEntity,
        policy: AdmissionPolicy,
    ) -> BoxFuture<'static, StorageResult<Admission>> {
        let store = self.clone();
        Box::pin(async move { store.admit_member(member, policy).await.map_err(Into::into) })
    }

    fn list_members(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<MemberEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_members(session_id).await.map_err(Into::into) })
    }

    fn find_turn_state(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<TurnStateEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_turn_state(session_id).await.map_err(Into::into) })
    }

    fn init_turn_state(&self, turn: TurnStateEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.init_turn_state(turn).await.map_err(Into::into) })
    }

    fn compare_and_swap_turn(
        &self,
        guard: TurnGuard,
        next: TurnStateEntity,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .compare_and_swap_turn(guard, next)
                .await
                .map_err(Into::into)
        })
    }

    fn end_turn_state(&self, session_id: Uuid) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move { store.end_turn_state(session_id).await.map_err(Into::into) })
    }

    fn upsert_progress(&self, progress: ProgressEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.upsert_progress(progress).await.map_err(Into::into) })
    }

    fn list_progress(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ProgressEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_progress(session_id).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
