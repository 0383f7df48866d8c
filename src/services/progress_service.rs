use std::time::SystemTime;

use tracing::debug;
use uuid::Uuid;

use crate::{
    dao::models::{ProgressEntity, SessionStatus},
    error::ServiceError,
    state::SharedState,
};

/// Record one more repetition for `user_id`.
///
/// The new count is derived from `cached`, the last row the caller received, not from a fresh
/// store read. The write is a replace keyed by (session, user), so a duplicated feed echo of it
/// is harmless.
pub async fn add_rep(
    state: &SharedState,
    session_id: Uuid,
    user_id: &str,
    cached: Option<&ProgressEntity>,
) -> Result<ProgressEntity, ServiceError> {
    let store = state.require_store().await?;
    let session = store
        .find_session(session_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))?;
    if session.status == SessionStatus::Ended {
        return Err(ServiceError::InvalidState("session has ended".into()));
    }

    let progress = ProgressEntity {
        session_id,
        user_id: user_id.to_owned(),
        reps: cached.map_or(0, |row| row.reps) + 1,
        completed: false,
        updated_at: SystemTime::now(),
    };
    store.upsert_progress(progress.clone()).await?;
    debug!(%session_id, %user_id, reps = progress.reps, "rep recorded");
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        services::{
            room_service::{create_session, end_session},
            test_support::{profile, state_with},
        },
    };

    #[tokio::test]
    async fn reps_build_on_the_cached_row() {
        let state = state_with(AppConfig::default()).await;
        let created = create_session(&state, profile("alice")).await.unwrap();

        let first = add_rep(&state, created.session_id, "alice", None)
            .await
            .unwrap();
        let second = add_rep(&state, created.session_id, "alice", Some(&first))
            .await
            .unwrap();
        assert_eq!(second.reps, 2);

        let store = state.require_store().await.unwrap();
        let rows = store.list_progress(created.session_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reps, 2);
    }

    #[tokio::test]
    async fn stale_cache_overwrites_instead_of_double_counting() {
        let state = state_with(AppConfig::default()).await;
        let created = create_session(&state, profile("alice")).await.unwrap();
        let first = add_rep(&state, created.session_id, "alice", None)
            .await
            .unwrap();

        add_rep(&state, created.session_id, "alice", Some(&first))
            .await
            .unwrap();
        let replay = add_rep(&state, created.session_id, "alice", Some(&first))
            .await
            .unwrap();
        assert_eq!(replay.reps, 2);
    }

    #[tokio::test]
    async fn reps_are_rejected_after_the_session_ended() {
        let state = state_with(AppConfig::default()).await;
        let created = create_session(&state, profile("alice")).await.unwrap();
        end_session(&state, created.session_id, "alice")
            .await
            .unwrap();

        let result = add_rep(&state, created.session_id, "alice", None).await;
        assert!(matches!(result, Err(ServiceError::InvalidState(_))));
    }
}
