use std::sync::Arc;

use crate::{
    config::AppConfig,
    dao::session_store::MemorySessionStore,
    services::room_service::ParticipantProfile,
    state::{AppState, SharedState},
};

/// Application state backed by a fresh in-memory store.
pub async fn state_with(config: AppConfig) -> SharedState {
    let state = AppState::new(config);
    state
        .set_session_store(Arc::new(MemorySessionStore::new()))
        .await;
    state
}

pub fn profile(user_id: &str) -> ParticipantProfile {
    ParticipantProfile {
        user_id: user_id.into(),
        display_name: user_id.to_uppercase(),
        avatar_url: None,
    }
}
