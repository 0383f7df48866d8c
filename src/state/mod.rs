pub mod feed;
pub mod session_view;
pub mod turn_machine;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::session_store::{FeedingStore, SessionStore},
    error::ServiceError,
    services::live_session::LiveCommand,
};

use self::feed::ChangeFeed;

pub type SharedState = Arc<AppState>;

/// Key of a connected participant: one live agent per (session, user).
pub type ParticipantKey = (Uuid, String);

#[derive(Clone)]
/// Handle used to drive the live session agent of a connected participant.
pub struct ParticipantConnection {
    /// Distinguishes successive connections of the same participant.
    pub connection_id: Uuid,
    pub commands: mpsc::UnboundedSender<LiveCommand>,
}

/// Central application state: storage handle, change feed, configuration and live agents.
pub struct AppState {
    session_store: RwLock<Option<Arc<dyn SessionStore>>>,
    feed: Arc<ChangeFeed>,
    config: Arc<AppConfig>,
    participants: DashMap<ParticipantKey, ParticipantConnection>,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            session_store: RwLock::new(None),
            feed: Arc::new(ChangeFeed::new(config.feed_capacity)),
            config: Arc::new(config),
            participants: DashMap::new(),
            degraded: degraded_tx,
        })
    }

    /// Obtain a handle to the current session store, if one is installed.
    pub async fn session_store(&self) -> Option<Arc<dyn SessionStore>> {
        let guard = self.session_store.read().await;
        guard.as_ref().cloned()
    }

    /// Return the session store or fail with [`ServiceError::Degraded`].
    pub async fn require_store(&self) -> Result<Arc<dyn SessionStore>, ServiceError> {
        if self.is_degraded().await {
            return Err(ServiceError::Degraded);
        }
        self.session_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a storage backend, wiring its writes into the change feed, and leave degraded mode.
    pub async fn set_session_store(&self, backend: Arc<dyn SessionStore>) {
        let store: Arc<dyn SessionStore> =
            Arc::new(FeedingStore::new(backend, Arc::clone(&self.feed)));
        {
            let mut guard = self.session_store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false).await;
    }

    /// Remove the current session store and enter degraded mode.
    pub async fn clear_session_store(&self) {
        {
            let mut guard = self.session_store.write().await;
            guard.take();
        }
        self.update_degraded(true).await;
    }

    /// Current degraded flag.
    pub async fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub async fn update_degraded(&self, value: bool) {
        let changed = self.degraded.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
        if changed {
            info!(degraded = value, "degraded mode changed");
        }
    }

    /// Change feed shared by every session.
    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    pub fn config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    /// Registry of connected participants keyed by (session, user).
    pub fn participants(&self) -> &DashMap<ParticipantKey, ParticipantConnection> {
        &self.participants
    }

    /// Register a participant connection, telling a previous connection of the same
    /// participant to leave.
    pub fn register_participant(&self, key: ParticipantKey, connection: ParticipantConnection) {
        if let Some(previous) = self.participants.insert(key.clone(), connection) {
            info!(session_id = %key.0, user_id = %key.1, "participant reconnected; closing previous agent");
            let _ = previous.commands.send(LiveCommand::Leave);
        }
    }

    /// Remove a participant connection unless it was already replaced by a newer one.
    pub fn unregister_participant(&self, key: &ParticipantKey, connection_id: Uuid) {
        self.participants
            .remove_if(key, |_, connection| connection.connection_id == connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::session_store::MemorySessionStore;

    #[tokio::test]
    async fn store_is_required_outside_degraded_mode() {
        let state = AppState::new(AppConfig::default());
        assert!(matches!(
            state.require_store().await,
            Err(ServiceError::Degraded)
        ));

        state
            .set_session_store(Arc::new(MemorySessionStore::new()))
            .await;
        assert!(state.require_store().await.is_ok());

        state.update_degraded(true).await;
        assert!(matches!(
            state.require_store().await,
            Err(ServiceError::Degraded)
        ));
    }

    #[tokio::test]
    async fn degraded_watcher_sees_changes_only() {
        let state = AppState::new(AppConfig::default());
        let mut watcher = state.degraded_watcher();

        state.update_degraded(true).await;
        assert!(!watcher.has_changed().unwrap());

        state.update_degraded(false).await;
        assert!(watcher.has_changed().unwrap());
        assert!(!*watcher.borrow_and_update());
    }

    #[tokio::test]
    async fn reconnecting_participant_replaces_the_previous_agent() {
        let state = AppState::new(AppConfig::default());
        let key = (Uuid::new_v4(), "alice".to_string());
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, _second_rx) = mpsc::unbounded_channel();
        let first_id = Uuid::new_v4();
        let second_id = Uuid::new_v4();

        state.register_participant(
            key.clone(),
            ParticipantConnection {
                connection_id: first_id,
                commands: first_tx,
            },
        );
        state.register_participant(
            key.clone(),
            ParticipantConnection {
                connection_id: second_id,
                commands: second_tx,
            },
        );
        assert!(matches!(first_rx.recv().await, Some(LiveCommand::Leave)));

        state.unregister_participant(&key, first_id);
        assert!(state.participants().contains_key(&key));
        state.unregister_participant(&key, second_id);
        assert!(!state.participants().contains_key(&key));
    }
}
