use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::ServiceError,
    state::{
        SharedState,
        feed::{ChangeFilter, FeedMessage, FeedSubscription, Table},
        session_view::SessionUpdate,
    },
};

const WATCHED_TABLES: [Table; 4] = [
    Table::Members,
    Table::Sessions,
    Table::TurnStates,
    Table::Progress,
];

/// Disposable handle over the feed subscriptions of one session.
///
/// Dropping the handle cancels the subscriptions as well.
pub struct SessionSubscription {
    session_id: Uuid,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionSubscription {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Subscribe to every change of `session_id` and hand each one to `callback`.
///
/// Four subscriptions are opened (members, session status, turn state, progress). When one of
/// them lags, its table is reloaded from the store and replayed through `callback`.
pub fn subscribe_to_members<F>(
    state: &SharedState,
    session_id: Uuid,
    callback: F,
) -> SessionSubscription
where
    F: Fn(SessionUpdate) + Send + Sync + 'static,
{
    let callback = Arc::new(callback);
    let tasks = WATCHED_TABLES
        .into_iter()
        .map(|table| {
            let subscription = state.feed().subscribe(
                format!("session:{session_id}:{table:?}"),
                ChangeFilter { table, session_id },
            );
            tokio::spawn(forward(
                state.clone(),
                session_id,
                table,
                subscription,
                Arc::clone(&callback),
            ))
        })
        .collect();

    debug!(%session_id, "session subscriptions opened");
    SessionSubscription { session_id, tasks }
}

/// Release every subscription held by `handle`. Memberships are left untouched.
pub fn leave_session(handle: SessionSubscription) {
    info!(session_id = %handle.session_id, "left session feed");
    drop(handle);
}

async fn forward<F>(
    state: SharedState,
    session_id: Uuid,
    table: Table,
    mut subscription: FeedSubscription,
    callback: Arc<F>,
) where
    F: Fn(SessionUpdate) + Send + Sync + 'static,
{
    while let Some(message) = subscription.next().await {
        match message {
            FeedMessage::Change(event) => {
                trace!(%session_id, ?table, kind = ?event.kind, "session change delivered");
                callback(SessionUpdate::from(event.record))
            }
            FeedMessage::Resync => match reload(&state, session_id, table).await {
                Ok(updates) => updates.into_iter().for_each(|update| callback(update)),
                Err(reason) => {
                    warn!(%session_id, ?table, %reason, "failed to reload table after lag")
                }
            },
        }
    }
    subscription.unsubscribe();
}

/// Current rows of one table of a session, as updates.
async fn reload(
    state: &SharedState,
    session_id: Uuid,
    table: Table,
) -> Result<Vec<SessionUpdate>, ServiceError> {
    let store = state.require_store().await?;
    let updates = match table {
        Table::Sessions => store
            .find_session(session_id)
            .await?
            .into_iter()
            .map(SessionUpdate::Status)
            .collect(),
        Table::Members => store
            .list_members(session_id)
            .await?
            .into_iter()
            .map(SessionUpdate::Member)
            .collect(),
        Table::TurnStates => store
            .find_turn_state(session_id)
            .await?
            .into_iter()
            .map(SessionUpdate::Turn)
            .collect(),
        Table::Progress => store
            .list_progress(session_id)
            .await?
            .into_iter()
            .map(SessionUpdate::Progress)
            .collect(),
    };
    Ok(updates)
}
