//! Row-level change notifications fanned out to every subscriber of a session.
//!
//! Delivery is at-least-once and carries whole rows, so consumers replace their cached copy
//! instead of merging. A subscriber that falls behind the broadcast buffer receives a
//! [`FeedMessage::Resync`] and is expected to reload the table from the store.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dao::models::{MemberEntity, ProgressEntity, SessionEntity, TurnStateEntity};

/// Kind of mutation a change event describes. Rows are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Table a change originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Sessions,
    Members,
    TurnStates,
    Progress,
}

/// Row payload of a change event (post-image for inserts and updates).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    Session(SessionEntity),
    Member(MemberEntity),
    TurnState(TurnStateEntity),
    Progress(ProgressEntity),
}

impl ChangeRecord {
    /// Table the row lives in.
    pub fn table(&self) -> Table {
        match self {
            ChangeRecord::Session(_) => Table::Sessions,
            ChangeRecord::Member(_) => Table::Members,
            ChangeRecord::TurnState(_) => Table::TurnStates,
            ChangeRecord::Progress(_) => Table::Progress,
        }
    }

    /// Session the row is scoped to.
    pub fn session_id(&self) -> Uuid {
        match self {
            ChangeRecord::Session(session) => session.id,
            ChangeRecord::Member(member) => member.session_id,
            ChangeRecord::TurnState(turn) => turn.session_id,
            ChangeRecord::Progress(progress) => progress.session_id,
        }
    }
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: ChangeRecord,
}

impl ChangeEvent {
    pub fn insert(record: ChangeRecord) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn update(record: ChangeRecord) -> Self {
        Self {
            kind: ChangeKind::Update,
            record,
        }
    }
}

/// Scope of a subscription: one table of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: Table,
    pub session_id: Uuid,
}

impl ChangeFilter {
    fn matches(&self, event: &ChangeEvent) -> bool {
        event.record.table() == self.table && event.record.session_id() == self.session_id
    }
}

/// Item yielded by a [`FeedSubscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// A change matching the subscription filter.
    Change(ChangeEvent),
    /// Events were dropped; the consumer must reload the table snapshot.
    Resync,
}

/// Broadcast hub delivering change events to subscribers.
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    /// Construct a new feed backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send an event to all current subscribers, ignoring the absence of receivers.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.sender.send(event);
    }

    /// Open a filtered subscription. Only events published after this call are delivered.
    pub fn subscribe(&self, channel: impl Into<String>, filter: ChangeFilter) -> FeedSubscription {
        let channel = channel.into();
        debug!(%channel, table = ?filter.table, session_id = %filter.session_id, "feed subscription opened");
        FeedSubscription {
            channel,
            inner: Box::pin(filtered_stream(self.sender.subscribe(), filter)),
        }
    }
}

fn filtered_stream(
    mut receiver: broadcast::Receiver<ChangeEvent>,
    filter: ChangeFilter,
) -> impl Stream<Item = FeedMessage> + Send {
    async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(event) if filter.matches(&event) => yield FeedMessage::Change(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, table = ?filter.table, session_id = %filter.session_id, "feed subscriber lagged; requesting resync");
                    yield FeedMessage::Resync;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

/// Lazy, unbounded stream of changes for one table of one session.
pub struct FeedSubscription {
    channel: String,
    inner: Pin<Box<dyn Stream<Item = FeedMessage> + Send>>,
}

impl FeedSubscription {
    /// Release the subscription explicitly.
    pub fn unsubscribe(self) {
        debug!(channel = %self.channel, "feed subscription closed");
    }
}

impl Stream for FeedSubscription {
    type Item = FeedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
