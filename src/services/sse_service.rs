use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::sse::{Handshake, ServerEvent, SessionUpdateEvent, SystemStatus},
    error::ServiceError,
    services::{
        room_service,
        session_feed::{leave_session, subscribe_to_members},
    },
    state::{SharedState, session_view::SessionUpdate},
};

/// Stream every change of `session_id` as SSE events named after the update type.
///
/// The stream opens with a `handshake` event, then carries `member`, `status`, `progress` and
/// `turn` events whose data is `{"type": ..., "data": ...}`. Degraded mode changes are
/// reported as `system_status` events.
pub async fn session_stream(
    state: &SharedState,
    session_id: Uuid,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + use<>>, ServiceError> {
    // fail fast on unknown sessions
    room_service::session_snapshot(state, session_id).await?;

    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<SessionUpdate>();
    let subscription = subscribe_to_members(state, session_id, move |update| {
        let _ = update_tx.send(update);
    });
    let mut degraded = state.degraded_watcher();
    let handshake = Handshake {
        session_id,
        message: "session stream connected".into(),
        degraded: *degraded.borrow_and_update(),
    };

    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    // forwarder task: reads session updates and pushes SSE events into the response channel
    tokio::spawn(async move {
        if let Some(event) = to_event(ServerEvent::json(Some("handshake".to_string()), &handshake)) {
            let _ = tx.send(Ok(event)).await;
        }

        loop {
            let payload = tokio::select! {
                _ = tx.closed() => break,
                update = update_rx.recv() => match update {
                    Some(update) => {
                        let update = SessionUpdateEvent::from(update);
                        ServerEvent::json(Some(update.name().to_string()), &update)
                    }
                    None => break,
                },
                changed = degraded.changed() => match changed {
                    Ok(()) => {
                        let status = SystemStatus { degraded: *degraded.borrow_and_update() };
                        ServerEvent::json(Some("system_status".to_string()), &status)
                    }
                    Err(_) => break,
                },
            };

            let Some(event) = to_event(payload) else {
                continue;
            };
            if tx.send(Ok(event)).await.is_err() {
                break;
            }
        }

        leave_session(subscription);
        info!(%session_id, "session SSE stream disconnected");
    });

    // response stream reads from mpsc; when client disconnects axum drops this stream
    let stream = ReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn to_event(payload: serde_json::Result<ServerEvent>) -> Option<Event> {
    match payload {
        Ok(payload) => {
            let mut event = Event::default().data(payload.data);
            if let Some(name) = payload.event {
                event = event.event(name);
            }
            Some(event)
        }
        Err(err) => {
            warn!(error = %err, "failed to serialize SSE payload");
            None
        }
    }
}
