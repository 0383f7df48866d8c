use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{ParticipantInboundMessage, ParticipantOutboundMessage},
    services::live_session::{self, LiveCommand, LiveUpdate},
    state::{ParticipantConnection, SharedState},
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle the full lifecycle of a participant WebSocket connection to `session_id`.
pub async fn handle_socket(state: SharedState, session_id: Uuid, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(%session_id, error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!(%session_id, "websocket identification timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let user_id = match ParticipantInboundMessage::from_json_str(&initial_message) {
        Ok(ParticipantInboundMessage::Identification { user_id }) => user_id,
        Ok(_) => {
            warn!(%session_id, "first message was not identification");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(err) => {
            warn!(%session_id, error = %err, "failed to parse or validate participant message");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel::<LiveCommand>();
    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<LiveUpdate>();
    let key = (session_id, user_id.clone());
    let connection_id = Uuid::new_v4();
    state.register_participant(
        key.clone(),
        ParticipantConnection {
            connection_id,
            commands: command_tx.clone(),
        },
    );
    info!(%session_id, %user_id, "participant connected");

    let agent_task = {
        let state = state.clone();
        let user_id = user_id.clone();
        let error_tx = update_tx.clone();
        tokio::spawn(async move {
            if let Err(err) =
                live_session::run(state, session_id, user_id.clone(), command_rx, update_tx).await
            {
                warn!(%session_id, %user_id, error = %err, "live session agent refused");
                let _ = error_tx.send(LiveUpdate::Rejected(err.to_string()));
            }
        })
    };

    // Agent output is serialised onto the socket; when the agent stops the socket is closed.
    let forward_task = {
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                let message = ParticipantOutboundMessage::from(update);
                if send_message_to_websocket(&outbound_tx, &message).is_err() {
                    break;
                }
            }
            let _ = outbound_tx.send(Message::Close(None));
        })
    };

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match ParticipantInboundMessage::from_json_str(&text) {
                Ok(ParticipantInboundMessage::Identification { .. }) => {
                    warn!(%session_id, %user_id, "ignoring duplicate identification message");
                }
                Ok(ParticipantInboundMessage::Unknown) => {
                    warn!(%session_id, %user_id, payload = %text, "ignoring unknown message type");
                }
                Ok(inbound) => {
                    let Some(command) = inbound.command() else {
                        continue;
                    };
                    if command_tx.send(command).is_err() {
                        info!(%session_id, %user_id, "agent stopped; closing connection");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%session_id, %user_id, error = %err, "failed to parse or validate participant message");
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(%session_id, %user_id, "participant closed");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(%session_id, %user_id, error = %err, "websocket error");
                break;
            }
        }
    }

    let _ = command_tx.send(LiveCommand::Leave);
    drop(command_tx);
    state.unregister_participant(&key, connection_id);
    let _ = agent_task.await;
    let _ = forward_task.await;
    info!(%session_id, %user_id, "participant disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// The writer half of the socket is gone.
#[derive(Debug, Error)]
#[error("connection closed")]
struct ConnectionClosed;

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Serialization failures are logged and swallowed; a closed writer is reported as an error.
fn send_message_to_websocket<T>(
    tx: &mpsc::UnboundedSender<Message>,
    value: &T,
) -> Result<(), ConnectionClosed>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}`");
            return Ok(());
        }
    };

    tx.send(Message::Text(payload.into()))
        .map_err(|_| ConnectionClosed)
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
