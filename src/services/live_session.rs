//! Per-participant live session agent.
//!
//! One agent runs for every connected device. It keeps a local cache of the session, drives
//! the turn coordinator from a local tick and from feed deliveries, and forwards everything the
//! device needs to render. Store failures never escape the agent: they are logged and left for
//! the next tick or the next authoritative update.

use std::time::SystemTime;

use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::TurnStateEntity,
    error::ServiceError,
    services::{
        progress_service, room_service,
        session_feed::{leave_session, subscribe_to_members},
        turn_service::{self, AdvanceOutcome},
    },
    state::{
        SharedState,
        session_view::{SessionSnapshot, SessionUpdate, SessionView},
        turn_machine::{Countdown, TurnAdvance, TurnCoordinator},
    },
};

/// Requests a device can send to its agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveCommand {
    AddRep,
    EndTurn,
    Leave,
}

/// Messages an agent emits towards its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveUpdate {
    /// Full state, sent once when the agent starts.
    Snapshot(SessionSnapshot),
    /// A change received from the feed.
    Session(SessionUpdate),
    /// Presentation clock tick.
    Countdown(Countdown),
    /// A command of the device could not be carried out.
    Rejected(String),
}

/// Local state of one participant's agent.
pub struct LiveSession {
    state: SharedState,
    user_id: String,
    view: SessionView,
    coordinator: TurnCoordinator,
}

impl LiveSession {
    /// Build an agent for `user_id` from a session snapshot.
    pub fn new(
        state: SharedState,
        snapshot: SessionSnapshot,
        user_id: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let user_id = user_id.into();
        let session_id = snapshot.session.id;
        if !snapshot
            .members
            .iter()
            .any(|member| member.user_id == user_id)
        {
            return Err(ServiceError::Unauthorized(format!(
                "`{user_id}` is not a member of session `{session_id}`"
            )));
        }

        let mut coordinator =
            TurnCoordinator::new(session_id, user_id.clone(), state.config().turn_duration);
        if let Some(turn) = snapshot.turn.clone() {
            coordinator.observe_turn(turn);
        }

        Ok(Self {
            state,
            user_id,
            view: SessionView::new(snapshot),
            coordinator,
        })
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub fn is_ended(&self) -> bool {
        self.view.is_ended()
    }

    /// Feed the snapshot roster to the coordinator, creating the turn row when due.
    pub async fn prime(&mut self, now: SystemTime) {
        self.observe_roster(now).await;
    }

    /// Apply a feed delivery. Returns whether the local cache changed.
    pub async fn apply(&mut self, update: SessionUpdate, now: SystemTime) -> bool {
        let changed = self.view.apply(update.clone());
        match update {
            SessionUpdate::Member(_) => self.observe_roster(now).await,
            SessionUpdate::Turn(turn) => {
                if self.coordinator.observe_turn(turn) {
                    debug!(
                        session_id = %self.view.session().id,
                        user_id = %self.user_id,
                        phase = ?self.coordinator.phase(),
                        "turn cache replaced"
                    );
                }
            }
            SessionUpdate::Status(_) | SessionUpdate::Progress(_) => {}
        }
        changed
    }

    /// Local clock tick: advance on timeout when due, then report the countdown.
    pub async fn tick(&mut self, now: SystemTime) -> Option<Countdown> {
        if self.is_ended() {
            return None;
        }
        if let Some(advance) = self.coordinator.poll_timeout(now) {
            if let Err(err) = self.issue_advance(advance).await {
                warn!(
                    session_id = %self.view.session().id,
                    user_id = %self.user_id,
                    error = %err,
                    "timeout advance failed; retrying on next tick"
                );
            }
        }
        self.coordinator.countdown(now)
    }

    /// Carry out a device command.
    pub async fn handle_command(
        &mut self,
        command: LiveCommand,
        now: SystemTime,
    ) -> Result<(), ServiceError> {
        match command {
            LiveCommand::AddRep => {
                if self.is_ended() {
                    return Err(ServiceError::InvalidState("session has ended".into()));
                }
                let written = progress_service::add_rep(
                    &self.state,
                    self.view.session().id,
                    &self.user_id,
                    self.view.progress_of(&self.user_id),
                )
                .await?;
                self.view.apply_progress(written);
                Ok(())
            }
            LiveCommand::EndTurn => {
                let advance = self.coordinator.end_turn(now)?;
                self.issue_advance(advance).await.map(|_| ())
            }
            LiveCommand::Leave => Ok(()),
        }
    }

    async fn observe_roster(&mut self, now: SystemTime) {
        if self.is_ended() {
            return;
        }
        let members: Vec<_> = self.view.members().cloned().collect();
        if let Some(proposal) = self.coordinator.observe_members(&members, now) {
            self.propose_initial_turn(proposal).await;
        }
    }

    async fn propose_initial_turn(&mut self, proposal: TurnStateEntity) {
        if let Err(err) = turn_service::ensure_turn_initialized(&self.state, proposal).await {
            warn!(
                session_id = %self.view.session().id,
                user_id = %self.user_id,
                error = %err,
                "failed to initialize turn play"
            );
            self.coordinator.init_failed();
        }
    }

    async fn issue_advance(&mut self, advance: TurnAdvance) -> Result<AdvanceOutcome, ServiceError> {
        match turn_service::advance_turn(&self.state, &advance).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.coordinator.advance_failed(&advance.guard);
                Err(err)
            }
        }
    }
}

/// Run the agent of `user_id` in `session_id` until the device leaves or the session ends.
///
/// The feed subscription is opened before the snapshot is read so nothing written in between
/// is missed; replayed rows are absorbed by the replace semantics of the cache.
pub async fn run(
    state: SharedState,
    session_id: Uuid,
    user_id: String,
    mut commands: mpsc::UnboundedReceiver<LiveCommand>,
    updates: mpsc::UnboundedSender<LiveUpdate>,
) -> Result<(), ServiceError> {
    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
    let subscription = subscribe_to_members(&state, session_id, move |update| {
        let _ = feed_tx.send(update);
    });

    let snapshot = room_service::session_snapshot(&state, session_id).await?;
    let mut live = LiveSession::new(state.clone(), snapshot, user_id.clone())?;
    if updates
        .send(LiveUpdate::Snapshot(live.view().snapshot()))
        .is_err()
    {
        leave_session(subscription);
        return Ok(());
    }
    live.prime(SystemTime::now()).await;

    let mut ticker = interval(state.config().tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(%session_id, %user_id, "live session agent started");

    loop {
        if live.is_ended() {
            info!(%session_id, %user_id, "session ended; stopping agent");
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(countdown) = live.tick(SystemTime::now()).await {
                    if updates.send(LiveUpdate::Countdown(countdown)).is_err() {
                        break;
                    }
                }
            }
            Some(update) = feed_rx.recv() => {
                live.apply(update.clone(), SystemTime::now()).await;
                if updates.send(LiveUpdate::Session(update)).is_err() {
                    break;
                }
            }
            command = commands.recv() => match command {
                None | Some(LiveCommand::Leave) => break,
                Some(command) => {
                    if let Err(err) = live.handle_command(command.clone(), SystemTime::now()).await {
                        warn!(%session_id, %user_id, ?command, error = %err, "command rejected");
                        if updates.send(LiveUpdate::Rejected(err.to_string())).is_err() {
                            break;
                        }
                    }
                }
            },
        }
    }

    leave_session(subscription);
    info!(%session_id, %user_id, "live session agent stopped");
    Ok(())
}
