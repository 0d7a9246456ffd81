//! Study session coordinator.
//!
//! Glue between the presentation layer and the two engines: UI actions go
//! out through the signaling channel or the [`CallOrchestrator`], and
//! navigation, roster and call notifications come back as [`UiEvent`]s.
//!
//! ```text
//!   UI ──enter/navigate/start_call──► StudyCoordinator ──► SignalingChannel
//!   ▲                                     │    │
//!   └────────── UiEvent (broadcast) ◄─────┘    └──► CallOrchestrator
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::call::{CallError, CallEvent, CallOrchestrator, CallState};
use crate::clock::{Clock, SystemClock};
use crate::navigation::NavigationEvent;
use crate::protocol::{ParticipantInfo, RoomId, SignalMessage};
use crate::signaling::{SignalError, SignalingChannel};

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Room membership changed.
    Roster {
        room: RoomId,
        participants: Vec<ParticipantInfo>,
        position: Option<String>,
    },
    PositionChanged(NavigationEvent),
    ConflictResolved {
        winner: NavigationEvent,
        rejected: Vec<NavigationEvent>,
        /// One of the local user's moves lost the arbitration
        overridden_self: bool,
    },
    CallState(CallState),
    /// Human-readable call failure
    CallError(String),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Not in a room")]
    NotInRoom,
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Call(#[from] CallError),
}

struct Presence {
    room: RoomId,
    relay: JoinHandle<()>,
}

pub struct StudyCoordinator {
    signaling: Arc<dyn SignalingChannel>,
    call: CallOrchestrator,
    clock: Arc<dyn Clock>,
    ui: broadcast::Sender<UiEvent>,
    call_state: Option<watch::Receiver<CallState>>,
    presence: Mutex<Option<Presence>>,
}

impl StudyCoordinator {
    /// Build a coordinator over `signaling`. `call` must use the same
    /// channel. The coordinator takes the call's state receiver and
    /// republishes state changes as [`UiEvent::CallState`].
    pub fn new(signaling: Arc<dyn SignalingChannel>, call: CallOrchestrator) -> Self {
        Self::with_clock(signaling, call, Arc::new(SystemClock))
    }

    pub fn with_clock(
        signaling: Arc<dyn SignalingChannel>,
        call: CallOrchestrator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let call_state = call.take_state_rx();
        if call_state.is_none() {
            log::warn!("Call state receiver already taken; call state will not reach the UI");
        }
        let (ui, _) = broadcast::channel(256);
        Self {
            signaling,
            call,
            clock,
            ui,
            call_state,
            presence: Mutex::new(None),
        }
    }

    pub fn participant(&self) -> &ParticipantInfo {
        self.signaling.participant()
    }

    pub fn call(&self) -> &CallOrchestrator {
        &self.call
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    /// Room currently entered, if any.
    pub fn room(&self) -> Option<RoomId> {
        self.lock_presence().as_ref().map(|p| p.room)
    }

    fn lock_presence(&self) -> MutexGuard<'_, Option<Presence>> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `room`, leaving the current one first.
    pub async fn enter_room(&self, room: RoomId) -> Result<(), CoordinatorError> {
        if self.room() == Some(room) {
            return Ok(());
        }
        self.leave_room().await;

        // Subscribe before joining so the first snapshot is not missed.
        let relay = tokio::spawn(relay(
            room,
            self.participant().clone(),
            self.signaling.subscribe(),
            self.call.subscribe(),
            self.call_state.clone(),
            self.ui.clone(),
        ));

        if let Err(e) = self.signaling.join_room(room).await {
            relay.abort();
            return Err(e.into());
        }
        log::info!("{} entered room {room}", self.participant().name);
        *self.lock_presence() = Some(Presence { room, relay });
        Ok(())
    }

    /// Ask the room to move to `position`.
    pub async fn navigate(&self, position: impl Into<String>) -> Result<(), CoordinatorError> {
        let room = self.room().ok_or(CoordinatorError::NotInRoom)?;
        self.signaling
            .emit(SignalMessage::Navigate {
                room,
                position: position.into(),
                actor: self.participant().clone(),
                timestamp: Some(self.clock.now_millis()),
            })
            .await?;
        Ok(())
    }

    /// Join the current room's call.
    pub async fn start_call(&self, audio_only: bool) -> Result<(), CoordinatorError> {
        let room = self.room().ok_or(CoordinatorError::NotInRoom)?;
        self.call
            .initialize_call(room, self.participant().clone(), audio_only)
            .await?;
        Ok(())
    }

    pub async fn leave_call(&self) {
        self.call.leave_call().await;
    }

    /// Leave the call and the room. Does nothing outside a room.
    pub async fn leave_room(&self) {
        let Some(presence) = self.lock_presence().take() else {
            return;
        };
        self.call.leave_call().await;
        if let Err(e) = self.signaling.leave_room(presence.room).await {
            log::warn!("Failed to leave room {}: {e}", presence.room);
        }
        presence.relay.abort();
        log::info!("{} left room {}", self.participant().name, presence.room);
    }
}

impl Drop for StudyCoordinator {
    fn drop(&mut self) {
        if let Some(presence) = self.lock_presence().take() {
            presence.relay.abort();
        }
    }
}

/// Translate signaling and call notifications for one room into UI events.
async fn relay(
    room: RoomId,
    me: ParticipantInfo,
    mut signals: broadcast::Receiver<SignalMessage>,
    mut call_events: broadcast::Receiver<CallEvent>,
    mut call_state: Option<watch::Receiver<CallState>>,
    ui: broadcast::Sender<UiEvent>,
) {
    loop {
        let event = tokio::select! {
            msg = signals.recv() => match msg {
                Ok(msg) => match ui_event(room, &me, msg) {
                    Some(event) => event,
                    None => continue,
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("UI relay for {} lagged by {n} signals", me.name);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            event = call_events.recv() => match event {
                Ok(CallEvent::Error(e)) => UiEvent::CallError(e.to_string()),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("UI relay for {} lagged by {n} call events", me.name);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            changed = async {
                match call_state.as_mut() {
                    Some(rx) => rx.changed().await,
                    None => std::future::pending().await,
                }
            } => match (changed, call_state.as_mut()) {
                (Ok(()), Some(rx)) => UiEvent::CallState(rx.borrow_and_update().clone()),
                _ => {
                    call_state = None;
                    continue;
                }
            },
        };
        // No subscribers is fine; the UI may not be attached yet.
        let _ = ui.send(event);
    }
}

fn ui_event(room: RoomId, me: &ParticipantInfo, msg: SignalMessage) -> Option<UiEvent> {
    match msg {
        SignalMessage::RoomSnapshot {
            room: snapshot_room,
            participants,
            position,
        } if snapshot_room == room => Some(UiEvent::Roster {
            room,
            participants,
            position,
        }),
        SignalMessage::PositionChanged { event } if event.room == room => {
            Some(UiEvent::PositionChanged(event))
        }
        SignalMessage::ConflictResolved { winner, rejected } if winner.room == room => {
            let overridden_self = winner.actor.id != me.id
                && rejected.iter().any(|e| e.actor.id == me.id);
            Some(UiEvent::ConflictResolved {
                winner,
                rejected,
                overridden_self,
            })
        }
        _ => None,
    }
}
