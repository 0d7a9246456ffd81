//! Room-scoped signaling relay.
//!
//! ```text
//! HubEndpoint(A) ──┐                       ┌──► outbox(A)
//!                  ├── route() ── Room ────┼──► outbox(B)
//! HubEndpoint(B) ──┘     │                 └──► outbox(C)
//!                        ├── offer/answer/candidate → addressed member only
//!                        ├── join-call / leave-call → call members
//!                        └── navigate → NavigationSync → whole room
//! ```
//!
//! Each member owns a broadcast outbox; the hub holds a sender clone per
//! room membership. Empty rooms are dropped together with their navigation
//! history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::navigation::{
    MoveOutcome, NavigationConfig, NavigationEvent, NavigationSync, Resolution,
};
use crate::protocol::{ParticipantId, ParticipantInfo, RoomId, SignalMessage};
use crate::store::{MemoryPositionStore, PositionStore};

use super::{SignalError, SignalingChannel};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages buffered per member outbox
    pub channel_capacity: usize,
    /// Members allowed per room
    pub max_participants_per_room: usize,
    pub navigation: NavigationConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            max_participants_per_room: 8,
            navigation: NavigationConfig::default(),
        }
    }
}

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub messages_routed: u64,
    pub messages_rejected: u64,
    pub active_rooms: usize,
    pub active_participants: usize,
}

struct AtomicHubStats {
    routed: AtomicU64,
    rejected: AtomicU64,
}

struct Member {
    info: ParticipantInfo,
    outbox: broadcast::Sender<SignalMessage>,
    in_call: bool,
}

#[derive(Default)]
struct RelayRoom {
    members: HashMap<ParticipantId, Member>,
}

impl RelayRoom {
    fn participants(&self) -> Vec<ParticipantInfo> {
        let mut list: Vec<ParticipantInfo> =
            self.members.values().map(|m| m.info.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        list
    }

    fn call_participants(&self, except: ParticipantId) -> Vec<ParticipantInfo> {
        let mut list: Vec<ParticipantInfo> = self
            .members
            .values()
            .filter(|m| m.in_call && m.info.id != except)
            .map(|m| m.info.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        list
    }

    /// Deliver to one member. Returns whether the member exists.
    fn deliver(&self, to: &ParticipantId, msg: SignalMessage) -> bool {
        match self.members.get(to) {
            Some(member) => {
                // A member without live subscribers simply misses the message.
                let _ = member.outbox.send(msg);
                true
            }
            None => false,
        }
    }

    fn broadcast(&self, msg: &SignalMessage) -> usize {
        self.members
            .values()
            .filter(|m| m.outbox.send(msg.clone()).is_ok())
            .count()
    }

    fn broadcast_call(&self, msg: &SignalMessage, except: ParticipantId) -> usize {
        self.members
            .values()
            .filter(|m| m.in_call && m.info.id != except)
            .filter(|m| m.outbox.send(msg.clone()).is_ok())
            .count()
    }
}

fn ensure_sender(from: ParticipantId, claimed: ParticipantId) -> Result<(), SignalError> {
    if from == claimed {
        Ok(())
    } else {
        Err(SignalError::Rejected(format!(
            "sender {from} cannot speak for {claimed}"
        )))
    }
}

/// The signaling hub.
pub struct SignalHub {
    config: HubConfig,
    rooms: RwLock<HashMap<RoomId, RelayRoom>>,
    navigation: Mutex<NavigationSync>,
    positions: Arc<dyn PositionStore>,
    clock: Arc<dyn Clock>,
    stats: AtomicHubStats,
}

impl SignalHub {
    pub fn new(config: HubConfig, positions: Arc<dyn PositionStore>) -> Self {
        Self::with_clock(config, positions, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: HubConfig,
        positions: Arc<dyn PositionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let navigation = NavigationSync::with_clock(config.navigation.clone(), clock.clone());
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            navigation: Mutex::new(navigation),
            positions,
            clock,
            stats: AtomicHubStats {
                routed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            },
        }
    }

    /// In-memory hub with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default(), Arc::new(MemoryPositionStore::new()))
    }

    /// Create a signaling endpoint for one participant.
    pub fn connect(self: &Arc<Self>, participant: ParticipantInfo) -> HubEndpoint {
        let (inbox, _) = broadcast::channel(self.config.channel_capacity);
        HubEndpoint {
            hub: Arc::clone(self),
            participant,
            inbox,
        }
    }

    /// Settled position of a room, seeding navigation from the store on
    /// first entry.
    async fn current_position(&self, room: RoomId) -> Option<String> {
        if let Some(position) = self.navigation.lock().await.canonical_position(room) {
            return Some(position);
        }

        match self.positions.load_position(room).await {
            Ok(Some(position)) => {
                let seeded = NavigationEvent {
                    room,
                    position: position.clone(),
                    actor: ParticipantInfo::with_id(Uuid::nil(), "stored"),
                    timestamp: 0,
                    resolution: Some(Resolution::Accepted),
                };
                self.navigation.lock().await.restore_position(room, seeded);
                Some(position)
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("Failed to load position for room {room}: {e}");
                None
            }
        }
    }

    /// Add a member to a room. The whole room (joiner included) receives a
    /// fresh `room-snapshot`.
    pub async fn join(
        &self,
        room: RoomId,
        participant: ParticipantInfo,
        outbox: broadcast::Sender<SignalMessage>,
    ) -> Result<(), SignalError> {
        let position = self.current_position(room).await;

        let mut rooms = self.rooms.write().await;
        let relay = rooms.entry(room).or_default();

        if !relay.members.contains_key(&participant.id)
            && relay.members.len() >= self.config.max_participants_per_room
        {
            return Err(SignalError::RoomFull(room));
        }

        let previous = relay.members.insert(
            participant.id,
            Member {
                info: participant.clone(),
                outbox,
                in_call: false,
            },
        );
        if previous.is_some_and(|m| m.in_call) {
            // The old connection's call is gone with it.
            let left = SignalMessage::ParticipantLeft {
                room,
                participant_id: participant.id,
            };
            relay.broadcast_call(&left, participant.id);
        }

        let snapshot = SignalMessage::RoomSnapshot {
            room,
            participants: relay.participants(),
            position,
        };
        relay.broadcast(&snapshot);

        log::info!(
            "{} ({}) joined room {room} ({} member(s))",
            participant.name,
            participant.id,
            relay.members.len()
        );
        Ok(())
    }

    /// Remove a member from a room. The last departure drops the room and
    /// its navigation history.
    pub async fn leave(&self, room: RoomId, participant: ParticipantId) {
        let position = self.navigation.lock().await.canonical_position(room);

        let emptied = {
            let mut rooms = self.rooms.write().await;
            let Some(relay) = rooms.get_mut(&room) else {
                return;
            };
            let Some(member) = relay.members.remove(&participant) else {
                return;
            };

            if member.in_call {
                let left = SignalMessage::ParticipantLeft {
                    room,
                    participant_id: participant,
                };
                relay.broadcast_call(&left, participant);
            }

            log::info!("{} ({participant}) left room {room}", member.info.name);

            if relay.members.is_empty() {
                rooms.remove(&room);
                true
            } else {
                let snapshot = SignalMessage::RoomSnapshot {
                    room,
                    participants: relay.participants(),
                    position,
                };
                relay.broadcast(&snapshot);
                false
            }
        };

        if emptied {
            self.navigation.lock().await.forget_room(room);
            log::info!("Room {room} removed (empty)");
        }
    }

    /// Remove a participant from every room (connection lost).
    pub async fn disconnect(&self, participant: ParticipantId) {
        let joined: Vec<RoomId> = self
            .rooms
            .read()
            .await
            .iter()
            .filter(|(_, relay)| relay.members.contains_key(&participant))
            .map(|(room, _)| *room)
            .collect();

        for room in joined {
            self.leave(room, participant).await;
        }
    }

    /// Route a message sent by `from`.
    pub async fn route(&self, from: ParticipantId, msg: SignalMessage) -> Result<(), SignalError> {
        let event = msg.event_name();
        let result = self.route_inner(from, msg).await;
        match &result {
            Ok(()) => {
                self.stats.routed.fetch_add(1, Ordering::Relaxed);
                log::trace!("Routed '{event}' from {from}");
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected '{event}' from {from}: {e}");
            }
        }
        result
    }

    async fn route_inner(&self, from: ParticipantId, msg: SignalMessage) -> Result<(), SignalError> {
        msg.validate()?;
        if msg.is_relay_only() {
            return Err(SignalError::Rejected(format!(
                "'{}' may only be sent by the relay",
                msg.event_name()
            )));
        }

        let room = msg.room();
        match &msg {
            SignalMessage::JoinRoom { .. } => Err(SignalError::Rejected(
                "join-room must be sent on a connection".into(),
            )),

            SignalMessage::LeaveRoom { participant_id, .. } => {
                ensure_sender(from, *participant_id)?;
                self.leave(room, from).await;
                Ok(())
            }

            SignalMessage::JoinCall { participant, .. } => {
                ensure_sender(from, participant.id)?;
                self.join_call(room, from).await
            }

            SignalMessage::LeaveCall { participant_id, .. } => {
                ensure_sender(from, *participant_id)?;
                self.leave_call(room, from).await
            }

            SignalMessage::Offer { from: sender, to, .. }
            | SignalMessage::Answer { from: sender, to, .. }
            | SignalMessage::Candidate { from: sender, to, .. } => {
                ensure_sender(from, *sender)?;
                let rooms = self.rooms.read().await;
                let relay = rooms
                    .get(&room)
                    .filter(|r| r.members.contains_key(&from))
                    .ok_or(SignalError::NotInRoom(room))?;
                if relay.deliver(to, msg.clone()) {
                    Ok(())
                } else {
                    Err(SignalError::UnknownRecipient(*to))
                }
            }

            SignalMessage::Navigate {
                position,
                actor,
                timestamp,
                ..
            } => {
                ensure_sender(from, actor.id)?;
                if !self.is_member(room, from).await {
                    return Err(SignalError::NotInRoom(room));
                }
                self.navigate(room, position.clone(), actor.clone(), *timestamp)
                    .await;
                Ok(())
            }

            _ => Err(SignalError::Rejected(format!(
                "'{}' is not routable",
                msg.event_name()
            ))),
        }
    }

    async fn join_call(&self, room: RoomId, from: ParticipantId) -> Result<(), SignalError> {
        let mut rooms = self.rooms.write().await;
        let relay = rooms.get_mut(&room).ok_or(SignalError::NotInRoom(room))?;

        let (info, outbox) = {
            let member = relay
                .members
                .get_mut(&from)
                .ok_or(SignalError::NotInRoom(room))?;
            member.in_call = true;
            (member.info.clone(), member.outbox.clone())
        };

        let existing = SignalMessage::ExistingParticipants {
            room,
            participants: relay.call_participants(from),
        };
        let _ = outbox.send(existing);

        let joined = SignalMessage::ParticipantJoined {
            room,
            participant: info.clone(),
        };
        let notified = relay.broadcast_call(&joined, from);

        log::info!("{} joined the call in room {room} ({notified} notified)", info.name);
        Ok(())
    }

    async fn leave_call(&self, room: RoomId, from: ParticipantId) -> Result<(), SignalError> {
        let mut rooms = self.rooms.write().await;
        let relay = rooms.get_mut(&room).ok_or(SignalError::NotInRoom(room))?;
        let member = relay
            .members
            .get_mut(&from)
            .ok_or(SignalError::NotInRoom(room))?;

        if member.in_call {
            member.in_call = false;
            let left = SignalMessage::ParticipantLeft {
                room,
                participant_id: from,
            };
            relay.broadcast_call(&left, from);
            log::info!("{from} left the call in room {room}");
        }
        Ok(())
    }

    async fn navigate(
        &self,
        room: RoomId,
        position: String,
        actor: ParticipantInfo,
        timestamp: Option<u64>,
    ) {
        let timestamp = timestamp.unwrap_or_else(|| self.clock.now_millis());
        let outcome = self
            .navigation
            .lock()
            .await
            .propose_move_at(room, position, actor, timestamp);

        if let Some(event) = outcome.canonical() {
            if let Err(e) = self.positions.save_position(room, &event.position).await {
                log::error!("Failed to persist position for room {room}: {e}");
            }
        }

        let msg = match outcome {
            MoveOutcome::Committed(event) => SignalMessage::PositionChanged { event },
            MoveOutcome::Resolved { winner, rejected } => {
                SignalMessage::ConflictResolved { winner, rejected }
            }
            MoveOutcome::Unchanged => return,
        };

        if let Some(relay) = self.rooms.read().await.get(&room) {
            relay.broadcast(&msg);
        }
    }

    async fn is_member(&self, room: RoomId, participant: ParticipantId) -> bool {
        self.rooms
            .read()
            .await
            .get(&room)
            .is_some_and(|r| r.members.contains_key(&participant))
    }

    /// Members of a room.
    pub async fn members(&self, room: RoomId) -> Vec<ParticipantInfo> {
        self.rooms
            .read()
            .await
            .get(&room)
            .map(RelayRoom::participants)
            .unwrap_or_default()
    }

    /// Whether a participant has joined the room's call.
    pub async fn in_call(&self, room: RoomId, participant: ParticipantId) -> bool {
        self.rooms
            .read()
            .await
            .get(&room)
            .and_then(|r| r.members.get(&participant))
            .is_some_and(|m| m.in_call)
    }

    /// Navigation history of a room.
    pub async fn history(&self, room: RoomId) -> Vec<NavigationEvent> {
        self.navigation.lock().await.history(room)
    }

    /// Settled position of a room.
    pub async fn canonical_position(&self, room: RoomId) -> Option<String> {
        self.navigation.lock().await.canonical_position(room)
    }

    /// Number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        let rooms = self.rooms.read().await;
        HubStats {
            messages_routed: self.stats.routed.load(Ordering::Relaxed),
            messages_rejected: self.stats.rejected.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            active_participants: rooms.values().map(|r| r.members.len()).sum(),
        }
    }
}

/// In-process [`SignalingChannel`] for one participant.
pub struct HubEndpoint {
    hub: Arc<SignalHub>,
    participant: ParticipantInfo,
    inbox: broadcast::Sender<SignalMessage>,
}

impl HubEndpoint {
    /// Leave every room.
    pub async fn disconnect(&self) {
        self.hub.disconnect(self.participant.id).await;
    }

    pub fn hub(&self) -> &Arc<SignalHub> {
        &self.hub
    }
}

#[async_trait]
impl SignalingChannel for HubEndpoint {
    fn participant(&self) -> &ParticipantInfo {
        &self.participant
    }

    async fn join_room(&self, room: RoomId) -> Result<(), SignalError> {
        self.hub
            .join(room, self.participant.clone(), self.inbox.clone())
            .await
    }

    async fn leave_room(&self, room: RoomId) -> Result<(), SignalError> {
        self.hub.leave(room, self.participant.id).await;
        Ok(())
    }

    async fn emit(&self, message: SignalMessage) -> Result<(), SignalError> {
        if let SignalMessage::JoinRoom { room, participant } = &message {
            ensure_sender(self.participant.id, participant.id)?;
            return self.join_room(*room).await;
        }
        self.hub.route(self.participant.id, message).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inbox.subscribe()
    }

    async fn members(&self, room: RoomId) -> Vec<ParticipantInfo> {
        self.hub.members(room).await
    }
}
