//! Navigation synchronization: which of several near-simultaneous
//! "go to position X" requests becomes the room's position.
//!
//! ## Resolution
//!
//! ```text
//! propose_move(room, "Section-9", bob)  @ t=2000
//!       │
//!       ├── same as canonical?  ──────────────► Unchanged (no notification)
//!       │
//!       ├── scan history for events with timestamp >= t - 5s
//!       │       none disagree ─────────────────► Committed + PositionChanged
//!       │
//!       └── some disagree ── newest timestamp wins
//!                             older ones rejected ► Resolved + ConflictResolved
//! ```
//!
//! Last-writer-wins keeps navigation non-blocking: a participant whose move
//! was overridden is told so and can simply navigate again.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::protocol::{ParticipantInfo, RoomId};

/// Outcome tag attached to an arbitrated move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Accepted,
    Rejected,
}

/// A single "move to position X" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationEvent {
    pub room: RoomId,
    /// Opaque position reference (e.g. `"Section-5"`).
    pub position: String,
    pub actor: ParticipantInfo,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub resolution: Option<Resolution>,
}

impl NavigationEvent {
    fn with_resolution(&self, resolution: Resolution) -> Self {
        Self {
            resolution: Some(resolution),
            ..self.clone()
        }
    }

    /// Total order used to pick the last writer: timestamp, then actor id.
    fn precedence(&self) -> (u64, uuid::Uuid) {
        (self.timestamp, self.actor.id)
    }
}

/// Notifications emitted for broadcast to the room.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationNotification {
    PositionChanged(NavigationEvent),
    ConflictResolved {
        winner: NavigationEvent,
        rejected: Vec<NavigationEvent>,
    },
}

/// Result of [`NavigationSync::propose_move`].
#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    /// No conflict; the move is the new canonical position.
    Committed(NavigationEvent),
    /// The move targets the settled position; nothing changed.
    Unchanged,
    /// Concurrent moves disagreed and were arbitrated.
    Resolved {
        winner: NavigationEvent,
        rejected: Vec<NavigationEvent>,
    },
}

impl MoveOutcome {
    /// Notification to broadcast for this outcome, if any.
    pub fn notification(&self) -> Option<NavigationNotification> {
        match self {
            MoveOutcome::Committed(event) => {
                Some(NavigationNotification::PositionChanged(event.clone()))
            }
            MoveOutcome::Unchanged => None,
            MoveOutcome::Resolved { winner, rejected } => {
                Some(NavigationNotification::ConflictResolved {
                    winner: winner.clone(),
                    rejected: rejected.clone(),
                })
            }
        }
    }

    /// Position that became canonical because of this move.
    pub fn canonical(&self) -> Option<&NavigationEvent> {
        match self {
            MoveOutcome::Committed(event) => Some(event),
            MoveOutcome::Unchanged => None,
            MoveOutcome::Resolved { winner, .. } => Some(winner),
        }
    }
}

/// Conflicting moves detected in one resolution pass.
///
/// Lives only for the duration of [`NavigationSync::propose_move_at`].
#[derive(Debug)]
struct SyncConflict {
    trigger: NavigationEvent,
    window: Vec<NavigationEvent>,
}

impl SyncConflict {
    /// Last-writer-wins: the newest event is accepted, every older event
    /// that disagrees with it is rejected.
    fn resolve(self) -> (NavigationEvent, Vec<NavigationEvent>) {
        let mut candidates = self.window;
        candidates.push(self.trigger);

        let winner_idx = candidates
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| e.precedence())
            .map(|(i, _)| i)
            .unwrap_or(candidates.len() - 1);
        let winner = candidates.swap_remove(winner_idx);

        let mut rejected: Vec<NavigationEvent> = candidates
            .into_iter()
            .filter(|e| e.position != winner.position)
            .map(|e| e.with_resolution(Resolution::Rejected))
            .collect();
        rejected.sort_by_key(|e| e.precedence());

        (winner.with_resolution(Resolution::Accepted), rejected)
    }
}

/// Navigation tuning.
#[derive(Debug, Clone)]
pub struct NavigationConfig {
    /// Trailing window within which disagreeing moves conflict.
    pub conflict_window: Duration,
    /// Maximum history entries kept per room.
    pub history_limit: usize,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            conflict_window: Duration::from_secs(5),
            history_limit: 50,
        }
    }
}

/// Per-room accepted moves plus the settled position.
#[derive(Debug, Default)]
struct RoomHistory {
    events: VecDeque<NavigationEvent>,
    canonical: Option<NavigationEvent>,
}

impl RoomHistory {
    fn push(&mut self, event: NavigationEvent, limit: usize) {
        self.events.push_back(event);
        while self.events.len() > limit {
            self.events.pop_front();
        }
    }
}

/// The navigation sync engine.
///
/// Histories are keyed by room id, so moves in different rooms never
/// interact.
pub struct NavigationSync {
    config: NavigationConfig,
    clock: Arc<dyn Clock>,
    rooms: HashMap<RoomId, RoomHistory>,
    notify: broadcast::Sender<NavigationNotification>,
}

impl NavigationSync {
    pub fn new(config: NavigationConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: NavigationConfig, clock: Arc<dyn Clock>) -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            config,
            clock,
            rooms: HashMap::new(),
            notify,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(NavigationConfig::default())
    }

    /// Subscribe to position-changed and conflict-resolved notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<NavigationNotification> {
        self.notify.subscribe()
    }

    /// Propose a move stamped with the engine clock.
    pub fn propose_move(
        &mut self,
        room: RoomId,
        position: impl Into<String>,
        actor: ParticipantInfo,
    ) -> MoveOutcome {
        let now = self.clock.now_millis();
        self.propose_move_at(room, position, actor, now)
    }

    /// Propose a move carrying its own timestamp (Unix milliseconds).
    pub fn propose_move_at(
        &mut self,
        room: RoomId,
        position: impl Into<String>,
        actor: ParticipantInfo,
        timestamp: u64,
    ) -> MoveOutcome {
        let event = NavigationEvent {
            room,
            position: position.into(),
            actor,
            timestamp,
            resolution: None,
        };

        let window = self.config.conflict_window.as_millis() as u64;
        let limit = self.config.history_limit;
        let history = self.rooms.entry(room).or_default();

        if history
            .canonical
            .as_ref()
            .is_some_and(|c| c.position == event.position)
        {
            log::trace!("Move to {} in room {room} is already settled", event.position);
            return MoveOutcome::Unchanged;
        }

        let cutoff = event.timestamp.saturating_sub(window);
        let in_window: Vec<NavigationEvent> = history
            .events
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect();

        let outcome = if in_window.iter().all(|e| e.position == event.position) {
            let accepted = event.with_resolution(Resolution::Accepted);
            history.push(accepted.clone(), limit);
            history.canonical = Some(accepted.clone());
            log::debug!(
                "Room {room} moved to {} by {}",
                accepted.position,
                accepted.actor.name
            );
            MoveOutcome::Committed(accepted)
        } else {
            let conflict = SyncConflict {
                trigger: event,
                window: in_window,
            };
            let (winner, rejected) = conflict.resolve();

            let already_recorded = history
                .events
                .iter()
                .any(|e| e.precedence() == winner.precedence() && e.position == winner.position);
            if !already_recorded {
                history.push(winner.clone(), limit);
            }
            let newer_than_canonical = history
                .canonical
                .as_ref()
                .map_or(true, |c| winner.precedence() >= c.precedence());
            if newer_than_canonical {
                history.canonical = Some(winner.clone());
            }

            log::info!(
                "Navigation conflict in room {room}: {} by {} wins over {} move(s)",
                winner.position,
                winner.actor.name,
                rejected.len()
            );
            MoveOutcome::Resolved { winner, rejected }
        };

        if let Some(notification) = outcome.notification() {
            // No subscribers is fine: callers also get the outcome directly.
            let _ = self.notify.send(notification);
        }
        outcome
    }

    /// Snapshot of a room's accepted moves, most recent last.
    pub fn history(&self, room: RoomId) -> Vec<NavigationEvent> {
        self.rooms
            .get(&room)
            .map(|h| h.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Currently settled position of a room.
    pub fn canonical_position(&self, room: RoomId) -> Option<String> {
        self.rooms
            .get(&room)
            .and_then(|h| h.canonical.as_ref())
            .map(|e| e.position.clone())
    }

    /// Seed the settled position of a room (e.g. from persistent storage)
    /// without recording a move.
    pub fn restore_position(&mut self, room: RoomId, event: NavigationEvent) {
        let history = self.rooms.entry(room).or_default();
        if history.canonical.is_none() {
            history.canonical = Some(event);
        }
    }

    /// Drop everything known about a room.
    pub fn forget_room(&mut self, room: RoomId) {
        if self.rooms.remove(&room).is_some() {
            log::debug!("Forgot navigation history of room {room}");
        }
    }

    /// Number of rooms with navigation state.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use uuid::Uuid;

    fn engine() -> (NavigationSync, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let sync = NavigationSync::with_clock(NavigationConfig::default(), clock.clone());
        (sync, clock)
    }

    #[test]
    fn test_first_move_commits() {
        let (mut sync, _) = engine();
        let room = Uuid::new_v4();
        let outcome = sync.propose_move(room, "Section-1", ParticipantInfo::new("Alice"));

        assert!(matches!(outcome, MoveOutcome::Committed(_)));
        assert_eq!(sync.canonical_position(room).as_deref(), Some("Section-1"));
        assert_eq!(sync.history(room).len(), 1);
    }

    #[test]
    fn test_later_move_wins_conflict() {
        let (mut sync, clock) = engine();
        let room = Uuid::new_v4();
        let alice = ParticipantInfo::new("Alice");
        let bob = ParticipantInfo::new("Bob");

        sync.propose_move(room, "Section-5", alice.clone());
        clock.set(2_000);
        let outcome = sync.propose_move(room, "Section-9", bob.clone());

        match outcome {
            MoveOutcome::Resolved { winner, rejected } => {
                assert_eq!(winner.actor, bob);
                assert_eq!(winner.resolution, Some(Resolution::Accepted));
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].actor, alice);
                assert_eq!(rejected[0].resolution, Some(Resolution::Rejected));
            }
            other => panic!("Expected conflict resolution, got {other:?}"),
        }
        assert_eq!(sync.canonical_position(room).as_deref(), Some("Section-9"));
    }

    #[test]
    fn test_same_position_is_not_a_conflict() {
        let (mut sync, clock) = engine();
        let room = Uuid::new_v4();
        let mut rx = sync.subscribe();

        sync.propose_move(room, "Section-5", ParticipantInfo::new("Alice"));
        clock.set(1_000);
        let outcome = sync.propose_move(room, "Section-5", ParticipantInfo::new("Bob"));

        assert_eq!(outcome, MoveOutcome::Unchanged);
        assert_eq!(sync.canonical_position(room).as_deref(), Some("Section-5"));
        assert!(matches!(
            rx.try_recv(),
            Ok(NavigationNotification::PositionChanged(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_moves_outside_window_are_settled() {
        let (mut sync, clock) = engine();
        let room = Uuid::new_v4();

        sync.propose_move(room, "Section-1", ParticipantInfo::new("Alice"));
        clock.set(6_000);
        let outcome = sync.propose_move(room, "Section-2", ParticipantInfo::new("Bob"));

        assert!(matches!(outcome, MoveOutcome::Committed(_)));
        assert_eq!(sync.history(room).len(), 2);
    }

    #[test]
    fn test_reordered_delivery_keeps_latest_timestamp() {
        let (mut sync, _) = engine();
        let room = Uuid::new_v4();
        let alice = ParticipantInfo::new("Alice");
        let bob = ParticipantInfo::new("Bob");

        sync.propose_move_at(room, "Section-9", bob.clone(), 2_000);
        let outcome = sync.propose_move_at(room, "Section-5", alice.clone(), 0);

        match outcome {
            MoveOutcome::Resolved { winner, rejected } => {
                assert_eq!(winner.position, "Section-9");
                assert_eq!(rejected[0].actor, alice);
            }
            other => panic!("Expected conflict resolution, got {other:?}"),
        }
        assert_eq!(sync.canonical_position(room).as_deref(), Some("Section-9"));
        // The winner was already recorded; it is not appended twice.
        assert_eq!(sync.history(room).len(), 1);
    }

    #[test]
    fn test_stale_move_far_in_the_past_is_rejected() {
        let (mut sync, _) = engine();
        let room = Uuid::new_v4();

        sync.propose_move_at(room, "Section-9", ParticipantInfo::new("Bob"), 60_000);
        let outcome = sync.propose_move_at(room, "Section-1", ParticipantInfo::new("Alice"), 1_000);

        assert!(matches!(outcome, MoveOutcome::Resolved { .. }));
        assert_eq!(sync.canonical_position(room).as_deref(), Some("Section-9"));
    }

    #[test]
    fn test_history_is_bounded() {
        let (mut sync, clock) = engine();
        let room = Uuid::new_v4();
        let actor = ParticipantInfo::new("Alice");

        for i in 0..60u64 {
            clock.set(i * 10_000);
            sync.propose_move(room, format!("Section-{i}"), actor.clone());
        }

        let history = sync.history(room);
        assert_eq!(history.len(), 50);
        assert_eq!(history.first().unwrap().position, "Section-10");
        assert_eq!(history.last().unwrap().position, "Section-59");
    }

    #[test]
    fn test_three_way_conflict_rejects_every_older_disagreement() {
        let (mut sync, _) = engine();
        let room = Uuid::new_v4();

        sync.propose_move_at(room, "A", ParticipantInfo::new("Alice"), 0);
        // Within the window of Alice's move: conflict, Bob wins.
        sync.propose_move_at(room, "B", ParticipantInfo::new("Bob"), 1_000);
        let outcome = sync.propose_move_at(room, "C", ParticipantInfo::new("Carol"), 2_000);

        match outcome {
            MoveOutcome::Resolved { winner, rejected } => {
                assert_eq!(winner.position, "C");
                let positions: Vec<_> = rejected.iter().map(|e| e.position.as_str()).collect();
                assert_eq!(positions, vec!["A", "B"]);
            }
            other => panic!("Expected conflict resolution, got {other:?}"),
        }
    }

    #[test]
    fn test_canonical_is_latest_accepted() {
        let (mut sync, _) = engine();
        let room = Uuid::new_v4();
        let moves = [(0, "A"), (4_000, "B"), (3_000, "C"), (9_500, "D"), (9_000, "A")];

        let mut accepted: Vec<NavigationEvent> = Vec::new();
        for (ts, pos) in moves {
            match sync.propose_move_at(room, pos, ParticipantInfo::new("X"), ts) {
                MoveOutcome::Committed(e) => accepted.push(e),
                MoveOutcome::Resolved { winner, .. } => accepted.push(winner),
                MoveOutcome::Unchanged => {}
            }
        }

        let latest = accepted.iter().max_by_key(|e| e.timestamp).unwrap();
        assert_eq!(sync.canonical_position(room), Some(latest.position.clone()));
    }

    #[test]
    fn test_forget_room() {
        let (mut sync, _) = engine();
        let room = Uuid::new_v4();
        sync.propose_move(room, "Section-1", ParticipantInfo::new("Alice"));
        assert_eq!(sync.room_count(), 1);

        sync.forget_room(room);
        assert_eq!(sync.room_count(), 0);
        assert!(sync.history(room).is_empty());
        assert!(sync.canonical_position(room).is_none());
    }

    #[test]
    fn test_rooms_are_independent() {
        let (mut sync, _) = engine();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();

        sync.propose_move_at(room_a, "Section-1", ParticipantInfo::new("Alice"), 0);
        let outcome = sync.propose_move_at(room_b, "Section-2", ParticipantInfo::new("Bob"), 100);

        assert!(matches!(outcome, MoveOutcome::Committed(_)));
    }

    #[test]
    fn test_restore_position_seeds_canonical() {
        let (mut sync, _) = engine();
        let room = Uuid::new_v4();
        let seeded = NavigationEvent {
            room,
            position: "Section-3".into(),
            actor: ParticipantInfo::new("Archive"),
            timestamp: 0,
            resolution: Some(Resolution::Accepted),
        };
        sync.restore_position(room, seeded);

        let outcome = sync.propose_move_at(room, "Section-3", ParticipantInfo::new("Alice"), 10);
        assert_eq!(outcome, MoveOutcome::Unchanged);
        assert!(sync.history(room).is_empty());
    }
}
