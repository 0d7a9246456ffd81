//! Signaling protocol shared by the relay, the hub and every client.
//!
//! Each message is one variant of the closed [`SignalMessage`] enum. Two
//! encodings are supported:
//!
//! ```text
//! ┌──────────────────────┐        ┌─────────────────────────────────┐
//! │ WebSocket (binary)   │        │ Socket-style events             │
//! │ bincode SignalMessage│        │ ("offer", { "room": …, … })     │
//! └──────────┬───────────┘        └────────────────┬────────────────┘
//!            │ decode()                            │ from_event()
//!            ▼                                     ▼
//!                   SignalMessage::validate()
//! ```
//!
//! Both entry points validate required fields, so handlers never see a
//! half-formed message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::navigation::NavigationEvent;

/// Identifier of a study room (one shared document).
pub type RoomId = Uuid;

/// Identifier of a participant.
pub type ParticipantId = Uuid;

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
}

impl ParticipantInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Create with explicit id (for testing and replay)
    pub fn with_id(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Stand-in identity for a participant we only know by id, e.g. when an
    /// offer arrives before any join notification.
    pub fn placeholder(id: ParticipantId) -> Self {
        Self {
            id,
            name: format!("Peer-{}", &id.to_string()[..8]),
        }
    }
}

/// One connectivity candidate exchanged during negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Every message that crosses the signaling channel.
///
/// Variant names map to kebab-case event names (`ExistingParticipants` is
/// `"existing-participants"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Enter a room (client → relay). Must be the first message on a connection.
    JoinRoom {
        room: RoomId,
        participant: ParticipantInfo,
    },
    /// Leave a room (client → relay).
    LeaveRoom {
        room: RoomId,
        participant_id: ParticipantId,
    },
    /// Current membership and position (relay → client), sent on every
    /// membership change.
    RoomSnapshot {
        room: RoomId,
        participants: Vec<ParticipantInfo>,
        position: Option<String>,
    },
    /// Announce presence in the room's call (client → relay).
    JoinCall {
        room: RoomId,
        participant: ParticipantInfo,
    },
    /// Depart the room's call (client → relay).
    LeaveCall {
        room: RoomId,
        participant_id: ParticipantId,
    },
    /// Call members already present, sent to a participant that just joined.
    ExistingParticipants {
        room: RoomId,
        participants: Vec<ParticipantInfo>,
    },
    /// A new call member, sent to everyone already in the call.
    ParticipantJoined {
        room: RoomId,
        participant: ParticipantInfo,
    },
    /// A call member departed.
    ParticipantLeft {
        room: RoomId,
        participant_id: ParticipantId,
    },
    /// Connection offer addressed to one participant.
    Offer {
        room: RoomId,
        from: ParticipantId,
        to: ParticipantId,
        sdp: String,
    },
    /// Connection answer addressed to one participant.
    Answer {
        room: RoomId,
        from: ParticipantId,
        to: ParticipantId,
        sdp: String,
    },
    /// Connectivity candidate addressed to one participant.
    Candidate {
        room: RoomId,
        from: ParticipantId,
        to: ParticipantId,
        candidate: IceCandidate,
    },
    /// Request to move the room to `position` (client → relay).
    Navigate {
        room: RoomId,
        position: String,
        actor: ParticipantInfo,
        /// Client timestamp in Unix milliseconds; the relay stamps the move
        /// itself when absent.
        timestamp: Option<u64>,
    },
    /// The room's canonical position changed (relay → clients).
    PositionChanged { event: NavigationEvent },
    /// Concurrent moves were arbitrated (relay → clients).
    ConflictResolved {
        winner: NavigationEvent,
        rejected: Vec<NavigationEvent>,
    },
}

impl SignalMessage {
    /// All event names understood by [`SignalMessage::from_event`].
    pub const EVENT_NAMES: [&'static str; 14] = [
        "join-room",
        "leave-room",
        "room-snapshot",
        "join-call",
        "leave-call",
        "existing-participants",
        "participant-joined",
        "participant-left",
        "offer",
        "answer",
        "candidate",
        "navigate",
        "position-changed",
        "conflict-resolved",
    ];

    /// Event name of this message.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::RoomSnapshot { .. } => "room-snapshot",
            Self::JoinCall { .. } => "join-call",
            Self::LeaveCall { .. } => "leave-call",
            Self::ExistingParticipants { .. } => "existing-participants",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::ParticipantLeft { .. } => "participant-left",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Navigate { .. } => "navigate",
            Self::PositionChanged { .. } => "position-changed",
            Self::ConflictResolved { .. } => "conflict-resolved",
        }
    }

    /// Room this message belongs to.
    pub fn room(&self) -> RoomId {
        match self {
            Self::JoinRoom { room, .. }
            | Self::LeaveRoom { room, .. }
            | Self::RoomSnapshot { room, .. }
            | Self::JoinCall { room, .. }
            | Self::LeaveCall { room, .. }
            | Self::ExistingParticipants { room, .. }
            | Self::ParticipantJoined { room, .. }
            | Self::ParticipantLeft { room, .. }
            | Self::Offer { room, .. }
            | Self::Answer { room, .. }
            | Self::Candidate { room, .. }
            | Self::Navigate { room, .. } => *room,
            Self::PositionChanged { event } => event.room,
            Self::ConflictResolved { winner, .. } => winner.room,
        }
    }

    /// Recipient of a peer-addressed message (offer, answer, candidate).
    pub fn recipient(&self) -> Option<ParticipantId> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => {
                Some(*to)
            }
            _ => None,
        }
    }

    /// Whether only the relay may originate this message.
    pub fn is_relay_only(&self) -> bool {
        matches!(
            self,
            Self::RoomSnapshot { .. }
                | Self::ExistingParticipants { .. }
                | Self::ParticipantJoined { .. }
                | Self::ParticipantLeft { .. }
                | Self::PositionChanged { .. }
                | Self::ConflictResolved { .. }
        )
    }

    /// Check required field contents that serde alone cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidField {
            event: self.event_name(),
            reason: reason.to_string(),
        };

        match self {
            Self::Offer { from, to, sdp, .. } | Self::Answer { from, to, sdp, .. } => {
                if sdp.trim().is_empty() {
                    return Err(invalid("session description is empty"));
                }
                if from == to {
                    return Err(invalid("sender and recipient are the same participant"));
                }
            }
            Self::Candidate { from, to, .. } => {
                if from == to {
                    return Err(invalid("sender and recipient are the same participant"));
                }
            }
            Self::Navigate { position, .. } => {
                if position.trim().is_empty() {
                    return Err(invalid("position is empty"));
                }
            }
            Self::JoinRoom { participant, .. } | Self::JoinCall { participant, .. } => {
                if participant.id.is_nil() {
                    return Err(invalid("participant id is nil"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse a socket-style `(event, payload)` pair.
    ///
    /// Unknown events and payloads missing required fields are rejected.
    pub fn from_event(event: &str, payload: Value) -> Result<Self, ProtocolError> {
        if !Self::EVENT_NAMES.contains(&event) {
            return Err(ProtocolError::UnknownEvent(event.to_string()));
        }

        let mut tagged = serde_json::Map::with_capacity(1);
        tagged.insert(event.to_string(), payload);

        let msg: SignalMessage = serde_json::from_value(Value::Object(tagged)).map_err(|e| {
            ProtocolError::Malformed {
                event: event.to_string(),
                reason: e.to_string(),
            }
        })?;
        msg.validate()?;
        Ok(msg)
    }

    /// Render as a socket-style `(event, payload)` pair.
    pub fn to_event(&self) -> Result<(&'static str, Value), ProtocolError> {
        let value = serde_json::to_value(self)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        let payload = match value {
            Value::Object(map) => map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null),
            other => other,
        };
        Ok((self.event_name(), payload))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Malformed '{event}' payload: {reason}")]
    Malformed { event: String, reason: String },
    #[error("Invalid '{event}' message: {reason}")]
    InvalidField { event: &'static str, reason: String },
}
