//! Signaling channel: the narrow transport both engines talk through.
//!
//! A channel emits messages, delivers incoming ones to subscribers, and
//! joins or leaves rooms. Two implementations ship with the crate:
//!
//! - [`hub::HubEndpoint`]: in-process, backed by a shared [`hub::SignalHub`]
//! - [`ws::WsSignaling`]: WebSocket client for [`crate::server::RelayServer`]

pub mod hub;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::protocol::{ParticipantId, ParticipantInfo, ProtocolError, RoomId, SignalMessage};

pub use hub::{HubConfig, HubEndpoint, HubStats, SignalHub};
pub use ws::{ConnectionState, WsSignaling};

/// Signaling errors.
#[derive(Debug, Clone, Error)]
pub enum SignalError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Not a member of room {0}")]
    NotInRoom(RoomId),
    #[error("Room {0} is full")]
    RoomFull(RoomId),
    #[error("Participant {0} is not reachable in this room")]
    UnknownRecipient(ParticipantId),
    #[error("Message rejected: {0}")]
    Rejected(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
}

/// Bidirectional event transport for one participant.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Identity this channel speaks for.
    fn participant(&self) -> &ParticipantInfo;

    /// Enter a room; a `room-snapshot` follows on the subscription.
    async fn join_room(&self, room: RoomId) -> Result<(), SignalError>;

    /// Leave a room.
    async fn leave_room(&self, room: RoomId) -> Result<(), SignalError>;

    /// Send a message to the relay.
    async fn emit(&self, message: SignalMessage) -> Result<(), SignalError>;

    /// Receive every message addressed or broadcast to this participant.
    fn subscribe(&self) -> broadcast::Receiver<SignalMessage>;

    /// Membership snapshot of a room.
    async fn members(&self, room: RoomId) -> Vec<ParticipantInfo>;
}
