//! Peer connection abstraction.
//!
//! A [`PeerConnection`] is one negotiated media transport to a remote
//! participant. Asynchronous transport happenings (gathered candidates,
//! state changes, remote tracks) are reported through the
//! [`PeerEventSink`] handed to the factory; each sink is tagged with the
//! link id so events from a torn-down connection can be told apart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::media::{MediaTrack, TrackKind};
use crate::protocol::{IceCandidate, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description produced or consumed during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Transport statistics used for quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub round_trip: Duration,
}

impl LinkStats {
    /// Fraction of packets lost, 0.0 when nothing was exchanged yet.
    pub fn loss_ratio(&self) -> f64 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// A local connectivity candidate was gathered
    IceCandidate(IceCandidate),
    StateChanged(TransportState),
    /// Remote media arrived
    RemoteTrack { stream_id: String, kind: TrackKind },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub participant: ParticipantId,
    pub link_id: u64,
    pub kind: PeerEventKind,
}

/// Where a connection reports its events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    participant: ParticipantId,
    link_id: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(
        participant: ParticipantId,
        link_id: u64,
        tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            participant,
            link_id,
            tx,
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Report an event. Returns false once the call is gone.
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                participant: self.participant,
                link_id: self.link_id,
                kind,
            })
            .is_ok()
    }
}

/// Peer connection errors.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Invalid connection state: {0}")]
    InvalidState(String),
    #[error("Statistics unavailable: {0}")]
    StatsUnavailable(String),
    #[error("Connection closed")]
    Closed,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach a local track as a new sender.
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError>;
    /// Remove the sender of the given kind. Returns whether one existed.
    async fn remove_track(&self, kind: TrackKind) -> Result<bool, PeerError>;
    /// Swap the track of the sender with the same kind.
    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError>;
    /// Kinds of the current senders.
    fn senders(&self) -> Vec<TrackKind>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn stats(&self) -> Result<LinkStats, PeerError>;
    async fn close(&self);
}

/// Creates peer connections bound to an event sink.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
