//! Per-participant peer link and its lifecycle state machine.
//!
//! ```text
//!              ┌──────────► failed ─────────┐
//!              │              ▲             ▼
//! connecting ──┴─► connected ─┴► disconnected ──► closed
//!     ▲                 ▲            │
//!     └─────────────────┴────────────┘
//! ```
//!
//! `closed` is terminal. Reconnecting after `failed` or `closed` means
//! building a new link.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::media::{RemoteMedia, TrackKind};
use super::peer::{PeerConnection, TransportState};
use super::quality::ConnectionQuality;
use crate::protocol::{IceCandidate, ParticipantInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Closed)
                | (Connected, Disconnected)
                | (Connected, Failed)
                | (Connected, Closed)
                | (Disconnected, Connecting)
                | (Disconnected, Connected)
                | (Disconnected, Failed)
                | (Disconnected, Closed)
                | (Failed, Closed)
        )
    }

    /// The transport may still carry media without building a new link.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Disconnected)
    }

    /// Link state for a transport report; `New` carries no information.
    pub fn from_transport(state: TransportState) -> Option<Self> {
        match state {
            TransportState::New => None,
            TransportState::Connecting => Some(Self::Connecting),
            TransportState::Connected => Some(Self::Connected),
            TransportState::Disconnected => Some(Self::Disconnected),
            TransportState::Failed => Some(Self::Failed),
            TransportState::Closed => Some(Self::Closed),
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side sent the offer that created the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkRole {
    Initiator,
    Responder,
}

/// One media link to a remote participant.
///
/// The link owns its [`ConnectionQuality`], so quality is tracked exactly
/// as long as the link exists. A link whose reconnect attempts ran out is
/// not dropped: it stays in the call as `Closed` with `Disconnected`
/// quality so the UI can keep reporting it, until the participant leaves.
pub struct PeerLink {
    id: u64,
    participant: ParticipantInfo,
    connection: Arc<dyn PeerConnection>,
    state: LinkState,
    role: LinkRole,
    reconnect_attempts: u8,
    offer_outstanding: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    quality: ConnectionQuality,
    remote_media: Option<RemoteMedia>,
    sampler: Option<JoinHandle<()>>,
}

impl PeerLink {
    pub fn new(
        id: u64,
        participant: ParticipantInfo,
        connection: Arc<dyn PeerConnection>,
        role: LinkRole,
    ) -> Self {
        Self {
            id,
            participant,
            connection,
            state: LinkState::Connecting,
            role,
            reconnect_attempts: 0,
            offer_outstanding: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            quality: ConnectionQuality::default(),
            remote_media: None,
            sampler: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn participant(&self) -> &ParticipantInfo {
        &self.participant
    }

    pub fn connection(&self) -> Arc<dyn PeerConnection> {
        Arc::clone(&self.connection)
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn reconnect_attempts(&self) -> u8 {
        self.reconnect_attempts
    }

    pub fn quality(&self) -> &ConnectionQuality {
        &self.quality
    }

    pub fn quality_mut(&mut self) -> &mut ConnectionQuality {
        &mut self.quality
    }

    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.remote_media.as_ref()
    }

    pub fn offer_outstanding(&self) -> bool {
        self.offer_outstanding
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub(crate) fn set_reconnect_attempts(&mut self, attempts: u8) {
        self.reconnect_attempts = attempts;
    }

    pub(crate) fn set_offer_outstanding(&mut self, outstanding: bool) {
        self.offer_outstanding = outstanding;
    }

    /// Record that the remote description was applied; returns the
    /// candidates that arrived too early, in arrival order.
    pub(crate) fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.offer_outstanding = false;
        std::mem::take(&mut self.pending_candidates)
    }

    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub(crate) fn add_remote_track(&mut self, stream_id: String, kind: TrackKind) {
        let participant = self.participant.id;
        let media = self.remote_media.get_or_insert_with(|| RemoteMedia {
            participant,
            stream_id: stream_id.clone(),
            kinds: Vec::new(),
        });
        media.stream_id = stream_id;
        if !media.kinds.contains(&kind) {
            media.kinds.push(kind);
        }
    }

    pub(crate) fn set_sampler(&mut self, sampler: JoinHandle<()>) {
        if let Some(previous) = self.sampler.replace(sampler) {
            previous.abort();
        }
    }

    /// Move to `next`. Disallowed transitions are logged and ignored.
    pub fn transition(&mut self, next: LinkState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            log::warn!(
                "Ignoring link transition {} -> {next} for {}",
                self.state,
                self.participant.name
            );
            return false;
        }
        log::debug!(
            "Link to {} ({}) {} -> {next}",
            self.participant.name,
            self.participant.id,
            self.state
        );
        self.state = next;
        true
    }

    /// Stop sampling and mark the link closed. The caller closes the
    /// returned connection.
    pub(crate) fn shutdown(&mut self) -> Arc<dyn PeerConnection> {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        self.transition(LinkState::Closed);
        self.connection()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("participant", &self.participant)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("quality", &self.quality)
            .finish()
    }
}
