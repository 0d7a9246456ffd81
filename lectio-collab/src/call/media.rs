//! Local capture and the media handles exchanged with the UI.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ParticipantId;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// A captured local track. Enabling and disabling happens in place.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Release the underlying device. A stopped track never restarts.
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

/// Tracks produced by one capture request.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    /// First track of the given kind.
    pub fn track(&self, kind: TrackKind) -> Option<Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Capture errors.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("No {0} device found")]
    NotFound(TrackKind),
    #[error("Permission to capture {0} denied")]
    PermissionDenied(TrackKind),
    #[error("Capture failed: {0}")]
    Capture(String),
}

/// Source of local capture (camera and microphone).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Local media flags exposed to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    /// The local capture carries a video track
    pub has_video: bool,
    /// Audio-only mode (forced fallback or explicit switch)
    pub audio_only: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl LocalMediaState {
    pub(crate) fn from_stream(stream: &LocalStream) -> Self {
        let has_video = stream.has_video();
        Self {
            has_video,
            audio_only: !has_video,
            audio_enabled: stream.track(TrackKind::Audio).is_some(),
            video_enabled: has_video,
        }
    }
}

/// Remote media received from one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMedia {
    pub participant: ParticipantId,
    pub stream_id: String,
    pub kinds: Vec<TrackKind>,
}
