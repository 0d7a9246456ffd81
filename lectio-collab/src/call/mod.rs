//! Call orchestration: local media, one peer link per remote participant,
//! signaling exchange, quality sampling and failure recovery.
//!
//! ```text
//!                ┌──────────────── CallOrchestrator ────────────────┐
//!  signaling ──► │ pump ──► KeyedQueue[(room, participant)] ──► task │
//!  peer events ─►│                                   │              │
//!                │          PeerLink ◄───────────────┘              │
//!                │            ├── PeerConnection (offer/answer/ICE) │
//!                │            ├── ConnectionQuality ◄── sampler     │
//!                │            └── reconnect counter                 │
//!                └──────────┬───────────────────────┬───────────────┘
//!                           ▼                       ▼
//!                 watch<CallState>        broadcast<CallEvent>
//! ```

pub mod link;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod quality;
pub mod queue;

pub use link::{LinkRole, LinkState, PeerLink};
pub use media::{
    LocalMediaState, LocalStream, MediaConstraints, MediaDevices, MediaError, MediaTrack,
    RemoteMedia, TrackKind,
};
pub use orchestrator::{
    CallConfig, CallError, CallEvent, CallOrchestrator, CallState, ParticipantCallState,
};
pub use peer::{
    LinkStats, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventKind,
    PeerEventSink, SdpKind, SessionDescription, TransportState,
};
pub use quality::{ConnectionQuality, QualityClass, QualityThresholds};
pub use queue::KeyedQueue;
