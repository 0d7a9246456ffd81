//! # lectio-collab: real-time collaboration core for shared study rooms
//!
//! Keeps everyone in a room on the same position of a shared document and
//! runs a full-mesh audio/video call between the room's participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   UiEvent    ┌────────────────────┐
//! │ StudyCoordinator │ ───────────► │ presentation layer │
//! └───┬──────────┬───┘              └────────────────────┘
//!     │          │
//!     │          ▼
//!     │   ┌──────────────────┐  PeerConnection  ┌──────────────┐
//!     │   │ CallOrchestrator │ ◄──────────────► │ remote peers │
//!     │   └────────┬─────────┘                  └──────────────┘
//!     ▼            ▼
//! ┌──────────────────────┐  join/emit/subscribe  ┌────────────────────┐
//! │ SignalingChannel     │ ◄───────────────────► │ SignalHub          │
//! │ (hub or WebSocket)   │                       │  └ NavigationSync  │
//! └──────────────────────┘                       │  └ PositionStore   │
//!                                                └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: signaling messages and their two encodings
//! - [`navigation`]: last-writer-wins navigation with conflict detection
//! - [`signaling`]: channel contract, in-process hub, WebSocket client
//! - [`server`]: WebSocket relay in front of the hub
//! - [`call`]: media, peer links, quality sampling, reconnection
//! - [`coordinator`]: glue between UI actions and the engines
//! - [`testing`]: scriptable media devices and peer connections

pub mod call;
pub mod clock;
pub mod coordinator;
pub mod navigation;
pub mod protocol;
pub mod server;
pub mod signaling;
pub mod store;
pub mod testing;

// Re-exports for convenience
pub use call::{
    CallConfig, CallError, CallEvent, CallOrchestrator, CallState, ConnectionQuality,
    LinkState, LocalMediaState, MediaDevices, PeerConnection, PeerConnectionFactory,
    QualityClass,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{CoordinatorError, StudyCoordinator, UiEvent};
pub use navigation::{
    MoveOutcome, NavigationConfig, NavigationEvent, NavigationNotification, NavigationSync,
    Resolution,
};
pub use protocol::{
    IceCandidate, ParticipantId, ParticipantInfo, ProtocolError, RoomId, SignalMessage,
};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use signaling::{
    ConnectionState, HubConfig, HubEndpoint, HubStats, SignalError, SignalHub, SignalingChannel,
    WsSignaling,
};
pub use store::{MemoryPositionStore, PositionStore, StoreError};
