//! Deterministic media and peer-connection doubles.
//!
//! Used by the crate's own tests and available to embedders that want to
//! drive a [`crate::call::CallOrchestrator`] without real devices.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::call::{
    LinkStats, LocalStream, MediaConstraints, MediaDevices, MediaError, MediaTrack,
    PeerConnection, PeerConnectionFactory, PeerError, PeerEventKind, PeerEventSink,
    SessionDescription, TrackKind, TransportState,
};
use crate::protocol::{IceCandidate, ParticipantId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Media ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{kind}-{}", &Uuid::new_v4().to_string()[..8]),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Which devices the fake machine has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    AudioVideo,
    /// Camera missing or busy
    AudioOnly,
    /// Nothing to capture
    NoDevices,
}

pub struct FakeMediaDevices {
    mode: Mutex<DeviceMode>,
    requests: Mutex<Vec<MediaConstraints>>,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeMediaDevices {
    pub fn new(mode: DeviceMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            requests: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    pub fn set_mode(&self, mode: DeviceMode) {
        *lock(&self.mode) = mode;
    }

    /// Constraints of every capture request so far.
    pub fn requests(&self) -> Vec<MediaConstraints> {
        lock(&self.requests).clone()
    }

    /// Every track handed out so far.
    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        lock(&self.issued).clone()
    }

    /// Make the next capture wait until the returned handle is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.gate) = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        let gate = lock(&self.gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        lock(&self.requests).push(constraints);
        let mode = *lock(&self.mode);
        if mode == DeviceMode::NoDevices {
            return Err(MediaError::NotFound(TrackKind::Audio));
        }
        if constraints.video && mode != DeviceMode::AudioVideo {
            return Err(MediaError::NotFound(TrackKind::Video));
        }

        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }

        let tracks: Vec<Arc<FakeTrack>> = kinds.into_iter().map(|k| Arc::new(FakeTrack::new(k))).collect();
        lock(&self.issued).extend(tracks.iter().cloned());
        Ok(LocalStream::new(
            tracks
                .into_iter()
                .map(|t| t as Arc<dyn MediaTrack>)
                .collect(),
        ))
    }
}

// ─── Peer connections ──────────────────────────────────────────────────────

/// How fake transports behave once negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Report `Connected` once both descriptions are set
    Auto,
    /// Report nothing; the test drives state with `emit_state`
    Manual,
    /// Report `Failed` as soon as the local description is set
    FailImmediately,
}

pub struct FakePeerConnection {
    sink: PeerEventSink,
    mode: ConnectMode,
    senders: Mutex<Vec<Arc<dyn MediaTrack>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<IceCandidate>>,
    stats: Mutex<Option<LinkStats>>,
    reported_connected: AtomicBool,
    closed: AtomicBool,
}

impl FakePeerConnection {
    pub fn new(sink: PeerEventSink, mode: ConnectMode) -> Self {
        Self {
            sink,
            mode,
            senders: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            stats: Mutex::new(Some(LinkStats {
                packets_received: 1000,
                packets_lost: 0,
                round_trip: Duration::from_millis(40),
            })),
            reported_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// A connection whose events go nowhere.
    pub fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self::new(PeerEventSink::new(Uuid::nil(), 0, tx), ConnectMode::Manual)
    }

    pub fn participant(&self) -> ParticipantId {
        self.sink.participant()
    }

    pub fn link_id(&self) -> u64 {
        self.sink.link_id()
    }

    /// Report a transport state change.
    pub fn emit_state(&self, state: TransportState) {
        self.sink.emit(PeerEventKind::StateChanged(state));
    }

    /// Report remote media.
    pub fn emit_remote_track(&self, stream_id: &str, kind: TrackKind) {
        self.sink.emit(PeerEventKind::RemoteTrack {
            stream_id: stream_id.to_string(),
            kind,
        });
    }

    /// Statistics returned by `stats()`; `None` makes it fail.
    pub fn set_stats(&self, stats: Option<LinkStats>) {
        *lock(&self.stats) = stats;
    }

    /// Candidates applied with a remote description in place.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.applied).clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.local).clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.remote).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn maybe_connect(&self) {
        if self.mode != ConnectMode::Auto {
            return;
        }
        let negotiated = lock(&self.local).is_some() && lock(&self.remote).is_some();
        if negotiated && !self.reported_connected.swap(true, Ordering::SeqCst) {
            self.emit_state(TransportState::Connected);
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;
        lock(&self.senders).push(track);
        Ok(())
    }

    async fn remove_track(&self, kind: TrackKind) -> Result<bool, PeerError> {
        self.ensure_open()?;
        let mut senders = lock(&self.senders);
        let before = senders.len();
        senders.retain(|t| t.kind() != kind);
        Ok(senders.len() != before)
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;
        let mut senders = lock(&self.senders);
        match senders.iter_mut().find(|t| t.kind() == track.kind()) {
            Some(slot) => {
                *slot = track;
                Ok(())
            }
            None => Err(PeerError::InvalidState(format!("no {} sender", track.kind()))),
        }
    }

    fn senders(&self) -> Vec<TrackKind> {
        lock(&self.senders).iter().map(|t| t.kind()).collect()
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("v=0 offer link {}", self.link_id())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if lock(&self.remote).is_none() {
            return Err(PeerError::InvalidState("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("v=0 answer link {}", self.link_id())))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        *lock(&self.local) = Some(desc);
        self.sink.emit(PeerEventKind::IceCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.1 5000 typ host", self.link_id()),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
        if self.mode == ConnectMode::FailImmediately {
            self.emit_state(TransportState::Failed);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        *lock(&self.remote) = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        if lock(&self.remote).is_none() {
            return Err(PeerError::InvalidState(
                "candidate before remote description".into(),
            ));
        }
        lock(&self.applied).push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<LinkStats, PeerError> {
        self.ensure_open()?;
        (*lock(&self.stats)).ok_or_else(|| PeerError::StatsUnavailable("no report".into()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakePeerFactory {
    mode: Mutex<ConnectMode>,
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    failures: AtomicU64,
}

impl FakePeerFactory {
    pub fn new(mode: ConnectMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            created: Mutex::new(Vec::new()),
            failures: AtomicU64::new(0),
        }
    }

    /// Mode for connections created from now on.
    pub fn set_mode(&self, mode: ConnectMode) {
        *lock(&self.mode) = mode;
    }

    /// Make the next `n` `create` calls fail.
    pub fn fail_next(&self, n: u64) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<FakePeerConnection>> {
        lock(&self.created).clone()
    }

    /// Connections created for one remote participant, oldest first.
    pub fn connections_to(&self, participant: ParticipantId) -> Vec<Arc<FakePeerConnection>> {
        lock(&self.created)
            .iter()
            .filter(|c| c.participant() == participant)
            .cloned()
            .collect()
    }

    /// Most recent connection to `participant`.
    pub fn latest(&self, participant: ParticipantId) -> Option<Arc<FakePeerConnection>> {
        self.connections_to(participant).pop()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PeerError::Negotiation("transport unavailable".into()));
        }

        let connection = Arc::new(FakePeerConnection::new(sink, *lock(&self.mode)));
        lock(&self.created).push(connection.clone());
        Ok(connection)
    }
}
