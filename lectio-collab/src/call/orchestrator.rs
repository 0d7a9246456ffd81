//! The call orchestrator.
//!
//! One instance drives at most one call at a time. Signaling messages and
//! peer events are turned into [`PeerTask`]s and serialized per
//! `(room, participant)` through a [`KeyedQueue`], so a slow negotiation
//! with one participant never holds up another while two events for the
//! same participant are handled strictly in arrival order.
//!
//! Every task carries the call epoch it was submitted under. Leaving bumps
//! the epoch, so work that completes after the call ended is discarded.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::link::{LinkRole, LinkState, PeerLink};
use super::media::{
    LocalMediaState, LocalStream, MediaConstraints, MediaDevices, RemoteMedia, TrackKind,
};
use super::peer::{
    PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventKind, PeerEventSink,
    SessionDescription,
};
use super::quality::{ConnectionQuality, QualityThresholds};
use super::queue::KeyedQueue;
use crate::clock::{Clock, SystemClock};
use crate::protocol::{IceCandidate, ParticipantId, ParticipantInfo, RoomId, SignalMessage};
use crate::signaling::{SignalError, SignalingChannel};

/// Call configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Interval between quality samples of one link
    pub sample_interval: Duration,
    pub max_reconnect_attempts: u8,
    /// Delay before attempt `n` is `reconnect_base_delay × n`
    pub reconnect_base_delay: Duration,
    pub thresholds: QualityThresholds,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(1000),
            thresholds: QualityThresholds::default(),
        }
    }
}

/// Call errors.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("A call is already active")]
    AlreadyActive,
    #[error("No call is active")]
    NoActiveCall,
    #[error("No media device available: {0}")]
    MediaUnavailable(String),
    #[error("Video is unavailable in audio-only mode")]
    VideoUnavailable,
    #[error("Lost connection to {name} after {attempts} reconnect attempts")]
    ReconnectExhausted {
        participant: ParticipantId,
        name: String,
        attempts: u8,
    },
    #[error("Negotiation with {participant} failed: {reason}")]
    Negotiation {
        participant: ParticipantId,
        reason: String,
    },
    #[error(transparent)]
    Signaling(#[from] SignalError),
    #[error("Call setup was cancelled")]
    Cancelled,
}

/// Discrete call notifications (any number of subscribers).
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A terminal failure the user should hear about
    Error(CallError),
    PeerConnected(ParticipantInfo),
    PeerLost(ParticipantId),
}

/// Per-participant slice of [`CallState`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantCallState {
    pub name: String,
    pub link: LinkState,
    pub role: LinkRole,
    pub quality: ConnectionQuality,
    pub reconnect_attempts: u8,
}

/// Full call state pushed to the single state subscriber.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallState {
    pub room: Option<RoomId>,
    pub is_connected: bool,
    pub media: LocalMediaState,
    pub participants: BTreeMap<ParticipantId, ParticipantCallState>,
    pub remote_media: Vec<RemoteMedia>,
}

// ─── Internal state ────────────────────────────────────────────────────────

struct CallSession {
    epoch: u64,
    room: RoomId,
    me: ParticipantInfo,
    stream: LocalStream,
    /// Bumped whenever `stream` is replaced
    stream_generation: u64,
    media: LocalMediaState,
    links: HashMap<ParticipantId, PeerLink>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    pump: Option<JoinHandle<()>>,
}

#[derive(Debug)]
enum PeerTask {
    Respond(ParticipantInfo),
    Initiate(ParticipantInfo),
    Offer { from: ParticipantId, sdp: String },
    Answer { from: ParticipantId, sdp: String },
    Candidate { from: ParticipantId, candidate: IceCandidate },
    Remove(ParticipantId),
    Peer(PeerEvent),
    Reconnect { participant: ParticipantId, attempt: u8 },
}

impl PeerTask {
    /// Tasks for an incoming signaling message, keyed by remote participant.
    fn from_signal(msg: SignalMessage, room: RoomId, me: ParticipantId) -> Vec<(ParticipantId, Self)> {
        if msg.room() != room {
            return Vec::new();
        }
        match msg {
            SignalMessage::ExistingParticipants { participants, .. } => participants
                .into_iter()
                .filter(|p| p.id != me)
                .map(|p| (p.id, Self::Respond(p)))
                .collect(),
            SignalMessage::ParticipantJoined { participant, .. } if participant.id != me => {
                vec![(participant.id, Self::Initiate(participant))]
            }
            SignalMessage::ParticipantLeft { participant_id, .. } if participant_id != me => {
                vec![(participant_id, Self::Remove(participant_id))]
            }
            SignalMessage::Offer { from, to, sdp, .. } if to == me => {
                vec![(from, Self::Offer { from, sdp })]
            }
            SignalMessage::Answer { from, to, sdp, .. } if to == me => {
                vec![(from, Self::Answer { from, sdp })]
            }
            SignalMessage::Candidate {
                from, to, candidate, ..
            } if to == me => vec![(from, Self::Candidate { from, candidate })],
            _ => Vec::new(),
        }
    }
}

struct CallInner {
    config: CallConfig,
    media: Arc<dyn MediaDevices>,
    connections: Arc<dyn PeerConnectionFactory>,
    signaling: Arc<dyn SignalingChannel>,
    clock: Arc<dyn Clock>,
    epoch: AtomicU64,
    starting: AtomicBool,
    next_link_id: AtomicU64,
    session: Mutex<Option<CallSession>>,
    queue: KeyedQueue<(RoomId, ParticipantId)>,
    state_tx: watch::Sender<CallState>,
    state_rx: Mutex<Option<watch::Receiver<CallState>>>,
    events: broadcast::Sender<CallEvent>,
}

/// Orchestrates one call: local media, peer links, quality and recovery.
///
/// Cheap to clone; clones drive the same call.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<CallInner>,
}

impl CallOrchestrator {
    pub fn new(
        config: CallConfig,
        media: Arc<dyn MediaDevices>,
        connections: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self::with_clock(config, media, connections, signaling, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CallConfig,
        media: Arc<dyn MediaDevices>,
        connections: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(CallState::default());
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CallInner {
                config,
                media,
                connections,
                signaling,
                clock,
                epoch: AtomicU64::new(0),
                starting: AtomicBool::new(false),
                next_link_id: AtomicU64::new(1),
                session: Mutex::new(None),
                queue: KeyedQueue::new(),
                state_tx,
                state_rx: Mutex::new(Some(state_rx)),
                events,
            }),
        }
    }

    /// Take the call state receiver (can only be called once).
    pub fn take_state_rx(&self) -> Option<watch::Receiver<CallState>> {
        self.inner
            .state_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Subscribe to discrete call events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Current call state.
    pub fn state(&self) -> CallState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock_session().is_some()
    }

    /// Senders currently attached to the link with `participant`.
    pub fn senders(&self, participant: ParticipantId) -> Option<Vec<TrackKind>> {
        self.inner
            .lock_session()
            .as_ref()
            .and_then(|s| s.links.get(&participant))
            .map(|link| link.connection().senders())
    }

    /// Start a call in `room`.
    ///
    /// Capture falls back to audio-only when video cannot be acquired.
    /// Failing to capture anything is terminal and also reported through
    /// [`CallEvent::Error`].
    pub async fn initialize_call(
        &self,
        room: RoomId,
        participant: ParticipantInfo,
        audio_only: bool,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        if participant.id != inner.signaling.participant().id {
            return Err(SignalError::Rejected(format!(
                "signaling channel does not speak for {}",
                participant.id
            ))
            .into());
        }
        if inner.lock_session().is_some() || inner.starting.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyActive);
        }

        let result = inner.start(room, participant, audio_only).await;
        inner.starting.store(false, Ordering::SeqCst);

        if let Err(e @ CallError::MediaUnavailable(_)) = &result {
            inner.report(e.clone());
        }
        result
    }

    /// Handle one signaling message and wait until it has been processed.
    ///
    /// Messages from the subscribed channel are handled automatically; this
    /// entry point serves transports that deliver messages out of band.
    pub async fn handle_signal(&self, msg: SignalMessage) -> Result<(), CallError> {
        let (epoch, room, me) = {
            let session = self.inner.lock_session();
            let session = session.as_ref().ok_or(CallError::NoActiveCall)?;
            (session.epoch, session.room, session.me.id)
        };

        let mut pending = Vec::new();
        for (participant, task) in PeerTask::from_signal(msg, room, me) {
            let (done_tx, done_rx) = oneshot::channel();
            self.inner.submit_then(epoch, room, participant, task, done_tx);
            pending.push(done_rx);
        }
        for done in pending {
            let _ = done.await;
        }
        Ok(())
    }

    /// Flip the local video track. Returns the new enabled flag.
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.inner.toggle(TrackKind::Video)
    }

    /// Flip the local audio track. Returns the new enabled flag.
    pub fn toggle_audio(&self) -> Result<bool, CallError> {
        self.inner.toggle(TrackKind::Audio)
    }

    /// Drop video for the rest of the call.
    pub async fn switch_to_audio_only(&self) -> Result<(), CallError> {
        self.inner.switch_to_audio_only().await
    }

    /// End the call. Calling it without an active call does nothing.
    pub async fn leave_call(&self) {
        self.inner.leave().await;
    }
}

impl CallInner {
    fn lock_session(&self) -> MutexGuard<'_, Option<CallSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the session if it still belongs to `epoch`.
    fn with_session<R>(&self, epoch: u64, f: impl FnOnce(&mut CallSession) -> R) -> Option<R> {
        let mut guard = self.lock_session();
        match guard.as_mut() {
            Some(session) if session.epoch == epoch => Some(f(session)),
            _ => None,
        }
    }

    fn report(&self, error: CallError) {
        log::error!("Call error: {error}");
        let _ = self.events.send(CallEvent::Error(error));
    }

    fn publish(&self) {
        let state = match self.lock_session().as_ref() {
            Some(session) => session_state(session),
            None => CallState::default(),
        };
        self.state_tx.send_replace(state);
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    async fn start(
        self: &Arc<Self>,
        room: RoomId,
        me: ParticipantInfo,
        audio_only: bool,
    ) -> Result<(), CallError> {
        let epoch = self.epoch.load(Ordering::SeqCst);

        let stream = self.capture(audio_only).await?;

        let media = LocalMediaState::from_stream(&stream);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let signals = self.signaling.subscribe();

        let pump = tokio::spawn(pump(
            Arc::downgrade(self),
            epoch,
            room,
            me.id,
            signals,
            peer_rx,
        ));

        {
            let mut guard = self.lock_session();
            // Checked under the lock so a concurrent leave either cancels
            // us here or finds the installed session.
            if self.epoch.load(Ordering::SeqCst) != epoch {
                drop(guard);
                pump.abort();
                stream.stop();
                log::info!("Call setup in room {room} superseded by leave");
                return Err(CallError::Cancelled);
            }
            *guard = Some(CallSession {
                epoch,
                room,
                me: me.clone(),
                stream,
                stream_generation: 0,
                media,
                links: HashMap::new(),
                peer_tx,
                pump: Some(pump),
            });
        }
        self.publish();

        let announce = SignalMessage::JoinCall {
            room,
            participant: me.clone(),
        };
        if let Err(e) = self.signaling.emit(announce).await {
            log::error!("Failed to announce {} in room {room}: {e}", me.name);
            self.teardown(false).await;
            return Err(e.into());
        }

        log::info!(
            "{} joined call in room {room} ({})",
            me.name,
            if media.audio_only { "audio only" } else { "audio + video" }
        );
        Ok(())
    }

    async fn capture(&self, audio_only: bool) -> Result<LocalStream, CallError> {
        if !audio_only {
            match self.media.acquire(MediaConstraints::AUDIO_VIDEO).await {
                Ok(stream) => return Ok(stream),
                Err(e) => log::info!("Video capture unavailable ({e}); falling back to audio only"),
            }
        }
        self.media
            .acquire(MediaConstraints::AUDIO_ONLY)
            .await
            .map_err(|e| CallError::MediaUnavailable(e.to_string()))
    }

    async fn leave(&self) {
        self.teardown(true).await;
    }

    /// Close everything belonging to the current call.
    async fn teardown(&self, announce: bool) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let Some(mut session) = self.lock_session().take() else {
            return;
        };

        if let Some(pump) = session.pump.take() {
            pump.abort();
        }
        self.queue.clear();

        let connections: Vec<Arc<dyn PeerConnection>> = session
            .links
            .values_mut()
            .map(PeerLink::shutdown)
            .collect();
        session.stream.stop();
        self.publish();

        for connection in connections {
            connection.close().await;
        }

        if announce {
            let msg = SignalMessage::LeaveCall {
                room: session.room,
                participant_id: session.me.id,
            };
            if let Err(e) = self.signaling.emit(msg).await {
                log::warn!("Failed to announce leaving room {}: {e}", session.room);
            }
        }

        log::info!(
            "{} left call in room {} ({} link(s) closed)",
            session.me.name,
            session.room,
            session.links.len()
        );
    }

    // ─── Local media ───────────────────────────────────────────────────────

    fn toggle(&self, kind: TrackKind) -> Result<bool, CallError> {
        let enabled = {
            let mut guard = self.lock_session();
            let session = guard.as_mut().ok_or(CallError::NoActiveCall)?;
            if kind == TrackKind::Video && session.media.audio_only {
                return Err(CallError::VideoUnavailable);
            }
            let track = session
                .stream
                .track(kind)
                .ok_or_else(|| CallError::MediaUnavailable(format!("no local {kind} track")))?;
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            match kind {
                TrackKind::Audio => session.media.audio_enabled = enabled,
                TrackKind::Video => session.media.video_enabled = enabled,
            }
            enabled
        };
        log::debug!("Local {kind} track enabled: {enabled}");
        self.publish();
        Ok(enabled)
    }

    async fn switch_to_audio_only(&self) -> Result<(), CallError> {
        let epoch = {
            let guard = self.lock_session();
            let session = guard.as_ref().ok_or(CallError::NoActiveCall)?;
            if session.media.audio_only {
                return Ok(());
            }
            session.epoch
        };

        let fresh = self
            .media
            .acquire(MediaConstraints::AUDIO_ONLY)
            .await
            .map_err(|e| CallError::MediaUnavailable(e.to_string()))?;

        let swapped = self.with_session(epoch, |session| {
            if session.media.audio_only {
                return None;
            }
            if let Some(audio) = fresh.track(TrackKind::Audio) {
                audio.set_enabled(session.media.audio_enabled);
            }
            let old = std::mem::replace(&mut session.stream, fresh.clone());
            session.stream_generation += 1;
            session.media.has_video = false;
            session.media.audio_only = true;
            session.media.video_enabled = false;
            let connections: Vec<Arc<dyn PeerConnection>> =
                session.links.values().map(PeerLink::connection).collect();
            Some((old, connections))
        });

        let (old, connections) = match swapped {
            Some(Some(swapped)) => swapped,
            // Another switch won the race.
            Some(None) => {
                fresh.stop();
                return Ok(());
            }
            None => {
                fresh.stop();
                return Err(CallError::Cancelled);
            }
        };

        old.stop();
        for connection in connections {
            apply_audio_only(connection.as_ref(), &fresh).await;
        }

        log::info!("Switched to audio only");
        self.publish();
        Ok(())
    }

    // ─── Task routing ──────────────────────────────────────────────────────

    fn submit(self: &Arc<Self>, epoch: u64, room: RoomId, participant: ParticipantId, task: PeerTask) {
        let inner = Arc::clone(self);
        self.queue.push((room, participant), async move {
            inner.run(epoch, task).await;
        });
    }

    fn submit_then(
        self: &Arc<Self>,
        epoch: u64,
        room: RoomId,
        participant: ParticipantId,
        task: PeerTask,
        done: oneshot::Sender<()>,
    ) {
        let inner = Arc::clone(self);
        self.queue.push((room, participant), async move {
            inner.run(epoch, task).await;
            let _ = done.send(());
        });
    }

    async fn run(self: Arc<Self>, epoch: u64, task: PeerTask) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        log::trace!("Running {task:?}");

        match task {
            PeerTask::Respond(participant) => self.respond(epoch, participant).await,
            PeerTask::Initiate(participant) => self.initiate(epoch, participant).await,
            PeerTask::Offer { from, sdp } => self.accept_offer(epoch, from, sdp).await,
            PeerTask::Answer { from, sdp } => self.accept_answer(epoch, from, sdp).await,
            PeerTask::Candidate { from, candidate } => {
                self.add_candidate(epoch, from, candidate).await
            }
            PeerTask::Remove(participant) => self.remove(epoch, participant).await,
            PeerTask::Peer(event) => self.on_peer_event(epoch, event).await,
            PeerTask::Reconnect {
                participant,
                attempt,
            } => self.reconnect(epoch, participant, attempt).await,
        }
    }

    // ─── Links ─────────────────────────────────────────────────────────────

    /// Create a link, attach local tracks and start its sampler. Any
    /// previous link with the participant is torn down.
    async fn open_link(
        self: &Arc<Self>,
        epoch: u64,
        participant: ParticipantInfo,
        role: LinkRole,
        reconnect_attempts: u8,
    ) -> Option<(u64, Arc<dyn PeerConnection>)> {
        let (peer_tx, stream, generation) = self.with_session(epoch, |s| {
            (s.peer_tx.clone(), s.stream.clone(), s.stream_generation)
        })?;

        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let sink = PeerEventSink::new(participant.id, link_id, peer_tx);
        let connection = match self.connections.create(sink).await {
            Ok(connection) => connection,
            Err(e) => {
                log::error!("Failed to create connection to {}: {e}", participant.name);
                return None;
            }
        };

        for track in stream.tracks() {
            if let Err(e) = connection.add_track(Arc::clone(track)).await {
                log::warn!("Failed to attach {} track for {}: {e}", track.kind(), participant.name);
            }
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.sample_interval;
        let installed = self.with_session(epoch, |s| {
            let mut link = PeerLink::new(link_id, participant.clone(), Arc::clone(&connection), role);
            link.set_reconnect_attempts(reconnect_attempts);
            link.set_sampler(tokio::spawn(sample_loop(
                weak,
                epoch,
                participant.id,
                link_id,
                interval,
            )));
            let replaced = s.links.insert(participant.id, link).map(|mut old| old.shutdown());
            (replaced, s.stream_generation != generation, s.stream.clone())
        });

        let Some((replaced, stream_changed, current)) = installed else {
            connection.close().await;
            return None;
        };

        if let Some(old) = replaced {
            old.close().await;
        }
        if stream_changed {
            apply_audio_only(connection.as_ref(), &current).await;
        }

        log::info!(
            "Opened link #{link_id} to {} ({}) as {role:?}",
            participant.name,
            participant.id
        );
        self.publish();
        Some((link_id, connection))
    }

    async fn respond(self: &Arc<Self>, epoch: u64, participant: ParticipantInfo) {
        let exists = self
            .with_session(epoch, |s| s.links.contains_key(&participant.id))
            .unwrap_or(true);
        if !exists {
            self.open_link(epoch, participant, LinkRole::Responder, 0).await;
        }
    }

    async fn initiate(self: &Arc<Self>, epoch: u64, participant: ParticipantInfo) {
        let live = self.with_session(epoch, |s| {
            s.links.get(&participant.id).map(|l| l.state().is_usable())
        });
        match live {
            None => return,
            Some(Some(true)) => {
                log::debug!("Link to {} already active; ignoring join", participant.name);
                return;
            }
            _ => {}
        }

        if let Some((link_id, connection)) =
            self.open_link(epoch, participant.clone(), LinkRole::Initiator, 0).await
        {
            self.send_offer(epoch, &participant, link_id, connection).await;
        }
    }

    async fn send_offer(
        self: &Arc<Self>,
        epoch: u64,
        participant: &ParticipantInfo,
        link_id: u64,
        connection: Arc<dyn PeerConnection>,
    ) {
        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return self.negotiation_failed(epoch, participant.id, link_id, e.to_string()),
        };
        if let Err(e) = connection.set_local_description(offer.clone()).await {
            return self.negotiation_failed(epoch, participant.id, link_id, e.to_string());
        }

        let Some((room, me)) = self.with_session(epoch, |s| {
            if let Some(link) = s.links.get_mut(&participant.id).filter(|l| l.id() == link_id) {
                link.set_offer_outstanding(true);
            }
            (s.room, s.me.id)
        }) else {
            return;
        };

        let msg = SignalMessage::Offer {
            room,
            from: me,
            to: participant.id,
            sdp: offer.sdp,
        };
        if let Err(e) = self.signaling.emit(msg).await {
            log::warn!("Failed to send offer to {}: {e}", participant.name);
        }
    }

    async fn accept_offer(self: &Arc<Self>, epoch: u64, from: ParticipantId, sdp: String) {
        let Some((me, existing)) = self.with_session(epoch, |s| {
            let existing = s.links.get(&from).map(|l| {
                (
                    l.id(),
                    l.connection(),
                    l.state(),
                    l.offer_outstanding(),
                    l.remote_description_set(),
                    l.reconnect_attempts(),
                    l.participant().clone(),
                )
            });
            (s.me.id, existing)
        }) else {
            return;
        };

        let (link_id, connection) = match existing {
            Some((_, _, state, true, false, attempts, participant)) if state.is_usable() => {
                // Both sides offered. The lower id yields and answers.
                if me < from {
                    log::debug!("Offer glare with {}; yielding", participant.name);
                    match self.open_link(epoch, participant, LinkRole::Responder, attempts).await {
                        Some(opened) => opened,
                        None => return,
                    }
                } else {
                    log::debug!("Offer glare with {}; keeping our offer", participant.name);
                    return;
                }
            }
            Some((id, connection, state, _, false, _, _)) if state.is_usable() => (id, connection),
            Some((_, _, _, _, _, attempts, participant)) => {
                match self.open_link(epoch, participant, LinkRole::Responder, attempts).await {
                    Some(opened) => opened,
                    None => return,
                }
            }
            None => {
                let participant = self.resolve(epoch, from).await;
                match self.open_link(epoch, participant, LinkRole::Responder, 0).await {
                    Some(opened) => opened,
                    None => return,
                }
            }
        };

        if let Err(e) = connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await
        {
            return self.negotiation_failed(epoch, from, link_id, e.to_string());
        }
        self.flush_candidates(epoch, from, link_id, connection.as_ref()).await;

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return self.negotiation_failed(epoch, from, link_id, e.to_string()),
        };
        if let Err(e) = connection.set_local_description(answer.clone()).await {
            return self.negotiation_failed(epoch, from, link_id, e.to_string());
        }

        let Some(room) = self.with_session(epoch, |s| s.room) else {
            return;
        };
        let msg = SignalMessage::Answer {
            room,
            from: me,
            to: from,
            sdp: answer.sdp,
        };
        if let Err(e) = self.signaling.emit(msg).await {
            log::warn!("Failed to send answer to {from}: {e}");
        }
    }

    async fn accept_answer(self: &Arc<Self>, epoch: u64, from: ParticipantId, sdp: String) {
        let link = self.with_session(epoch, |s| {
            s.links
                .get(&from)
                .filter(|l| l.offer_outstanding())
                .map(|l| (l.id(), l.connection()))
        });
        let Some(Some((link_id, connection))) = link else {
            log::warn!("Ignoring answer from {from}: no offer outstanding");
            return;
        };

        if let Err(e) = connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            return self.negotiation_failed(epoch, from, link_id, e.to_string());
        }
        self.flush_candidates(epoch, from, link_id, connection.as_ref()).await;
    }

    async fn add_candidate(self: &Arc<Self>, epoch: u64, from: ParticipantId, candidate: IceCandidate) {
        let known = self.with_session(epoch, |s| s.links.contains_key(&from));
        match known {
            None => return,
            Some(false) => {
                // Candidate before any offer: discover the sender as responder.
                let participant = self.resolve(epoch, from).await;
                if self
                    .open_link(epoch, participant, LinkRole::Responder, 0)
                    .await
                    .is_none()
                {
                    return;
                }
            }
            Some(true) => {}
        }

        let ready = self.with_session(epoch, |s| {
            let link = s.links.get_mut(&from)?;
            if link.remote_description_set() {
                Some(link.connection())
            } else {
                link.buffer_candidate(candidate.clone());
                None
            }
        });

        if let Some(Some(connection)) = ready {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                log::warn!("Failed to apply candidate from {from}: {e}");
            }
        } else {
            log::trace!("Buffered early candidate from {from}");
        }
    }

    async fn flush_candidates(
        &self,
        epoch: u64,
        participant: ParticipantId,
        link_id: u64,
        connection: &dyn PeerConnection,
    ) {
        let pending = self
            .with_session(epoch, |s| {
                s.links
                    .get_mut(&participant)
                    .filter(|l| l.id() == link_id)
                    .map(PeerLink::remote_description_applied)
            })
            .flatten()
            .unwrap_or_default();

        if !pending.is_empty() {
            log::debug!("Applying {} buffered candidate(s) from {participant}", pending.len());
        }
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                log::warn!("Failed to apply candidate from {participant}: {e}");
            }
        }
    }

    async fn remove(self: &Arc<Self>, epoch: u64, participant: ParticipantId) {
        let removed = self
            .with_session(epoch, |s| s.links.remove(&participant).map(|link| (s.room, link)))
            .flatten();
        if let Some((room, mut link)) = removed {
            // This job is the worker's last; it exits once the backlog drains.
            self.queue.remove(&(room, participant));
            let connection = link.shutdown();
            connection.close().await;
            log::info!("{} left the call", link.participant().name);
            let _ = self.events.send(CallEvent::PeerLost(participant));
            self.publish();
        }
    }

    /// Display identity of a participant known only by id.
    async fn resolve(&self, epoch: u64, participant: ParticipantId) -> ParticipantInfo {
        let Some(room) = self.with_session(epoch, |s| s.room) else {
            return ParticipantInfo::placeholder(participant);
        };
        self.signaling
            .members(room)
            .await
            .into_iter()
            .find(|p| p.id == participant)
            .unwrap_or_else(|| ParticipantInfo::placeholder(participant))
    }

    // ─── Peer events and recovery ──────────────────────────────────────────

    async fn on_peer_event(self: &Arc<Self>, epoch: u64, event: PeerEvent) {
        let participant = event.participant;
        let link_id = event.link_id;

        match event.kind {
            PeerEventKind::IceCandidate(candidate) => {
                let route = self.with_session(epoch, |s| {
                    s.links
                        .get(&participant)
                        .filter(|l| l.id() == link_id)
                        .map(|_| (s.room, s.me.id))
                });
                if let Some(Some((room, me))) = route {
                    let msg = SignalMessage::Candidate {
                        room,
                        from: me,
                        to: participant,
                        candidate,
                    };
                    if let Err(e) = self.signaling.emit(msg).await {
                        log::warn!("Failed to send candidate to {participant}: {e}");
                    }
                }
            }

            PeerEventKind::RemoteTrack { stream_id, kind } => {
                let updated = self.with_session(epoch, |s| {
                    s.links
                        .get_mut(&participant)
                        .filter(|l| l.id() == link_id)
                        .map(|l| l.add_remote_track(stream_id, kind))
                        .is_some()
                });
                if updated == Some(true) {
                    self.publish();
                }
            }

            PeerEventKind::StateChanged(transport) => {
                let Some(next) = LinkState::from_transport(transport) else {
                    return;
                };
                self.on_link_state(epoch, participant, link_id, next).await;
            }
        }
    }

    async fn on_link_state(
        self: &Arc<Self>,
        epoch: u64,
        participant: ParticipantId,
        link_id: u64,
        next: LinkState,
    ) {
        let outcome = self.with_session(epoch, |s| {
            let link = s.links.get_mut(&participant).filter(|l| l.id() == link_id)?;
            if link.state() == LinkState::Closed || !link.transition(next) {
                return None;
            }
            if next == LinkState::Connected {
                link.set_reconnect_attempts(0);
            }
            Some(link.participant().clone())
        });
        let Some(Some(info)) = outcome else {
            return;
        };

        match next {
            LinkState::Connected => {
                log::info!("Connected to {} ({participant})", info.name);
                let _ = self.events.send(CallEvent::PeerConnected(info));
            }
            LinkState::Failed => self.schedule_recovery(epoch, participant, link_id),
            LinkState::Closed => {
                // The remote side closed the transport.
                self.remove(epoch, participant).await;
                return;
            }
            _ => {}
        }
        self.publish();
    }

    fn negotiation_failed(self: &Arc<Self>, epoch: u64, participant: ParticipantId, link_id: u64, reason: String) {
        log::warn!("Negotiation with {participant} failed: {reason}");
        let failed = self.with_session(epoch, |s| {
            s.links
                .get_mut(&participant)
                .filter(|l| l.id() == link_id)
                .map(|l| l.transition(LinkState::Failed))
                .unwrap_or(false)
        });
        if failed == Some(true) {
            self.schedule_recovery(epoch, participant, link_id);
            self.publish();
        }
    }

    /// Plan the next reconnect attempt for a failed link, or give up.
    fn schedule_recovery(self: &Arc<Self>, epoch: u64, participant: ParticipantId, link_id: u64) {
        let max = self.config.max_reconnect_attempts;
        let now = self.clock.now_millis();

        let plan = self.with_session(epoch, |s| {
            let room = s.room;
            let link = s.links.get_mut(&participant).filter(|l| l.id() == link_id)?;
            let attempts = link.reconnect_attempts();
            if attempts < max {
                let attempt = attempts + 1;
                link.set_reconnect_attempts(attempt);
                Some((room, Ok(attempt), link.participant().clone()))
            } else {
                let connection = link.shutdown();
                link.quality_mut().record_unavailable(now);
                Some((room, Err(connection), link.participant().clone()))
            }
        });
        let Some(Some((room, plan, info))) = plan else {
            return;
        };

        match plan {
            Ok(attempt) => {
                let delay = self.config.reconnect_base_delay * u32::from(attempt);
                log::info!(
                    "Link to {} failed; reconnect attempt {attempt}/{max} in {delay:?}",
                    info.name
                );
                let weak = Arc::downgrade(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.submit(
                            epoch,
                            room,
                            participant,
                            PeerTask::Reconnect {
                                participant,
                                attempt,
                            },
                        );
                    }
                });
            }
            Err(connection) => {
                tokio::spawn(async move { connection.close().await });
                self.report(CallError::ReconnectExhausted {
                    participant,
                    name: info.name,
                    attempts: max,
                });
            }
        }
    }

    async fn reconnect(self: &Arc<Self>, epoch: u64, participant: ParticipantId, attempt: u8) {
        let due = self.with_session(epoch, |s| {
            s.links
                .get(&participant)
                .filter(|l| l.state() == LinkState::Failed && l.reconnect_attempts() == attempt)
                .map(|l| (l.participant().clone(), l.id()))
        });
        let Some(Some((info, old_id))) = due else {
            log::debug!("Reconnect attempt {attempt} for {participant} no longer needed");
            return;
        };

        log::info!("Reconnecting to {} (attempt {attempt})", info.name);
        match self
            .open_link(epoch, info.clone(), LinkRole::Initiator, attempt)
            .await
        {
            Some((link_id, connection)) => {
                self.send_offer(epoch, &info, link_id, connection).await;
            }
            None => {
                // The old link is still in place and failed; count this attempt.
                self.schedule_recovery(epoch, participant, old_id);
            }
        }
    }

    async fn sample(&self, epoch: u64, participant: ParticipantId, link_id: u64) {
        let connection = self
            .with_session(epoch, |s| {
                s.links
                    .get(&participant)
                    .filter(|l| l.id() == link_id && l.state() != LinkState::Closed)
                    .map(PeerLink::connection)
            })
            .flatten();
        let Some(connection) = connection else {
            return;
        };

        let stats = connection.stats().await;
        let now = self.clock.now_millis();
        let thresholds = self.config.thresholds;

        let sampled = self.with_session(epoch, |s| {
            let link = s
                .links
                .get_mut(&participant)
                .filter(|l| l.id() == link_id && l.state() != LinkState::Closed)?;
            match &stats {
                Ok(stats) => link.quality_mut().record(stats, &thresholds, now),
                Err(e) => {
                    log::debug!("Stats unavailable for {}: {e}", link.participant().name);
                    link.quality_mut().record_unavailable(now);
                }
            }
            Some(link.quality().class)
        });

        if let Some(Some(class)) = sampled {
            log::trace!("Quality of link to {participant}: {class:?}");
            self.publish();
        }
    }
}

// ─── Background tasks ──────────────────────────────────────────────────────

/// Forward signaling messages and peer events of one call into the queue.
async fn pump(
    inner: Weak<CallInner>,
    epoch: u64,
    room: RoomId,
    me: ParticipantId,
    mut signals: broadcast::Receiver<SignalMessage>,
    mut peers: mpsc::UnboundedReceiver<PeerEvent>,
) {
    loop {
        let tasks = tokio::select! {
            msg = signals.recv() => match msg {
                Ok(msg) => PeerTask::from_signal(msg, room, me),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Call signaling lagged by {n} messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = peers.recv() => match event {
                Some(event) => vec![(event.participant, PeerTask::Peer(event))],
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        for (participant, task) in tasks {
            inner.submit(epoch, room, participant, task);
        }
    }
}

/// Sample one link every `interval`, first sample one interval in.
async fn sample_loop(
    inner: Weak<CallInner>,
    epoch: u64,
    participant: ParticipantId,
    link_id: u64,
    interval: Duration,
) {
    let interval = interval.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sample(epoch, participant, link_id).await;
    }
}

async fn apply_audio_only(connection: &dyn PeerConnection, stream: &LocalStream) {
    if let Err(e) = connection.remove_track(TrackKind::Video).await {
        log::warn!("Failed to remove video sender: {e}");
    }
    if let Some(audio) = stream.track(TrackKind::Audio) {
        if let Err(e) = connection.replace_track(audio).await {
            log::warn!("Failed to replace audio sender: {e}");
        }
    }
}

fn session_state(session: &CallSession) -> CallState {
    let participants = session
        .links
        .iter()
        .map(|(id, link)| {
            (
                *id,
                ParticipantCallState {
                    name: link.participant().name.clone(),
                    link: link.state(),
                    role: link.role(),
                    quality: *link.quality(),
                    reconnect_attempts: link.reconnect_attempts(),
                },
            )
        })
        .collect();

    CallState {
        room: Some(session.room),
        is_connected: true,
        media: session.media,
        participants,
        remote_media: session
            .links
            .values()
            .filter_map(|l| l.remote_media().cloned())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{LinkStats, MediaTrack, QualityClass, TransportState};
    use crate::signaling::{HubEndpoint, SignalHub};
    use crate::testing::{ConnectMode, DeviceMode, FakeMediaDevices, FakePeerFactory};
    use uuid::Uuid;

    struct Peer {
        info: ParticipantInfo,
        call: CallOrchestrator,
        endpoint: Arc<HubEndpoint>,
        devices: Arc<FakeMediaDevices>,
        factory: Arc<FakePeerFactory>,
    }

    async fn peer(
        hub: &Arc<SignalHub>,
        room: RoomId,
        info: ParticipantInfo,
        devices: DeviceMode,
        connect: ConnectMode,
    ) -> Peer {
        let endpoint = Arc::new(hub.connect(info.clone()));
        endpoint.join_room(room).await.unwrap();
        let devices = Arc::new(FakeMediaDevices::new(devices));
        let factory = Arc::new(FakePeerFactory::new(connect));
        let call = CallOrchestrator::new(
            CallConfig::default(),
            devices.clone(),
            factory.clone(),
            endpoint.clone(),
        );
        Peer {
            info,
            call,
            endpoint,
            devices,
            factory,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn link_state(peer: &Peer, other: &Peer) -> Option<LinkState> {
        peer.call
            .state()
            .participants
            .get(&other.info.id)
            .map(|p| p.link)
    }

    async fn connected_pair(hub: &Arc<SignalHub>, room: RoomId) -> (Peer, Peer) {
        let alice = peer(hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Auto).await;
        let bob = peer(hub, room, ParticipantInfo::new("Bob"), DeviceMode::AudioVideo, ConnectMode::Auto).await;
        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();
        bob.call.initialize_call(room, bob.info.clone(), false).await.unwrap();
        wait_until(|| {
            link_state(&alice, &bob) == Some(LinkState::Connected)
                && link_state(&bob, &alice) == Some(LinkState::Connected)
        })
        .await;
        (alice, bob)
    }

    #[tokio::test]
    async fn test_initialize_with_audio_and_video() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Auto).await;

        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();

        let state = alice.call.state();
        assert!(state.is_connected);
        assert_eq!(state.room, Some(room));
        assert!(state.media.has_video && state.media.video_enabled);
        assert!(!state.media.audio_only);
        assert!(hub.in_call(room, alice.info.id).await);
    }

    #[tokio::test]
    async fn test_video_failure_falls_back_to_audio_only() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioOnly, ConnectMode::Auto).await;
        let mut events = alice.call.subscribe();

        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();

        let media = alice.call.state().media;
        assert!(media.audio_only);
        assert!(!media.video_enabled);
        assert!(media.audio_enabled);
        assert_eq!(
            alice.devices.requests(),
            vec![MediaConstraints::AUDIO_VIDEO, MediaConstraints::AUDIO_ONLY]
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_media_is_terminal() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::NoDevices, ConnectMode::Auto).await;
        let mut events = alice.call.subscribe();

        let err = alice
            .call
            .initialize_call(room, alice.info.clone(), false)
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::MediaUnavailable(_)));
        assert!(matches!(
            events.try_recv().unwrap(),
            CallEvent::Error(CallError::MediaUnavailable(_))
        ));
        assert!(!alice.call.is_active());
        assert!(!alice.call.state().is_connected);
        assert!(!hub.in_call(room, alice.info.id).await);
    }

    #[tokio::test]
    async fn test_second_initialize_rejected() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Auto).await;

        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();
        let err = alice
            .call
            .initialize_call(room, alice.info.clone(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::AlreadyActive));
    }

    #[tokio::test]
    async fn test_toggles() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Auto).await;
        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();

        assert!(!alice.call.toggle_video().unwrap());
        assert!(!alice.call.state().media.video_enabled);
        assert!(alice.call.toggle_video().unwrap());

        assert!(!alice.call.toggle_audio().unwrap());
        let audio = alice
            .devices
            .tracks()
            .into_iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .unwrap();
        assert!(!audio.is_enabled());
    }

    #[tokio::test]
    async fn test_toggle_video_in_audio_only_is_noop() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Auto).await;
        alice.call.initialize_call(room, alice.info.clone(), true).await.unwrap();

        let before = alice.call.state();
        let err = alice.call.toggle_video().unwrap_err();

        assert!(matches!(err, CallError::VideoUnavailable));
        assert!(!alice.call.state().media.video_enabled);
        assert_eq!(alice.call.state(), before);
    }

    #[tokio::test]
    async fn test_toggle_without_call() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Auto).await;
        assert!(matches!(alice.call.toggle_audio(), Err(CallError::NoActiveCall)));
    }

    #[tokio::test]
    async fn test_two_party_roles() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let (alice, bob) = connected_pair(&hub, room).await;

        let alice_view = &alice.call.state().participants[&bob.info.id];
        let bob_view = &bob.call.state().participants[&alice.info.id];
        assert_eq!(alice_view.role, LinkRole::Initiator);
        assert_eq!(bob_view.role, LinkRole::Responder);
        assert_eq!(alice_view.name, "Bob");
        assert_eq!(bob_view.name, "Alice");

        // Both sides exchanged their gathered candidates.
        let to_bob = alice.factory.latest(bob.info.id).unwrap();
        let to_alice = bob.factory.latest(alice.info.id).unwrap();
        wait_until(|| {
            to_bob.applied_candidates().len() == 1 && to_alice.applied_candidates().len() == 1
        })
        .await;
    }

    #[tokio::test]
    async fn test_switch_to_audio_only_removes_video_everywhere() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let (alice, bob) = connected_pair(&hub, room).await;
        let carol = peer(&hub, room, ParticipantInfo::new("Carol"), DeviceMode::AudioVideo, ConnectMode::Auto).await;
        carol.call.initialize_call(room, carol.info.clone(), false).await.unwrap();
        wait_until(|| link_state(&alice, &carol) == Some(LinkState::Connected)).await;

        let old_video = alice
            .devices
            .tracks()
            .into_iter()
            .find(|t| t.kind() == TrackKind::Video)
            .unwrap();

        alice.call.switch_to_audio_only().await.unwrap();

        for other in [&bob, &carol] {
            assert_eq!(alice.call.senders(other.info.id), Some(vec![TrackKind::Audio]));
        }
        let media = alice.call.state().media;
        assert!(media.audio_only);
        assert!(!media.video_enabled);
        assert!(!old_video.is_live());

        // Irreversible and idempotent.
        let requests = alice.devices.requests().len();
        alice.call.switch_to_audio_only().await.unwrap();
        assert_eq!(alice.devices.requests().len(), requests);
        assert!(matches!(alice.call.toggle_video(), Err(CallError::VideoUnavailable)));
    }

    #[tokio::test]
    async fn test_early_candidates_buffered_until_offer() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Manual).await;
        let bob = hub.connect(ParticipantInfo::new("Bob"));
        bob.join_room(room).await.unwrap();
        let mut bob_rx = bob.subscribe();
        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();

        let bob_id = bob.participant().id;
        for n in 1..=2 {
            alice
                .call
                .handle_signal(SignalMessage::Candidate {
                    room,
                    from: bob_id,
                    to: alice.info.id,
                    candidate: IceCandidate::new(format!("candidate:{n}")),
                })
                .await
                .unwrap();
        }

        // Implicit responder link, candidates parked.
        let state = alice.call.state();
        assert_eq!(state.participants[&bob_id].role, LinkRole::Responder);
        assert_eq!(state.participants[&bob_id].name, "Bob");
        let connection = alice.factory.latest(bob_id).unwrap();
        assert!(connection.applied_candidates().is_empty());

        alice
            .call
            .handle_signal(SignalMessage::Offer {
                room,
                from: bob_id,
                to: alice.info.id,
                sdp: "v=0 remote".into(),
            })
            .await
            .unwrap();

        let applied: Vec<String> = connection
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:1", "candidate:2"]);
        assert_eq!(alice.factory.connections_to(bob_id).len(), 1);

        let mut answered = false;
        while let Ok(msg) = bob_rx.try_recv() {
            answered |= matches!(msg, SignalMessage::Answer { to, .. } if to == bob_id);
        }
        assert!(answered);
    }

    async fn glare(alice_id: u128, bob_id: u128) -> (LinkRole, bool) {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice_info = ParticipantInfo::with_id(Uuid::from_u128(alice_id), "Alice");
        let alice = peer(&hub, room, alice_info, DeviceMode::AudioVideo, ConnectMode::Manual).await;
        let bob = hub.connect(ParticipantInfo::with_id(Uuid::from_u128(bob_id), "Bob"));
        bob.join_room(room).await.unwrap();
        let mut bob_rx = bob.subscribe();
        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();

        let bob_info = bob.participant().clone();
        alice
            .call
            .handle_signal(SignalMessage::ParticipantJoined {
                room,
                participant: bob_info.clone(),
            })
            .await
            .unwrap();
        alice
            .call
            .handle_signal(SignalMessage::Offer {
                room,
                from: bob_info.id,
                to: alice.info.id,
                sdp: "v=0 glare".into(),
            })
            .await
            .unwrap();

        let mut answered = false;
        while let Ok(msg) = bob_rx.try_recv() {
            answered |= matches!(msg, SignalMessage::Answer { .. });
        }
        (alice.call.state().participants[&bob_info.id].role, answered)
    }

    #[tokio::test]
    async fn test_glare_lower_id_yields() {
        assert_eq!(glare(1, 2).await, (LinkRole::Responder, true));
    }

    #[tokio::test]
    async fn test_glare_higher_id_keeps_offer() {
        assert_eq!(glare(2, 1).await, (LinkRole::Initiator, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_exhausted() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::FailImmediately).await;
        let bob = hub.connect(ParticipantInfo::new("Bob"));
        bob.join_room(room).await.unwrap();
        let mut events = alice.call.subscribe();
        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();

        bob.emit(SignalMessage::JoinCall {
            room,
            participant: bob.participant().clone(),
        })
        .await
        .unwrap();

        let exhausted = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if let Ok(CallEvent::Error(CallError::ReconnectExhausted { participant, attempts, .. })) =
                    events.recv().await
                {
                    break (participant, attempts);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(exhausted, (bob.participant().id, 3));

        // One original link plus three attempts, and nothing after that.
        let bob_id = bob.participant().id;
        assert_eq!(alice.factory.connections_to(bob_id).len(), 4);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(alice.factory.connections_to(bob_id).len(), 4);

        let view = &alice.call.state().participants[&bob_id];
        assert_eq!(view.link, LinkState::Closed);
        assert_eq!(view.quality.class, QualityClass::Disconnected);
        assert_eq!(view.reconnect_attempts, 3);
        assert!(alice.factory.latest(bob_id).unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_link_recovers_and_resets_counter() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let (alice, bob) = connected_pair(&hub, room).await;

        let first = alice.factory.latest(bob.info.id).unwrap();
        first.emit_state(TransportState::Failed);
        wait_until(|| link_state(&alice, &bob) == Some(LinkState::Failed)).await;
        assert_eq!(alice.call.state().participants[&bob.info.id].reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        wait_until(|| {
            alice.factory.connections_to(bob.info.id).len() == 2
                && link_state(&alice, &bob) == Some(LinkState::Connected)
        })
        .await;

        let view = &alice.call.state().participants[&bob.info.id];
        assert_eq!(view.reconnect_attempts, 0);
        assert_eq!(view.role, LinkRole::Initiator);
        assert!(first.is_closed());
        wait_until(|| link_state(&bob, &alice) == Some(LinkState::Connected)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_sampling() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let (alice, bob) = connected_pair(&hub, room).await;
        let quality = |p: &Peer| alice.call.state().participants[&p.info.id].quality;

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(quality(&bob).class, QualityClass::Excellent);

        let connection = alice.factory.latest(bob.info.id).unwrap();
        connection.set_stats(Some(LinkStats {
            packets_received: 900,
            packets_lost: 100,
            round_trip: Duration::from_millis(90),
        }));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(quality(&bob).class, QualityClass::Poor);
        assert_eq!(quality(&bob).round_trip, Some(Duration::from_millis(90)));

        connection.set_stats(None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(quality(&bob).class, QualityClass::Disconnected);
    }

    #[tokio::test]
    async fn test_participant_left_removes_link() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let (alice, bob) = connected_pair(&hub, room).await;
        let mut events = alice.call.subscribe();
        let connection = alice.factory.latest(bob.info.id).unwrap();

        bob.call.leave_call().await;

        wait_until(|| alice.call.state().participants.is_empty()).await;
        assert!(connection.is_closed());
        assert!(matches!(events.recv().await.unwrap(), CallEvent::PeerLost(id) if id == bob.info.id));
        // Bob's worker is retired along with the link.
        assert!(alice.call.inner.queue.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_join_opens_single_link() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Manual).await;
        let bob = ParticipantInfo::new("Bob");
        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();

        let joined = SignalMessage::ParticipantJoined {
            room,
            participant: bob.clone(),
        };
        let (first, second) = tokio::join!(
            alice.call.handle_signal(joined.clone()),
            alice.call.handle_signal(joined)
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(alice.factory.connections_to(bob.id).len(), 1);
        let participants = alice.call.state().participants;
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[&bob.id].role, LinkRole::Initiator);
        assert_eq!(participants[&bob.id].link, LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_leave_call_resets_and_is_idempotent() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let (alice, bob) = connected_pair(&hub, room).await;
        let mut state_rx = alice.call.take_state_rx().unwrap();
        assert!(alice.call.take_state_rx().is_none());

        alice.call.leave_call().await;

        assert_eq!(alice.call.state(), CallState::default());
        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow_and_update(), CallState::default());
        assert!(alice.devices.tracks().iter().all(|t| !t.is_live()));
        assert!(alice.factory.connections().iter().all(|c| c.is_closed()));
        assert!(!hub.in_call(room, alice.info.id).await);
        wait_until(|| bob.call.state().participants.is_empty()).await;

        alice.call.leave_call().await;
        assert_eq!(alice.call.state(), CallState::default());
        assert_eq!(bob.endpoint.members(room).await.len(), 2);
    }

    #[tokio::test]
    async fn test_leave_during_capture_cancels() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Auto).await;
        let gate = alice.devices.hold();

        let call = alice.call.clone();
        let info = alice.info.clone();
        let pending = tokio::spawn(async move { call.initialize_call(room, info, false).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        alice.call.leave_call().await;
        gate.notify_one();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(CallError::Cancelled)));
        assert!(!alice.call.is_active());
        assert!(alice.devices.tracks().iter().all(|t| !t.is_live()));
        assert!(!hub.in_call(room, alice.info.id).await);
    }

    #[tokio::test]
    async fn test_connection_create_failure_leaves_no_link() {
        let hub = Arc::new(SignalHub::with_defaults());
        let room = Uuid::new_v4();
        let alice = peer(&hub, room, ParticipantInfo::new("Alice"), DeviceMode::AudioVideo, ConnectMode::Manual).await;
        alice.call.initialize_call(room, alice.info.clone(), false).await.unwrap();
        alice.factory.fail_next(1);

        let stranger = ParticipantInfo::new("Dana");
        alice
            .call
            .handle_signal(SignalMessage::ParticipantJoined {
                room,
                participant: stranger.clone(),
            })
            .await
            .unwrap();

        // No connection, no link and no phantom quality entry.
        assert!(alice.call.state().participants.is_empty());
        assert!(alice.factory.connections().is_empty());
    }
}
