//! Fakes für Engine-Tests

use super::config::{CallConfig, IceServerConfig};
use super::engine::{CallEngine, CallEngineError};
use super::media::{LocalMediaDevices, MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind};
use super::observer::{CallObserver, ConnectionState, StreamKind};
use super::peer::{
    DataChannel, DataChannelState, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, RemoteStream, RemoteTrack, TrackSender,
};
use crate::signaling::{
    IceCandidate, SessionDescription, SignalHandler, SignalingMessage, SignalingTransport,
    Subscription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::rtp::packet::Packet;

pub(crate) const FAKE_OFFER: &str = "v=0 fake-offer";
pub(crate) const FAKE_ANSWER: &str = "v=0 fake-answer";

/// Lässt Event-Loop und Timer-Tasks laufen, ohne die Uhr zu bewegen
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub(crate) struct FakeTransport {
    user_id: Option<String>,
    sent: Mutex<Vec<SignalingMessage>>,
    handler: Arc<Mutex<Option<SignalHandler>>>,
    online: AtomicBool,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::for_user(Some("me"))
    }
}

impl FakeTransport {
    pub(crate) fn for_user(user_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            sent: Mutex::new(Vec::new()),
            handler: Arc::new(Mutex::new(None)),
            online: AtomicBool::new(true),
        }
    }

    pub(crate) fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub(crate) fn deliver(&self, message: SignalingMessage) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(message);
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }
}

impl SignalingTransport for FakeTransport {
    fn send_signal(&self, message: &SignalingMessage) -> bool {
        if !self.online.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().push(message.clone());
        true
    }

    fn local_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn on_signal(&self, handler: SignalHandler) -> Subscription {
        *self.handler.lock() = Some(handler);
        let slot = Arc::clone(&self.handler);
        Subscription::new(move || {
            slot.lock().take();
        })
    }
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

#[derive(Default)]
pub(crate) struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub(crate) fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub(crate) fn peer(&self, index: usize) -> Arc<FakePeer> {
        Arc::clone(&self.peers.lock()[index])
    }

    pub(crate) fn last(&self) -> Arc<FakePeer> {
        Arc::clone(self.peers.lock().last().expect("no peer connection created"))
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallEngineError> {
        let peer = Arc::new(FakePeer {
            events,
            ice_servers: ice_servers.to_vec(),
            senders: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

pub(crate) struct FakePeer {
    events: PeerEventSink,
    pub ice_servers: Vec<IceServerConfig>,
    senders: Mutex<Vec<Arc<FakeSender>>>,
    data_channels: Mutex<Vec<Arc<FakeDataChannel>>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakePeer {
    /// Simuliert ein natives Event der Peer Connection
    pub(crate) fn emit(&self, event: PeerEvent) {
        self.events.emit(event);
    }

    pub(crate) fn senders(&self) -> Vec<Arc<FakeSender>> {
        self.senders.lock().clone()
    }

    pub(crate) fn sender(&self, kind: TrackKind) -> Option<Arc<FakeSender>> {
        self.senders.lock().iter().find(|s| s.kind == kind).cloned()
    }

    pub(crate) fn data_channels(&self) -> Vec<Arc<FakeDataChannel>> {
        self.data_channels.lock().clone()
    }

    pub(crate) fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub(crate) fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(
        &self,
        track: Arc<MediaTrack>,
    ) -> Result<Arc<dyn TrackSender>, CallEngineError> {
        let sender = Arc::new(FakeSender {
            kind: track.kind(),
            track: Mutex::new(Some(track)),
        });
        self.senders.lock().push(Arc::clone(&sender));
        Ok(sender)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, CallEngineError> {
        let channel = FakeDataChannel::new(label);
        self.data_channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallEngineError> {
        Ok(SessionDescription::offer(FAKE_OFFER))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallEngineError> {
        if self.remote_description.lock().is_none() {
            return Err(CallEngineError::WebRtc("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(FAKE_ANSWER))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallEngineError> {
        *self.local_description.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallEngineError> {
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallEngineError> {
        // Wie im Browser: ohne Remote Description kein Candidate
        if self.remote_description.lock().is_none() {
            return Err(CallEngineError::WebRtc(
                "remote description not set".to_string(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), CallEngineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeSender {
    kind: TrackKind,
    track: Mutex<Option<Arc<MediaTrack>>>,
}

impl FakeSender {
    pub(crate) fn current(&self) -> Option<Arc<MediaTrack>> {
        self.track.lock().clone()
    }
}

#[async_trait]
impl TrackSender for FakeSender {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn replace_track(&self, track: Option<Arc<MediaTrack>>) -> Result<(), CallEngineError> {
        *self.track.lock() = track;
        Ok(())
    }
}

pub(crate) struct FakeDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    sent: Mutex<Vec<String>>,
}

impl FakeDataChannel {
    pub(crate) fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn open(&self) {
        *self.state.lock() = DataChannelState::Open;
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.state.lock() == DataChannelState::Closed
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: String) -> Result<(), CallEngineError> {
        if *self.state.lock() != DataChannelState::Open {
            return Err(CallEngineError::WebRtc("data channel not open".to_string()));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), CallEngineError> {
        *self.state.lock() = DataChannelState::Closed;
        Ok(())
    }
}

pub(crate) struct FakeRemoteTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
}

impl FakeRemoteTrack {
    pub(crate) fn new(id: &str, stream_id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            kind,
        })
    }
}

#[async_trait]
impl RemoteTrack for FakeRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn read_rtp(&self) -> Result<Packet, CallEngineError> {
        Err(CallEngineError::WebRtc("fake track carries no media".to_string()))
    }
}

// ============================================================================
// MEDIA
// ============================================================================

pub(crate) struct FailingMediaDevices;

#[async_trait]
impl MediaDevices for FailingMediaDevices {
    async fn get_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        Err(MediaError::PermissionDenied("camera blocked".to_string()))
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        Err(MediaError::PermissionDenied("screen capture blocked".to_string()))
    }
}

// ============================================================================
// OBSERVER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Observed {
    State(ConnectionState),
    RemoteStream(usize),
    StreamEnded(StreamKind),
    Error(String),
    DataMessage(serde_json::Value),
    Incoming(String, Option<String>),
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    fn collect<T>(&self, pick: impl Fn(&Observed) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(pick).collect()
    }

    pub(crate) fn states(&self) -> Vec<ConnectionState> {
        self.collect(|e| match e {
            Observed::State(s) => Some(*s),
            _ => None,
        })
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.collect(|e| match e {
            Observed::Error(m) => Some(m.clone()),
            _ => None,
        })
    }

    pub(crate) fn ended_streams(&self) -> Vec<StreamKind> {
        self.collect(|e| match e {
            Observed::StreamEnded(k) => Some(*k),
            _ => None,
        })
    }

    pub(crate) fn remote_stream_sizes(&self) -> Vec<usize> {
        self.collect(|e| match e {
            Observed::RemoteStream(n) => Some(*n),
            _ => None,
        })
    }

    pub(crate) fn data_messages(&self) -> Vec<serde_json::Value> {
        self.collect(|e| match e {
            Observed::DataMessage(v) => Some(v.clone()),
            _ => None,
        })
    }

    pub(crate) fn incoming(&self) -> Vec<(String, Option<String>)> {
        self.collect(|e| match e {
            Observed::Incoming(id, from) => Some((id.clone(), from.clone())),
            _ => None,
        })
    }
}

impl CallObserver for RecordingObserver {
    fn on_connection_state_change(&self, state: ConnectionState) {
        self.events.lock().push(Observed::State(state));
    }

    fn on_remote_stream(&self, stream: RemoteStream) {
        self.events
            .lock()
            .push(Observed::RemoteStream(stream.tracks().len()));
    }

    fn on_stream_ended(&self, kind: StreamKind) {
        self.events.lock().push(Observed::StreamEnded(kind));
    }

    fn on_error(&self, message: String) {
        self.events.lock().push(Observed::Error(message));
    }

    fn on_data_channel_message(&self, message: serde_json::Value) {
        self.events.lock().push(Observed::DataMessage(message));
    }

    fn on_incoming_call(&self, call_id: &str, from_user_id: Option<&str>) {
        self.events.lock().push(Observed::Incoming(
            call_id.to_string(),
            from_user_id.map(str::to_string),
        ));
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub(crate) struct Harness {
    pub engine: CallEngine,
    pub transport: Arc<FakeTransport>,
    pub peers: Arc<FakePeerFactory>,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub(crate) fn new(config: CallConfig) -> Self {
        Self::with_media(config, Arc::new(LocalMediaDevices))
    }

    /// Engine mit eigener Kennung, z.B. für zwei Engines an einem Relay
    pub(crate) fn for_user(config: CallConfig, user_id: Option<&str>) -> Self {
        Self::build(config, Arc::new(LocalMediaDevices), FakeTransport::for_user(user_id))
    }

    pub(crate) fn with_media(config: CallConfig, media: Arc<dyn MediaDevices>) -> Self {
        Self::build(config, media, FakeTransport::default())
    }

    fn build(config: CallConfig, media: Arc<dyn MediaDevices>, transport: FakeTransport) -> Self {
        let transport = Arc::new(transport);
        let peers = Arc::new(FakePeerFactory::default());
        let observer = Arc::new(RecordingObserver::default());

        let engine = CallEngine::with_backends(
            config,
            Arc::clone(&transport) as Arc<dyn SignalingTransport>,
            Arc::clone(&peers) as Arc<dyn PeerConnectionFactory>,
            media,
            Arc::clone(&observer) as Arc<dyn CallObserver>,
        );

        Self {
            engine,
            transport,
            peers,
            observer,
        }
    }
}
