//! WebRTC Call Engine
//!
//! Zustandsmaschine einer Eins-zu-eins Video-Sitzung: wählen, annehmen,
//! ablehnen, beenden, Offer/Answer/ICE Austausch, Bildschirmfreigabe,
//! Data Channel und Neuversuche bei Verbindungsverlust.
//!
//! Eingehendes Signaling, Peer-Events und Timer laufen über eine Queue und
//! werden von einem Task nacheinander abgearbeitet. Öffentliche Methoden
//! nehmen denselben Sitzungs-Lock.

use super::config::CallConfig;
use super::media::{LocalMediaDevices, MediaDevices, MediaError, MediaStream, TrackKind};
use super::observer::{CallObserver, ConnectionState, StreamKind};
use super::peer::{
    DataChannel, DataChannelState, PeerConnectionFactory, PeerEvent, PeerEventSink, PeerState,
    RemoteStream,
};
use super::session::{ActiveCall, CallSnapshot, IncomingCall, PeerLink, TaskGuard};
use super::webrtc_peer::WebRtcPeerFactory;
use crate::signaling::{
    generate_call_id, CallControl, CallType, IceCandidate, SessionDescription, SignalingMessage,
    SignalingTransport, Subscription, WebRtcSignal,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active peer connection")]
    NoPeerConnection,

    #[error("No outgoing video track")]
    NoVideoSender,

    #[error("Screen sharing is disabled")]
    ScreenShareDisabled,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Signaling channel is not connected")]
    SignalingUnavailable,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// DATA CHANNEL CONTROL MESSAGES
// ============================================================================

/// Statusmeldungen an das Gegenüber über den Data Channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    AudioToggle { enabled: bool },
    VideoToggle { enabled: bool },
    ScreenShare { active: bool },
}

// ============================================================================
// ENGINE INPUT
// ============================================================================

/// Alles, was die Sitzung von außen verändert, läuft hier durch
enum EngineInput {
    Signal(SignalingMessage),
    Peer { generation: u64, event: PeerEvent },
    ConnectionTimeout { generation: u64 },
    RetryDue { generation: u64 },
    ScreenShareEnded { generation: u64, track_id: String },
}

#[derive(Default)]
struct Slot {
    call: Option<ActiveCall>,
    incoming: Option<IncomingCall>,
}

impl Slot {
    fn call_mut(&mut self, call_id: &str) -> Option<&mut ActiveCall> {
        self.call.as_mut().filter(|c| c.call_id == call_id)
    }

    fn link_generation(&self) -> Option<u64> {
        self.call
            .as_ref()
            .and_then(|c| c.link.as_ref())
            .map(|l| l.generation)
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    inner: Arc<EngineInner>,
    subscription: Mutex<Option<Subscription>>,
    event_loop: JoinHandle<()>,
}

struct EngineInner {
    config: CallConfig,
    transport: Arc<dyn SignalingTransport>,
    peers: Arc<dyn PeerConnectionFactory>,
    media: Arc<dyn MediaDevices>,
    observer: Arc<dyn CallObserver>,
    local_user_id: Option<String>,
    state: RwLock<ConnectionState>,
    slot: tokio::sync::Mutex<Slot>,
    input_tx: mpsc::UnboundedSender<EngineInput>,
    generation: AtomicU64,
}

impl CallEngine {
    /// Erstellt eine CallEngine mit dem `webrtc` Backend
    ///
    /// Muss innerhalb einer Tokio Runtime aufgerufen werden.
    pub fn new(
        config: CallConfig,
        transport: Arc<dyn SignalingTransport>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        Self::with_backends(
            config,
            transport,
            Arc::new(WebRtcPeerFactory),
            Arc::new(LocalMediaDevices),
            observer,
        )
    }

    pub fn with_backends(
        config: CallConfig,
        transport: Arc<dyn SignalingTransport>,
        peers: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaDevices>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let local_user_id = transport.local_user_id();
        if local_user_id.is_none() {
            tracing::warn!("No local user id configured, envelopes go out without fromUserId");
        }

        // Eingehende Umschläge landen in derselben Queue wie Peer-Events
        let signal_tx = input_tx.clone();
        let subscription = transport.on_signal(Box::new(move |message| {
            let _ = signal_tx.send(EngineInput::Signal(message));
        }));

        let inner = Arc::new(EngineInner {
            config,
            transport,
            peers,
            media,
            observer,
            local_user_id,
            state: RwLock::new(ConnectionState::Disconnected),
            slot: tokio::sync::Mutex::new(Slot::default()),
            input_tx,
            generation: AtomicU64::new(0),
        });

        let event_loop = tokio::spawn(run_event_loop(Arc::downgrade(&inner), input_rx));

        Self {
            inner,
            subscription: Mutex::new(Some(subscription)),
            event_loop,
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let slot = self.inner.slot.lock().await;
        CallSnapshot::capture(
            self.inner.current_state(),
            slot.call.as_ref(),
            slot.incoming.as_ref(),
        )
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        let slot = self.inner.slot.lock().await;
        slot.call.as_ref().and_then(|c| c.local_stream.clone())
    }

    pub async fn screen_stream(&self) -> Option<MediaStream> {
        let slot = self.inner.slot.lock().await;
        slot.call
            .as_ref()
            .and_then(|c| c.link.as_ref())
            .and_then(|l| l.screen_stream.clone())
    }

    pub async fn remote_stream(&self) -> Option<RemoteStream> {
        let slot = self.inner.slot.lock().await;
        slot.call
            .as_ref()
            .and_then(|c| c.link.as_ref())
            .and_then(|l| l.remote_stream.clone())
    }

    /// Startet einen ausgehenden Videoanruf
    pub async fn initiate_video_call(&self, remote_user_id: &str) {
        let mut slot = self.inner.slot.lock().await;

        // Prüfen ob bereits ein Anruf aktiv ist
        if slot.call.is_some() || slot.incoming.is_some() {
            self.inner.report(format!(
                "Failed to start call: {}",
                CallEngineError::AlreadyInCall
            ));
            return;
        }

        self.inner
            .start_outgoing(&mut slot, remote_user_id.to_string(), 0, None)
            .await;
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn accept_call(&self, call_id: &str, from_user_id: &str) {
        let mut slot = self.inner.slot.lock().await;

        if let Some(call) = &slot.call {
            if call.call_id == call_id {
                tracing::warn!("Call {} is already active", call_id);
                return;
            }

            self.inner.report(format!(
                "Failed to accept call: {}",
                CallEngineError::AlreadyInCall
            ));
            self.inner.send_signal(&SignalingMessage::CallRejected(
                self.inner
                    .control(call_id, Some(from_user_id.to_string()))
                    .with_reason("busy"),
            ));
            return;
        }

        self.inner
            .start_incoming(
                &mut slot,
                call_id.to_string(),
                from_user_id.to_string(),
                0,
                None,
            )
            .await;
    }

    /// Lehnt einen Anruf ab und räumt auf
    pub async fn reject_call(&self, call_id: &str) {
        let mut slot = self.inner.slot.lock().await;

        let target = slot
            .incoming
            .as_ref()
            .filter(|i| i.call_id == call_id)
            .and_then(|i| i.from_user_id.clone())
            .or_else(|| {
                slot.call
                    .as_ref()
                    .filter(|c| c.call_id == call_id)
                    .map(|c| c.remote_user_id.clone())
            });

        tracing::info!("Rejecting call {}", call_id);
        self.inner
            .send_signal(&SignalingMessage::CallRejected(self.inner.control(call_id, target)));
        self.inner.cleanup(&mut slot).await;
    }

    /// Beendet den aktuellen Anruf; in jedem Zustand erlaubt
    pub async fn end_call(&self) {
        let mut slot = self.inner.slot.lock().await;
        self.inner.hang_up(&mut slot).await;
    }

    pub async fn start_screen_share(&self) {
        let mut slot = self.inner.slot.lock().await;
        if let Err(e) = self.inner.share_screen(&mut slot).await {
            self.inner
                .report(format!("Failed to start screen share: {}", e));
        }
    }

    pub async fn stop_screen_share(&self) {
        let mut slot = self.inner.slot.lock().await;
        if let Err(e) = self.inner.unshare_screen(&mut slot).await {
            self.inner.report(format!("Failed to stop screen share: {}", e));
        }
    }

    pub async fn toggle_audio(&self, enabled: bool) {
        self.toggle_tracks(TrackKind::Audio, enabled).await;
    }

    pub async fn toggle_video(&self, enabled: bool) {
        self.toggle_tracks(TrackKind::Video, enabled).await;
    }

    /// Sendet JSON über den Data Channel, nur wenn er offen ist
    pub async fn send_data_channel_message<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to serialize data channel message: {}", e);
                return false;
            }
        };

        let slot = self.inner.slot.lock().await;
        let channel = slot
            .call
            .as_ref()
            .and_then(|c| c.link.as_ref())
            .and_then(|l| l.data_channel.clone());
        drop(slot);

        send_text(channel.as_ref(), text).await
    }

    /// Beendet den Anruf und meldet die Engine vom Signaling ab
    pub async fn dispose(&self) {
        self.end_call().await;

        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        tracing::info!("Call engine disposed");
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn toggle_tracks(&self, kind: TrackKind, enabled: bool) {
        let slot = self.inner.slot.lock().await;
        let Some(call) = slot.call.as_ref() else {
            return;
        };

        if let Some(stream) = &call.local_stream {
            for track in stream.tracks().iter().filter(|t| t.kind() == kind) {
                track.set_enabled(enabled);
            }
        }
        tracing::info!("Local {} {}", kind, if enabled { "enabled" } else { "disabled" });

        let notice = match kind {
            TrackKind::Audio => ControlMessage::AudioToggle { enabled },
            TrackKind::Video => ControlMessage::VideoToggle { enabled },
        };
        if let Some(link) = &call.link {
            send_control(link.data_channel.as_ref(), &notice).await;
        }
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        self.event_loop.abort();
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
    }
}

impl fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.connection_state())
            .finish()
    }
}

async fn run_event_loop(inner: Weak<EngineInner>, mut input_rx: mpsc::UnboundedReceiver<EngineInput>) {
    while let Some(input) = input_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_input(input).await;
    }
}

async fn send_text(channel: Option<&Arc<dyn DataChannel>>, text: String) -> bool {
    let Some(channel) = channel else {
        return false;
    };

    if channel.ready_state() != DataChannelState::Open {
        tracing::debug!("Data channel not open, dropping message");
        return false;
    }

    match channel.send_text(text).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to send data channel message: {}", e);
            false
        }
    }
}

async fn send_control(channel: Option<&Arc<dyn DataChannel>>, message: &ControlMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => send_text(channel, text).await,
        Err(e) => {
            tracing::warn!("Failed to serialize control message: {}", e);
            false
        }
    }
}

// ============================================================================
// SESSION HANDLING
// ============================================================================

impl EngineInner {
    fn current_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Aktualisiert den State; Observer nur bei echter Änderung
    fn set_state(&self, new_state: ConnectionState) {
        let changed = {
            let mut state = self.state.write();
            if *state == new_state {
                false
            } else {
                *state = new_state;
                true
            }
        };

        if changed {
            tracing::info!("Call state: {}", new_state);
            self.observer.on_connection_state_change(new_state);
        }
    }

    fn report(&self, message: String) {
        tracing::error!("{}", message);
        self.observer.on_error(message);
    }

    fn send_signal(&self, message: &SignalingMessage) -> bool {
        let sent = self.transport.send_signal(message);
        if !sent {
            tracing::warn!("Could not send {} for call {}", message.kind(), message.call_id());
        }
        sent
    }

    /// Call-Control Payload mit eigener Absenderkennung
    fn control(&self, call_id: impl Into<String>, target_user_id: Option<String>) -> CallControl {
        CallControl::new(call_id, target_user_id).with_from_user_id(self.local_user_id.clone())
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn call_type(&self) -> CallType {
        if self.config.enable_video {
            CallType::Video
        } else {
            CallType::Audio
        }
    }

    fn schedule(&self, delay: Duration, input: EngineInput) -> TaskGuard {
        let input_tx = self.input_tx.clone();
        TaskGuard::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = input_tx.send(input);
        })
    }

    fn start_connection_timeout(&self, generation: u64) -> TaskGuard {
        self.schedule(
            self.config.connection_timeout,
            EngineInput::ConnectionTimeout { generation },
        )
    }

    fn peer_sink(&self, generation: u64) -> PeerEventSink {
        let input_tx = self.input_tx.clone();
        PeerEventSink::new(move |event| {
            let _ = input_tx.send(EngineInput::Peer { generation, event });
        })
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    async fn start_outgoing(
        &self,
        slot: &mut Slot,
        remote_user_id: String,
        retry_count: u32,
        local_stream: Option<MediaStream>,
    ) {
        let call_id = generate_call_id();
        tracing::info!("Starting video call {} to {}", call_id, remote_user_id);

        let mut call = ActiveCall::new(
            call_id,
            remote_user_id,
            true,
            retry_count,
            self.next_generation(),
        );
        call.local_stream = local_stream;
        let call = slot.call.insert(call);

        if let Err(e) = self.dial(call).await {
            self.report(format!("Failed to start call: {}", e));
            self.cleanup(slot).await;
        }
    }

    async fn dial(&self, call: &mut ActiveCall) -> Result<(), CallEngineError> {
        self.ensure_local_stream(call).await?;
        self.attach_peer(call).await?;

        let link = call.link.as_mut().ok_or(CallEngineError::NoPeerConnection)?;
        let channel = link
            .peer
            .create_data_channel(&self.config.data_channel_label)
            .await?;
        link.data_channel = Some(channel);

        let request = SignalingMessage::CallRequest(
            self.control(&call.call_id, Some(call.remote_user_id.clone()))
                .with_call_type(self.call_type()),
        );
        if !self.send_signal(&request) {
            return Err(CallEngineError::SignalingUnavailable);
        }

        self.set_state(ConnectionState::Connecting);
        call.connection_timeout = Some(self.start_connection_timeout(call.generation));
        Ok(())
    }

    async fn start_incoming(
        &self,
        slot: &mut Slot,
        call_id: String,
        from_user_id: String,
        retry_count: u32,
        local_stream: Option<MediaStream>,
    ) {
        tracing::info!("Accepting call {} from {}", call_id, from_user_id);

        // Anderer wartender Anruf klingelt sonst beim Anrufer weiter
        if let Some(invite) = slot.incoming.take().filter(|i| i.call_id != call_id) {
            tracing::info!("Declining pending call {}", invite.call_id);
            self.send_signal(&SignalingMessage::CallRejected(
                self.control(invite.call_id, invite.from_user_id)
                    .with_reason("busy"),
            ));
        }

        let mut call = ActiveCall::new(
            call_id.clone(),
            from_user_id.clone(),
            false,
            retry_count,
            self.next_generation(),
        );
        call.local_stream = local_stream;
        let call = slot.call.insert(call);

        if let Err(e) = self.answer_call(call).await {
            self.report(format!("Failed to accept call: {}", e));
            self.send_signal(&SignalingMessage::CallRejected(
                self.control(call_id, Some(from_user_id)),
            ));
            self.cleanup(slot).await;
        }
    }

    async fn answer_call(&self, call: &mut ActiveCall) -> Result<(), CallEngineError> {
        self.ensure_local_stream(call).await?;
        // Kein eigener Data Channel: der Anrufer legt ihn an
        self.attach_peer(call).await?;

        let accepted = SignalingMessage::CallAccepted(
            self.control(&call.call_id, Some(call.remote_user_id.clone())),
        );
        if !self.send_signal(&accepted) {
            return Err(CallEngineError::SignalingUnavailable);
        }

        self.set_state(ConnectionState::Connecting);
        call.connection_timeout = Some(self.start_connection_timeout(call.generation));
        Ok(())
    }

    async fn ensure_local_stream(&self, call: &mut ActiveCall) -> Result<(), CallEngineError> {
        if call.local_stream.as_ref().is_some_and(|s| s.is_live()) {
            return Ok(());
        }

        let stream = self
            .media
            .get_user_media(&self.config.media_constraints())
            .await?;
        call.local_stream = Some(stream);
        Ok(())
    }

    /// Erstellt die Peer Connection und hängt die lokalen Tracks an
    async fn attach_peer(&self, call: &mut ActiveCall) -> Result<(), CallEngineError> {
        let generation = call.generation;
        let peer = self
            .peers
            .create(
                &self.config.resolved_ice_servers(),
                self.peer_sink(generation),
            )
            .await?;

        // Sofort ablegen, damit ein Fehler beim Track-Setup sauber aufräumt
        let link = call.link.insert(PeerLink::new(generation, peer));

        if let Some(stream) = &call.local_stream {
            for track in stream.tracks() {
                let sender = link.peer.add_track(Arc::clone(track)).await?;
                match sender.kind() {
                    TrackKind::Audio => link.audio_sender = Some(sender),
                    TrackKind::Video => link.video_sender = Some(sender),
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    async fn cleanup(&self, slot: &mut Slot) {
        slot.incoming = None;

        if let Some(call) = slot.call.take() {
            tracing::info!("Cleaning up call {}", call.call_id);
            for kind in call.release().await {
                self.observer.on_stream_ended(kind);
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn hang_up(&self, slot: &mut Slot) {
        if let Some(call) = &slot.call {
            tracing::info!("Ending call {}", call.call_id);
            self.send_signal(&SignalingMessage::CallEnded(
                self.control(&call.call_id, Some(call.remote_user_id.clone())),
            ));
        }
        self.cleanup(slot).await;
    }

    // ------------------------------------------------------------------------
    // Screen share
    // ------------------------------------------------------------------------

    async fn share_screen(&self, slot: &mut Slot) -> Result<(), CallEngineError> {
        if !self.config.enable_screen_share {
            return Err(CallEngineError::ScreenShareDisabled);
        }

        let link = slot
            .call
            .as_mut()
            .and_then(|c| c.link.as_mut())
            .ok_or(CallEngineError::NoPeerConnection)?;

        if link.screen_stream.is_some() {
            tracing::debug!("Screen share already active");
            return Ok(());
        }

        let sender = link
            .video_sender
            .clone()
            .ok_or(CallEngineError::NoVideoSender)?;

        let screen = self.media.get_display_media().await?;
        let Some(track) = screen.first_video_track() else {
            screen.stop();
            return Err(MediaError::DeviceUnavailable(
                "display capture returned no video track".to_string(),
            )
            .into());
        };

        // Track im selben Sender tauschen, keine Neuverhandlung
        if let Err(e) = sender.replace_track(Some(Arc::clone(&track))).await {
            screen.stop();
            return Err(e);
        }

        // Freigabe über die Browser/OS-Leiste beendet den Track
        let input_tx = self.input_tx.clone();
        let generation = link.generation;
        let track_id = track.id().to_string();
        link.screen_watch = Some(TaskGuard::spawn(async move {
            track.ended().await;
            let _ = input_tx.send(EngineInput::ScreenShareEnded {
                generation,
                track_id,
            });
        }));
        link.screen_stream = Some(screen);

        tracing::info!("Screen share started");
        send_control(
            link.data_channel.as_ref(),
            &ControlMessage::ScreenShare { active: true },
        )
        .await;
        Ok(())
    }

    async fn unshare_screen(&self, slot: &mut Slot) -> Result<(), CallEngineError> {
        if !self.config.enable_screen_share {
            return Err(CallEngineError::ScreenShareDisabled);
        }

        let call = slot.call.as_mut().ok_or(CallEngineError::NoPeerConnection)?;
        let camera = call
            .local_stream
            .as_ref()
            .and_then(|s| s.first_video_track());
        let link = call.link.as_mut().ok_or(CallEngineError::NoPeerConnection)?;

        let Some(screen) = link.screen_stream.take() else {
            return Ok(());
        };
        link.screen_watch = None;
        screen.stop();

        if let Some(sender) = &link.video_sender {
            sender.replace_track(camera).await?;
        }

        tracing::info!("Screen share stopped");
        self.observer.on_stream_ended(StreamKind::Screen);
        send_control(
            link.data_channel.as_ref(),
            &ControlMessage::ScreenShare { active: false },
        )
        .await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Input dispatch
    // ------------------------------------------------------------------------

    async fn handle_input(&self, input: EngineInput) {
        let mut slot = self.slot.lock().await;

        match input {
            EngineInput::Signal(message) => self.handle_signal(&mut slot, message).await,

            EngineInput::Peer { generation, event } => {
                if slot.link_generation() != Some(generation) {
                    tracing::debug!("Ignoring {:?} from stale peer connection", event);
                    return;
                }
                self.handle_peer_event(&mut slot, event).await;
            }

            EngineInput::ConnectionTimeout { generation } => {
                self.handle_timeout(&mut slot, generation).await;
            }

            EngineInput::RetryDue { generation } => {
                self.handle_retry_due(&mut slot, generation).await;
            }

            EngineInput::ScreenShareEnded {
                generation,
                track_id,
            } => {
                let current = slot.link_generation() == Some(generation)
                    && slot
                        .call
                        .as_ref()
                        .and_then(|c| c.link.as_ref())
                        .and_then(|l| l.screen_stream.as_ref())
                        .is_some_and(|s| s.tracks().iter().any(|t| t.id() == track_id));

                if current {
                    tracing::info!("Screen share ended by the user");
                    if let Err(e) = self.unshare_screen(&mut slot).await {
                        self.report(format!("Failed to stop screen share: {}", e));
                    }
                }
            }
        }
    }

    async fn handle_signal(&self, slot: &mut Slot, message: SignalingMessage) {
        match message {
            SignalingMessage::CallRequest(control) => self.on_call_request(slot, control).await,
            SignalingMessage::CallAccepted(control) => self.on_call_accepted(slot, control).await,
            SignalingMessage::CallRejected(control) => {
                self.on_remote_hangup(slot, control, "rejected").await
            }
            SignalingMessage::CallEnded(control) => {
                self.on_remote_hangup(slot, control, "ended").await
            }
            SignalingMessage::WebRtcSignaling(WebRtcSignal::Offer { offer, call_id, .. }) => {
                self.on_offer(slot, &call_id, offer).await
            }
            SignalingMessage::WebRtcSignaling(WebRtcSignal::Answer {
                answer, call_id, ..
            }) => self.on_answer(slot, &call_id, answer).await,
            SignalingMessage::WebRtcSignaling(WebRtcSignal::IceCandidate {
                candidate,
                call_id,
                ..
            }) => self.on_remote_candidate(slot, &call_id, candidate).await,
        }
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    async fn on_call_request(&self, slot: &mut Slot, control: CallControl) {
        let from_user_id = control.from_user_id.clone();

        let redial = slot.call.as_ref().is_some_and(|call| {
            !call.is_initiator
                && call.retry_pending()
                && from_user_id.as_deref() == Some(call.remote_user_id.as_str())
        });
        if redial {
            if let Some(previous) = slot.call.take() {
                let remote_user_id = previous.remote_user_id.clone();
                tracing::info!(
                    "Re-dial {} from {} after connection loss",
                    control.call_id,
                    remote_user_id
                );
                let (retry_count, local_stream, ended) = previous.into_retry().await;
                for kind in ended {
                    self.observer.on_stream_ended(kind);
                }
                self.start_incoming(
                    slot,
                    control.call_id,
                    remote_user_id,
                    retry_count,
                    local_stream,
                )
                .await;
            }
            return;
        }

        let caller = from_user_id.as_deref().unwrap_or("unknown caller");

        if slot.call.is_some() || slot.incoming.is_some() {
            tracing::info!("Busy, rejecting call {} from {}", control.call_id, caller);
            self.send_signal(&SignalingMessage::CallRejected(
                self.control(control.call_id, from_user_id)
                    .with_reason("busy"),
            ));
            return;
        }

        // Ohne Absender muss der Host die Gegenstelle bei accept_call angeben
        tracing::info!("Incoming call {} from {}", control.call_id, caller);
        slot.incoming = Some(IncomingCall {
            call_id: control.call_id.clone(),
            from_user_id: from_user_id.clone(),
        });
        self.set_state(ConnectionState::IncomingCall);
        self.observer
            .on_incoming_call(&control.call_id, from_user_id.as_deref());
    }

    async fn on_call_accepted(&self, slot: &mut Slot, control: CallControl) {
        let Some(call) = slot.call_mut(&control.call_id) else {
            tracing::debug!("Ignoring call-accepted for unknown call {}", control.call_id);
            return;
        };

        if !call.is_initiator {
            tracing::warn!("Unexpected call-accepted for incoming call {}", call.call_id);
            return;
        }

        tracing::info!("Call {} accepted, sending offer", call.call_id);
        if let Err(e) = self.send_offer(call).await {
            self.report(format!("Signaling error: {}", e));
        }
    }

    async fn send_offer(&self, call: &ActiveCall) -> Result<(), CallEngineError> {
        let link = call.link.as_ref().ok_or(CallEngineError::NoPeerConnection)?;

        let offer = link.peer.create_offer().await?;
        link.peer.set_local_description(offer.clone()).await?;

        let message = SignalingMessage::WebRtcSignaling(WebRtcSignal::Offer {
            offer,
            call_id: call.call_id.clone(),
            target_user_id: call.remote_user_id.clone(),
            from_user_id: self.local_user_id.clone(),
        });
        if !self.send_signal(&message) {
            return Err(CallEngineError::SignalingUnavailable);
        }
        Ok(())
    }

    async fn on_offer(&self, slot: &mut Slot, call_id: &str, offer: SessionDescription) {
        let Some(call) = slot.call_mut(call_id) else {
            tracing::debug!("Ignoring offer for unknown call {}", call_id);
            return;
        };

        if let Err(e) = self.answer_offer(call, offer).await {
            self.report(format!("Signaling error: {}", e));
        }
    }

    async fn answer_offer(
        &self,
        call: &mut ActiveCall,
        offer: SessionDescription,
    ) -> Result<(), CallEngineError> {
        let link = call.link.as_mut().ok_or(CallEngineError::NoPeerConnection)?;

        link.peer.set_remote_description(offer).await?;
        link.remote_description_set = true;
        self.drain_candidates(link).await;

        let answer = link.peer.create_answer().await?;
        link.peer.set_local_description(answer.clone()).await?;

        let message = SignalingMessage::WebRtcSignaling(WebRtcSignal::Answer {
            answer,
            call_id: call.call_id.clone(),
            target_user_id: call.remote_user_id.clone(),
            from_user_id: self.local_user_id.clone(),
        });
        if !self.send_signal(&message) {
            return Err(CallEngineError::SignalingUnavailable);
        }
        Ok(())
    }

    async fn on_answer(&self, slot: &mut Slot, call_id: &str, answer: SessionDescription) {
        let Some(link) = slot.call_mut(call_id).and_then(|c| c.link.as_mut()) else {
            tracing::debug!("Ignoring answer for unknown call {}", call_id);
            return;
        };

        match link.peer.set_remote_description(answer).await {
            Ok(()) => {
                link.remote_description_set = true;
                self.drain_candidates(link).await;
            }
            Err(e) => self.report(format!("Signaling error: {}", e)),
        }
    }

    async fn on_remote_candidate(&self, slot: &mut Slot, call_id: &str, candidate: IceCandidate) {
        let Some(link) = slot.call_mut(call_id).and_then(|c| c.link.as_mut()) else {
            tracing::debug!("Ignoring ICE candidate for unknown call {}", call_id);
            return;
        };

        if !link.remote_description_set {
            tracing::debug!("Queueing early ICE candidate");
            link.pending_candidates.push(candidate);
            return;
        }

        if let Err(e) = link.peer.add_ice_candidate(candidate).await {
            self.report(format!("Signaling error: {}", e));
        }
    }

    async fn drain_candidates(&self, link: &mut PeerLink) {
        let pending = std::mem::take(&mut link.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!("Applying {} queued ICE candidate(s)", pending.len());
        }

        for candidate in pending {
            if let Err(e) = link.peer.add_ice_candidate(candidate).await {
                self.report(format!("Signaling error: {}", e));
            }
        }
    }

    async fn on_remote_hangup(&self, slot: &mut Slot, control: CallControl, what: &str) {
        let pending_invite = slot
            .incoming
            .as_ref()
            .is_some_and(|i| i.call_id == control.call_id);
        let active = slot.call_mut(&control.call_id).is_some();

        if !pending_invite && !active {
            tracing::debug!("Ignoring call-{} for unknown call {}", what, control.call_id);
            return;
        }

        match &control.reason {
            Some(reason) => tracing::info!("Call {} {} by remote ({})", control.call_id, what, reason),
            None => tracing::info!("Call {} {} by remote", control.call_id, what),
        }
        self.cleanup(slot).await;
    }

    // ------------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------------

    async fn handle_peer_event(&self, slot: &mut Slot, event: PeerEvent) {
        match event {
            PeerEvent::StateChanged(state) => self.on_peer_state(slot, state).await,

            PeerEvent::IceCandidate(candidate) => {
                let Some(call) = slot.call.as_ref() else {
                    return;
                };
                self.send_signal(&SignalingMessage::WebRtcSignaling(
                    WebRtcSignal::IceCandidate {
                        candidate,
                        call_id: call.call_id.clone(),
                        target_user_id: call.remote_user_id.clone(),
                        from_user_id: self.local_user_id.clone(),
                    },
                ));
            }

            PeerEvent::Track(track) => {
                let Some(link) = slot.call.as_mut().and_then(|c| c.link.as_mut()) else {
                    return;
                };
                tracing::info!("Received remote {} track {}", track.kind(), track.id());

                let stream = link
                    .remote_stream
                    .get_or_insert_with(|| RemoteStream::new(track.stream_id()));
                stream.add_track(track);
                let stream = stream.clone();
                self.observer.on_remote_stream(stream);
            }

            PeerEvent::DataChannel(channel) => {
                let Some(link) = slot.call.as_mut().and_then(|c| c.link.as_mut()) else {
                    return;
                };
                tracing::info!("Remote data channel '{}' announced", channel.label());
                if link.data_channel.is_none() {
                    link.data_channel = Some(channel);
                }
            }

            PeerEvent::DataChannelOpen => tracing::info!("Data channel open"),

            PeerEvent::DataChannelMessage(text) => {
                let message = serde_json::from_str(&text)
                    .unwrap_or(serde_json::Value::String(text));
                self.observer.on_data_channel_message(message);
            }

            PeerEvent::DataChannelClosed => tracing::debug!("Data channel closed"),
        }
    }

    async fn on_peer_state(&self, slot: &mut Slot, state: PeerState) {
        tracing::debug!("Peer connection state: {:?}", state);

        match state {
            PeerState::Connected => {
                if let Some(call) = slot.call.as_mut() {
                    call.connection_timeout = None;
                    // ICE hat sich selbst erholt; Zähler bleibt
                    if call.retry_timer.take().is_some() {
                        tracing::info!(
                            "Peer connection recovered, cancelling retry {}/{}",
                            call.retry_count,
                            self.config.max_retries
                        );
                    }
                }
                self.set_state(ConnectionState::Connected);
            }
            PeerState::Disconnected | PeerState::Failed => {
                self.retry_or_fail(slot, state).await;
            }
            PeerState::New | PeerState::Connecting | PeerState::Closed => {}
        }
    }

    async fn retry_or_fail(&self, slot: &mut Slot, state: PeerState) {
        let Some(call) = slot.call.as_mut() else {
            return;
        };

        if call.retry_pending() {
            tracing::debug!("Retry already pending, ignoring {:?}", state);
            return;
        }

        let max_retries = self.config.max_retries;
        if call.retry_count < max_retries {
            call.retry_count += 1;
            let delay = self.config.retry_delay(call.retry_count);
            tracing::warn!(
                "Peer connection {:?}, retry {}/{} in {:?}",
                state,
                call.retry_count,
                max_retries,
                delay
            );

            call.connection_timeout = None;
            call.retry_timer = Some(self.schedule(
                delay,
                EngineInput::RetryDue {
                    generation: call.generation,
                },
            ));
            self.set_state(ConnectionState::Connecting);
            return;
        }

        self.set_state(ConnectionState::Failed);
        self.report(format!(
            "Connection failed after maximum retries ({})",
            max_retries
        ));
        self.hang_up(slot).await;
    }

    async fn handle_retry_due(&self, slot: &mut Slot, generation: u64) {
        let Some(call) = slot.call.as_mut() else {
            return;
        };
        if call.generation != generation || call.retry_timer.is_none() {
            return;
        }
        call.retry_timer = None;

        if call.is_initiator {
            let Some(previous) = slot.call.take() else {
                return;
            };
            let remote_user_id = previous.remote_user_id.clone();
            let (retry_count, local_stream, ended) = previous.into_retry().await;
            for kind in ended {
                self.observer.on_stream_ended(kind);
            }

            tracing::info!(
                "Re-dialing {} (attempt {}/{})",
                remote_user_id,
                retry_count,
                self.config.max_retries
            );
            self.start_outgoing(slot, remote_user_id, retry_count, local_stream)
                .await;
            return;
        }

        for kind in call.teardown_link().await {
            self.observer.on_stream_ended(kind);
        }
        tracing::info!("Waiting for {} to re-dial", call.remote_user_id);
        call.awaiting_redial = true;
        call.connection_timeout = Some(self.start_connection_timeout(generation));
    }

    async fn handle_timeout(&self, slot: &mut Slot, generation: u64) {
        let Some(call) = slot.call.as_ref() else {
            return;
        };
        if call.generation != generation || self.current_state() == ConnectionState::Connected {
            return;
        }

        tracing::warn!(
            "Call {} not connected within {:?}",
            call.call_id,
            self.config.connection_timeout
        );
        self.report("Connection timeout".to_string());
        self.hang_up(slot).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
