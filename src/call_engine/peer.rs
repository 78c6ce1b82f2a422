//! Abstraktion über die Peer Connection
//!
//! Die CallEngine spricht nur mit diesen Traits. Die Produktiv-Implementierung
//! liegt in `webrtc_peer`, Tests benutzen Fakes.
//!
//! Alle Callbacks der Peer Connection kommen als `PeerEvent` über einen
//! `PeerEventSink` zurück und werden von der Engine seriell verarbeitet.

use super::config::IceServerConfig;
use super::engine::CallEngineError;
use super::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use webrtc::rtp::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

// ============================================================================
// CHANNELS & TRACKS
// ============================================================================

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn ready_state(&self) -> DataChannelState;

    async fn send_text(&self, text: String) -> Result<(), CallEngineError>;

    async fn close(&self) -> Result<(), CallEngineError>;
}

/// Sender eines lokalen Tracks; der Track lässt sich ohne Neuverhandlung tauschen
#[async_trait]
pub trait TrackSender: Send + Sync {
    fn kind(&self) -> TrackKind;

    async fn replace_track(&self, track: Option<Arc<MediaTrack>>) -> Result<(), CallEngineError>;
}

#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;

    fn stream_id(&self) -> String;

    fn kind(&self) -> TrackKind;

    /// Nächstes RTP-Paket dieses Tracks
    async fn read_rtp(&self) -> Result<Packet, CallEngineError>;
}

/// Vom Gegenüber empfangene Tracks, gruppiert nach Stream-ID
#[derive(Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<Arc<dyn RemoteTrack>>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn RemoteTrack>] {
        &self.tracks
    }

    pub fn add_track(&mut self, track: Arc<dyn RemoteTrack>) {
        let id = track.id();
        if !self.tracks.iter().any(|t| t.id() == id) {
            self.tracks.push(track);
        }
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

// ============================================================================
// PEER EVENTS
// ============================================================================

pub enum PeerEvent {
    StateChanged(PeerState),
    IceCandidate(IceCandidate),
    Track(Arc<dyn RemoteTrack>),
    /// Vom Gegenüber angelegter Data Channel
    DataChannel(Arc<dyn DataChannel>),
    DataChannelOpen,
    DataChannelMessage(String),
    DataChannelClosed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::StateChanged(state) => write!(f, "StateChanged({:?})", state),
            PeerEvent::IceCandidate(candidate) => write!(f, "IceCandidate({})", candidate.candidate),
            PeerEvent::Track(track) => write!(f, "Track({} {})", track.kind(), track.id()),
            PeerEvent::DataChannel(channel) => write!(f, "DataChannel({})", channel.label()),
            PeerEvent::DataChannelOpen => write!(f, "DataChannelOpen"),
            PeerEvent::DataChannelMessage(_) => write!(f, "DataChannelMessage"),
            PeerEvent::DataChannelClosed => write!(f, "DataChannelClosed"),
        }
    }
}

/// Rückkanal von der Peer Connection zur Engine
#[derive(Clone)]
pub struct PeerEventSink {
    emit: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl PeerEventSink {
    pub fn new(emit: impl Fn(PeerEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.emit)(event);
    }
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(
        &self,
        track: Arc<MediaTrack>,
    ) -> Result<Arc<dyn TrackSender>, CallEngineError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, CallEngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, CallEngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallEngineError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallEngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallEngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallEngineError>;

    async fn close(&self) -> Result<(), CallEngineError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallEngineError>;
}
