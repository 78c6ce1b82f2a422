//! Call Engine Module - WebRTC Video-Sitzungen
//!
//! Dieses Modul verwaltet:
//! - Anruf-Signaling (Anfrage, Annahme, Ablehnung, Ende)
//! - WebRTC Peer Connections (Offer/Answer, ICE)
//! - Lokale Medien und Bildschirmfreigabe
//! - Data Channel Nachrichten
//! - Neuversuche bei Verbindungsverlust

mod config;
mod engine;
mod media;
mod observer;
mod peer;
mod session;
mod webrtc_peer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{CallConfig, ConfigError, IceServerConfig, DEFAULT_STUN_SERVERS};
pub use engine::{CallEngine, CallEngineError, ControlMessage};
pub use media::{
    AudioConstraints, FacingMode, LocalMediaDevices, MediaConstraints, MediaDevices, MediaError,
    MediaStream, MediaTrack, TrackKind, TrackSettings, VideoConstraints, AUDIO_CLOCK_RATE,
    VIDEO_CLOCK_RATE,
};
pub use observer::{CallObserver, ConnectionState, StreamKind};
pub use peer::{
    DataChannel, DataChannelState, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, PeerState, RemoteStream, RemoteTrack, TrackSender,
};
pub use session::CallSnapshot;
pub use webrtc_peer::WebRtcPeerFactory;
