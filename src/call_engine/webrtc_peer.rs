//! Peer Connection Backend auf Basis von `webrtc`
//!
//! Übersetzt die Callbacks von `RTCPeerConnection` und `RTCDataChannel`
//! in `PeerEvent`s für die CallEngine.

use super::config::IceServerConfig;
use super::engine::CallEngineError;
use super::media::{MediaTrack, TrackKind};
use super::peer::{
    DataChannel, DataChannelState, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, PeerState, RemoteTrack, TrackSender,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn webrtc_err(e: webrtc::Error) -> CallEngineError {
    CallEngineError::WebRtc(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeerFactory;

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallEngineError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        register_handlers(&pc, &events);

        Ok(Arc::new(WebRtcPeer { pc, events }))
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        if let Some(state) = map_state(s) {
            sink.emit(PeerEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // `None` markiert das Ende des Gatherings
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => sink.emit(PeerEvent::IceCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track, _, _| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::Track(Arc::new(WebRtcRemoteTrack { track })));
        })
    }));

    let sink = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        Box::pin(async move {
            watch_data_channel(&dc, &sink);
            sink.emit(PeerEvent::DataChannel(Arc::new(WebRtcDataChannel { dc })));
        })
    }));
}

fn watch_data_channel(dc: &Arc<RTCDataChannel>, events: &PeerEventSink) {
    let sink = events.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        tracing::info!("Data channel '{}' open", label);
        sink.emit(PeerEvent::DataChannelOpen);
        Box::pin(async {})
    }));

    let sink = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => sink.emit(PeerEvent::DataChannelMessage(text)),
            Err(e) => tracing::warn!("Dropping non-UTF-8 data channel message: {}", e),
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    dc.on_close(Box::new(move || {
        sink.emit(PeerEvent::DataChannelClosed);
        Box::pin(async {})
    }));
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, CallEngineError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return Err(CallEngineError::InvalidSdp(
                "rollback is not supported".to_string(),
            ))
        }
    };
    parsed.map_err(|e| CallEngineError::InvalidSdp(e.to_string()))
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(
        &self,
        track: Arc<MediaTrack>,
    ) -> Result<Arc<dyn TrackSender>, CallEngineError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.local_track();
        let sender = self.pc.add_track(local).await.map_err(webrtc_err)?;

        // RTCP lesen, sonst laufen die Interceptoren nicht
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        Ok(Arc::new(WebRtcSender {
            kind: track.kind(),
            sender,
        }))
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, CallEngineError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(webrtc_err)?;
        watch_data_channel(&dc, &self.events);
        Ok(Arc::new(WebRtcDataChannel { dc }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallEngineError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallEngineError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallEngineError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallEngineError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallEngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(webrtc_err)
    }

    async fn close(&self) -> Result<(), CallEngineError> {
        self.pc.close().await.map_err(webrtc_err)
    }
}

// ============================================================================
// SENDER / CHANNEL / REMOTE TRACK
// ============================================================================

struct WebRtcSender {
    kind: TrackKind,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl TrackSender for WebRtcSender {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn replace_track(&self, track: Option<Arc<MediaTrack>>) -> Result<(), CallEngineError> {
        let local: Option<Arc<dyn TrackLocal + Send + Sync>> = match &track {
            Some(track) => Some(track.local_track()),
            None => None,
        };
        self.sender.replace_track(local).await.map_err(webrtc_err)
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn ready_state(&self) -> DataChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                DataChannelState::Connecting
            }
        }
    }

    async fn send_text(&self, text: String) -> Result<(), CallEngineError> {
        self.dc.send_text(text).await.map_err(webrtc_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CallEngineError> {
        self.dc.close().await.map_err(webrtc_err)
    }
}

struct WebRtcRemoteTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn kind(&self) -> TrackKind {
        match self.track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        }
    }

    async fn read_rtp(&self) -> Result<Packet, CallEngineError> {
        let (packet, _) = self.track.read_rtp().await.map_err(webrtc_err)?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::config::CallConfig;
    use crate::call_engine::media::{LocalMediaDevices, MediaDevices};

    #[test]
    fn test_ice_servers_are_mapped() {
        let config = CallConfig {
            ice_servers: vec![IceServerConfig::turn("turn:relay.test:3478", "driver", "secret")],
            ..Default::default()
        };

        let servers: Vec<RTCIceServer> = config
            .resolved_ice_servers()
            .iter()
            .map(to_rtc_ice_server)
            .collect();

        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[2].username, "driver");
        assert_eq!(servers[2].credential, "secret");
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(PeerState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn test_rollback_is_rejected() {
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            to_rtc_description(rollback),
            Err(CallEngineError::InvalidSdp(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_contains_local_tracks() {
        let peer = WebRtcPeerFactory
            .create(&[], PeerEventSink::new(|_| {}))
            .await
            .unwrap();

        let stream = LocalMediaDevices
            .get_user_media(&CallConfig::default().media_constraints())
            .await
            .unwrap();
        for track in stream.tracks() {
            peer.add_track(Arc::clone(track)).await.unwrap();
        }
        peer.create_data_channel("messages").await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=application"));

        peer.close().await.unwrap();
    }
}
