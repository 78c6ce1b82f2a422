//! Lokale Medien: Tracks, Streams und Geräte-Zugriff
//!
//! Ein `MediaTrack` ist die Quelle für genau einen gesendeten RTP-Track.
//! Der Host schreibt kodierte Samples (Opus/VP8) hinein; ein deaktivierter
//! Track verwirft sie, ein beendeter Track lehnt sie ab.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Opus Sample Rate (48kHz)
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("At least one of audio or video must be requested")]
    NothingRequested,

    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    #[error("Track has ended")]
    TrackEnded,

    #[error("Failed to write sample: {0}")]
    Write(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: FacingMode,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            facing_mode: FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// `None` heißt: diese Medienart nicht anfordern
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

/// Womit ein Track aufgenommen wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSettings {
    Microphone(AudioConstraints),
    Camera(VideoConstraints),
    Display,
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    settings: TrackSettings,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    local: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    pub fn new(
        kind: TrackKind,
        label: impl Into<String>,
        settings: TrackSettings,
        stream_id: &str,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();

        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        let (ended, _) = watch::channel(false);

        Arc::new(Self {
            id,
            kind,
            label: label.into(),
            settings,
            enabled: AtomicBool::new(true),
            ended,
            local,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn settings(&self) -> &TrackSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Deaktivierte Tracks bleiben verhandelt, senden aber nichts
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !*self.ended.borrow()
    }

    /// Beendet den Track endgültig (wie `MediaStreamTrack.stop()`)
    pub fn stop(&self) {
        if !self.ended.send_replace(true) {
            tracing::debug!("Stopped {} track '{}'", self.kind, self.label);
        }
    }

    /// Wartet bis der Track beendet wurde
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.is_live() {
            return Err(MediaError::TrackEnded);
        }
        if !self.is_enabled() {
            return Ok(());
        }

        self.local
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::Write(e.to_string()))
    }

    /// Der RTP-seitige Track für `RTCPeerConnection::add_track`
    pub fn local_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.local)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn first_video_track(&self) -> Option<Arc<MediaTrack>> {
        self.video_tracks().next().cloned()
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Zugriff auf Kamera, Mikrofon und Bildschirmaufnahme
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError>;

    async fn get_display_media(&self) -> Result<MediaStream, MediaError>;
}

/// Erzeugt Tracks, die der Host selbst mit kodierten Samples befüllt
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMediaDevices;

#[async_trait]
impl MediaDevices for LocalMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        let stream_id = Uuid::new_v4().to_string();
        let mut tracks = Vec::new();

        if let Some(audio) = &constraints.audio {
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                "microphone",
                TrackSettings::Microphone(audio.clone()),
                &stream_id,
            ));
        }

        if let Some(video) = &constraints.video {
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                "camera",
                TrackSettings::Camera(video.clone()),
                &stream_id,
            ));
        }

        if tracks.is_empty() {
            return Err(MediaError::NothingRequested);
        }

        tracing::info!("Captured local media: {} track(s)", tracks.len());
        Ok(MediaStream::new(stream_id, tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        let stream_id = Uuid::new_v4().to_string();
        let track = MediaTrack::new(TrackKind::Video, "screen", TrackSettings::Display, &stream_id);

        tracing::info!("Captured display media");
        Ok(MediaStream::new(stream_id, vec![track]))
    }
}
