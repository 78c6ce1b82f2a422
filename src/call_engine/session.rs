//! Ressourcen einer laufenden Anruf-Sitzung
//!
//! `ActiveCall` lebt vom Wählen/Annehmen bis zum Aufräumen. `PeerLink`
//! bündelt alles, was an genau einer Peer Connection hängt, und wird bei
//! einem Neuversuch komplett ersetzt. Lokale Medien überleben den Neuversuch.

use super::media::MediaStream;
use super::observer::{ConnectionState, StreamKind};
use super::peer::{DataChannel, PeerConnection, RemoteStream, TrackSender};
use crate::signaling::IceCandidate;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Bricht den Task ab, sobald der Guard gedroppt wird
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Eingehender Anruf, der noch nicht angenommen wurde
#[derive(Debug, Clone)]
pub(crate) struct IncomingCall {
    pub call_id: String,
    /// Fehlt, wenn der Umschlag keinen `fromUserId` trug
    pub from_user_id: Option<String>,
}

// ============================================================================
// PEER LINK
// ============================================================================

pub(crate) struct PeerLink {
    pub generation: u64,
    pub peer: Arc<dyn PeerConnection>,
    pub audio_sender: Option<Arc<dyn TrackSender>>,
    pub video_sender: Option<Arc<dyn TrackSender>>,
    pub data_channel: Option<Arc<dyn DataChannel>>,
    pub remote_stream: Option<RemoteStream>,
    pub screen_stream: Option<MediaStream>,
    pub screen_watch: Option<TaskGuard>,
    /// Candidates, die vor der Remote Description ankamen
    pub pending_candidates: Vec<IceCandidate>,
    pub remote_description_set: bool,
}

impl PeerLink {
    pub(crate) fn new(generation: u64, peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            generation,
            peer,
            audio_sender: None,
            video_sender: None,
            data_channel: None,
            remote_stream: None,
            screen_stream: None,
            screen_watch: None,
            pending_candidates: Vec::new(),
            remote_description_set: false,
        }
    }

    /// Schließt Data Channel, Screen Share und Peer Connection.
    /// Gibt zurück, welche Streams dabei beendet wurden.
    pub(crate) async fn release(self) -> Vec<StreamKind> {
        let mut ended = Vec::new();
        drop(self.screen_watch);

        if let Some(channel) = &self.data_channel {
            if let Err(e) = channel.close().await {
                tracing::warn!("Failed to close data channel: {}", e);
            }
        }

        if let Some(screen) = &self.screen_stream {
            screen.stop();
            ended.push(StreamKind::Screen);
        }

        if let Err(e) = self.peer.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }

        if self.remote_stream.is_some() {
            ended.push(StreamKind::Remote);
        }

        ended
    }
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

pub(crate) struct ActiveCall {
    pub call_id: String,
    pub remote_user_id: String,
    pub is_initiator: bool,
    pub retry_count: u32,
    /// Gilt für Timer dieses Versuchs und für die Peer Connection
    pub generation: u64,
    pub local_stream: Option<MediaStream>,
    pub link: Option<PeerLink>,
    pub connection_timeout: Option<TaskGuard>,
    pub retry_timer: Option<TaskGuard>,
    /// Angerufene Seite wartet nach Verbindungsverlust auf das erneute Wählen
    pub awaiting_redial: bool,
}

impl ActiveCall {
    pub(crate) fn new(
        call_id: String,
        remote_user_id: String,
        is_initiator: bool,
        retry_count: u32,
        generation: u64,
    ) -> Self {
        Self {
            call_id,
            remote_user_id,
            is_initiator,
            retry_count,
            generation,
            local_stream: None,
            link: None,
            connection_timeout: None,
            retry_timer: None,
            awaiting_redial: false,
        }
    }

    pub(crate) fn retry_pending(&self) -> bool {
        self.retry_timer.is_some() || self.awaiting_redial
    }

    /// Baut nur die Peer Connection ab, lokale Medien bleiben
    pub(crate) async fn teardown_link(&mut self) -> Vec<StreamKind> {
        match self.link.take() {
            Some(link) => link.release().await,
            None => Vec::new(),
        }
    }

    /// Gibt alles frei
    pub(crate) async fn release(mut self) -> Vec<StreamKind> {
        self.connection_timeout = None;
        self.retry_timer = None;

        let mut ended = self.teardown_link().await;
        if let Some(local) = self.local_stream.take() {
            local.stop();
            ended.push(StreamKind::Local);
        }
        ended
    }

    /// Übergabe an den nächsten Versuch: Zähler und lokale Medien
    pub(crate) async fn into_retry(mut self) -> (u32, Option<MediaStream>, Vec<StreamKind>) {
        self.connection_timeout = None;
        self.retry_timer = None;
        let ended = self.teardown_link().await;
        (self.retry_count, self.local_stream.take(), ended)
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Lesbare Momentaufnahme der Sitzung
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub state: ConnectionState,
    pub call_id: Option<String>,
    pub remote_user_id: Option<String>,
    pub is_initiator: bool,
    pub retry_count: u32,
    pub has_peer_connection: bool,
    pub has_data_channel: bool,
    pub has_local_stream: bool,
    pub has_screen_stream: bool,
    pub has_remote_stream: bool,
    pub pending_candidates: usize,
    /// `(call_id, from_user_id)` eines noch nicht angenommenen Anrufs
    pub incoming_call: Option<(String, Option<String>)>,
}

impl CallSnapshot {
    pub(crate) fn capture(
        state: ConnectionState,
        call: Option<&ActiveCall>,
        incoming: Option<&IncomingCall>,
    ) -> Self {
        let mut snapshot = CallSnapshot {
            state,
            incoming_call: incoming.map(|i| (i.call_id.clone(), i.from_user_id.clone())),
            ..Default::default()
        };

        if let Some(call) = call {
            snapshot.call_id = Some(call.call_id.clone());
            snapshot.remote_user_id = Some(call.remote_user_id.clone());
            snapshot.is_initiator = call.is_initiator;
            snapshot.retry_count = call.retry_count;
            snapshot.has_local_stream = call.local_stream.is_some();

            if let Some(link) = &call.link {
                snapshot.has_peer_connection = true;
                snapshot.has_data_channel = link.data_channel.is_some();
                snapshot.has_screen_stream = link.screen_stream.is_some();
                snapshot.has_remote_stream = link.remote_stream.is_some();
                snapshot.pending_candidates = link.pending_candidates.len();
            }
        }

        snapshot
    }

    /// Keine Ressource mehr belegt
    pub fn is_idle(&self) -> bool {
        self.call_id.is_none()
            && self.incoming_call.is_none()
            && !self.has_peer_connection
            && !self.has_data_channel
            && !self.has_local_stream
            && !self.has_screen_stream
            && !self.has_remote_stream
    }
}
