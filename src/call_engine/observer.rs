//! Callbacks der CallEngine an den Host

use super::peer::RemoteStream;
use serde::Serialize;
use std::fmt;

/// Zustand der Anruf-Sitzung aus Sicht der UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    IncomingCall,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::IncomingCall => "incoming-call",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Local,
    Screen,
    Remote,
}

/// Alle Methoden haben leere Defaults, der Host überschreibt was er braucht.
///
/// Callbacks werden aus der Engine heraus aufgerufen und dürfen nicht
/// blockieren. Engine-Methoden nur aus einem eigenen Task aufrufen.
pub trait CallObserver: Send + Sync {
    fn on_connection_state_change(&self, _state: ConnectionState) {}

    fn on_remote_stream(&self, _stream: RemoteStream) {}

    fn on_stream_ended(&self, _kind: StreamKind) {}

    fn on_error(&self, _message: String) {}

    fn on_data_channel_message(&self, _message: serde_json::Value) {}

    /// `from_user_id` ist `None`, wenn der Anrufer unbekannt ist; dann muss
    /// der Host die Gegenstelle bei `accept_call` selbst angeben.
    fn on_incoming_call(&self, _call_id: &str, _from_user_id: Option<&str>) {}
}
