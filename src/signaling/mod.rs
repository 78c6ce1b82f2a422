//! Signaling Module - Reconnecting WebSocket Transport
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - WebSocket-Verbindung aufbauen und halten (mit Backoff-Reconnect)
//! - JSON-Nachrichten senden und empfangen
//! - Signaling-Umschläge für die CallEngine typisieren
//!

mod client;
mod events;
mod messages;
mod socket;
mod transport;

pub use client::{
    ReadyState, SignalingClient, SignalingError, TransportConfig, DEFAULT_SIGNALING_URL,
};
pub use events::{EventHandler, Subscription, TransportEvent, TransportEventKind};
pub use messages::*;
pub use socket::{
    CloseInfo, Connector, Frame, FrameSink, FrameStream, SocketPair, WsConnector, CLOSE_ABNORMAL,
    CLOSE_NORMAL, CLOSE_NO_STATUS,
};
pub use transport::{SignalHandler, SignalingTransport};
