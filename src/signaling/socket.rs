//! Socket-Schicht unter dem SignalingClient
//!
//! Der Client spricht nur mit einem `Connector`, der ein Paar aus Sink und
//! Stream von `Frame`s liefert. In Produktion ist das `WsConnector` auf Basis
//! von tokio-tungstenite.

use super::client::SignalingError;
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// CLOSE CODES
// ============================================================================

/// Normal Closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Kein Status im Close-Frame
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Verbindung ohne Close-Handshake verloren
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Beschreibung eines Verbindungsendes, analog zum Browser-`CloseEvent`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: reason.into(),
            was_clean: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }

    /// Nur unsaubere Abbrüche ohne Normal Closure lösen einen Reconnect aus
    pub fn is_unexpected(&self) -> bool {
        !self.was_clean && self.code != CLOSE_NORMAL
    }
}

// ============================================================================
// FRAMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Binärframe, das kein gültiges UTF-8 ist
    Invalid(Vec<u8>),
    Ping(Vec<u8>),
    Close { code: u16, reason: String },
}

impl Frame {
    fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text),
            Frame::Invalid(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        }
    }

    fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Binary(data) => Some(match String::from_utf8(data) {
                Ok(text) => Frame::Text(text),
                Err(e) => Frame::Invalid(e.into_bytes()),
            }),
            Message::Close(Some(frame)) => Some(Frame::Close {
                code: u16::from(frame.code),
                reason: frame.reason.into_owned(),
            }),
            Message::Close(None) => Some(Frame::Close {
                code: CLOSE_NO_STATUS,
                reason: String::new(),
            }),
            // Pong beantwortet tungstenite selbst
            _ => None,
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = SignalingError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, SignalingError>> + Send>>;

/// Beide Hälften einer geöffneten Verbindung
pub struct SocketPair {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

// ============================================================================
// CONNECTOR
// ============================================================================

#[async_trait]
pub trait Connector: Send + Sync {
    /// Öffnet eine neue Verbindung zu `url`
    async fn connect(&self, url: &str) -> Result<SocketPair, SignalingError>;
}

/// WebSocket Connector auf Basis von tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketPair, SignalingError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| SignalingError::Socket(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, SignalingError>(frame.into_message())));

        let stream = read.filter_map(|result| {
            future::ready(match result {
                Ok(message) => Frame::from_message(message).map(Ok),
                Err(e) => Some(Err(SignalingError::Socket(e.to_string()))),
            })
        });

        Ok(SocketPair {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
