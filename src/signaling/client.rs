//! Reconnecting WebSocket Client für den Signaling-Relay
//!
//! Hält genau eine logische Verbindung zum Relay:
//! - JSON-Nachrichten in beide Richtungen
//! - Automatischer Reconnect mit exponentiellem Backoff
//! - Heartbeat per WebSocket-Ping
//! - Event-basierte Kommunikation (connection / message / close / error)

use super::events::{EventBus, EventHandler, Subscription, TransportEvent, TransportEventKind};
use super::socket::{CloseInfo, Connector, Frame, FrameSink, FrameStream, WsConnector, CLOSE_NORMAL};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Malformed frame from signaling server: {reason}")]
    MalformedFrame { raw: String, reason: String },

    #[error("Max reconnection attempts ({attempts}) reached")]
    ReconnectExhausted { attempts: u32 },

    #[error("WebSocket error: {0}")]
    Socket(String),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// WebSocket-Endpunkt des Relays
    pub url: String,

    /// Eigene User-ID, wird als `userId` Query-Parameter angehängt
    pub user_id: Option<String>,

    /// Basis für den Backoff: `base_timeout * 2^(attempt-1)`
    pub base_timeout: Duration,

    pub max_reconnect_attempts: u32,

    /// `None` schaltet den Heartbeat ab
    pub heartbeat_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            user_id: None,
            base_timeout: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            heartbeat_interval: Some(Duration::from_secs(25)),
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Vollständige URL inklusive `userId`
    pub fn endpoint(&self) -> Result<String, SignalingError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        if let Some(user_id) = &self.user_id {
            url.query_pairs_mut().append_pair("userId", user_id);
        }

        Ok(url.to_string())
    }

    /// Wartezeit vor Reconnect-Versuch `attempt` (beginnt bei 1)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_timeout.saturating_mul(factor)
    }
}

// ============================================================================
// CLIENT STATE
// ============================================================================

/// Zustand der Verbindung, analog zu `WebSocket.readyState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    #[default]
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Connecting => "CONNECTING",
            ReadyState::Open => "OPEN",
            ReadyState::Closing => "CLOSING",
            ReadyState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct LinkState {
    ready_state: ReadyState,
    /// Zählt geöffnete Verbindungen, damit verspätete Close-Events einer
    /// alten Verbindung ignoriert werden
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    reconnect_attempts: u32,
    intentional_close: bool,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct ClientInner {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    events: Arc<EventBus>,
    link: Mutex<LinkState>,
    /// Serialisiert connect()-Aufrufe und Reconnect-Versuche
    connect_lock: tokio::sync::Mutex<()>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Relay Kommunikation
///
/// Klone teilen sich dieselbe Verbindung.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    /// Erstellt einen Client mit dem WebSocket Connector
    pub fn new(config: TransportConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                events: Arc::new(EventBus::default()),
                link: Mutex::new(LinkState::default()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Registriert einen Handler für einen Event-Typ
    pub fn subscribe<F>(&self, kind: TransportEventKind, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.inner.events.subscribe(kind, handler)
    }

    pub fn state(&self) -> ReadyState {
        self.inner.link.lock().ready_state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ReadyState::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ReadyState::Connecting
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.link.lock().reconnect_attempts
    }

    /// Verbindet mit dem Relay
    ///
    /// Ist die Verbindung bereits offen, passiert nichts.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let _guard = self.inner.connect_lock.lock().await;

        {
            let mut link = self.inner.link.lock();
            if link.ready_state == ReadyState::Open {
                tracing::debug!("Signaling connection already open");
                return Ok(());
            }
            link.intentional_close = false;
            if let Some(timer) = link.reconnect_timer.take() {
                timer.abort();
            }
        }

        self.inner.open().await
    }

    /// Sendet eine Nachricht
    ///
    /// Strings gehen unverändert raus, alles andere als JSON. Ohne offene
    /// Verbindung wird `false` zurückgegeben und ein `error` Event ausgelöst.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        let payload = match serde_json::to_value(message) {
            Ok(serde_json::Value::String(text)) => text,
            Ok(value) => value.to_string(),
            Err(e) => {
                tracing::error!("Failed to serialize outgoing message: {}", e);
                self.inner
                    .events
                    .emit(TransportEvent::Error(SignalingError::SendFailed(e.to_string())));
                return false;
            }
        };

        let outbound = {
            let link = self.inner.link.lock();
            if link.ready_state == ReadyState::Open {
                link.outbound.clone()
            } else {
                None
            }
        };

        let Some(tx) = outbound else {
            tracing::warn!("Cannot send message: not connected to signaling server");
            self.inner
                .events
                .emit(TransportEvent::Error(SignalingError::NotConnected));
            return false;
        };

        match tx.send(Frame::Text(payload)) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to queue WebSocket message: {}", e);
                self.inner
                    .events
                    .emit(TransportEvent::Error(SignalingError::SendFailed(e.to_string())));
                false
            }
        }
    }

    /// Trennt die Verbindung absichtlich, ohne Reconnect
    pub fn disconnect(&self) {
        let outbound = {
            let mut link = self.inner.link.lock();
            link.intentional_close = true;
            if let Some(timer) = link.reconnect_timer.take() {
                timer.abort();
            }

            let outbound = link.outbound.take();
            link.ready_state = if outbound.is_some() {
                ReadyState::Closing
            } else {
                ReadyState::Closed
            };
            outbound
        };

        if let Some(tx) = outbound {
            tracing::info!("Disconnecting from signaling server");
            let _ = tx.send(Frame::Close {
                code: CLOSE_NORMAL,
                reason: "Client disconnect".to_string(),
            });
        }
    }
}

impl ClientInner {
    /// Öffnet eine neue Verbindung; Aufrufer hält `connect_lock`
    async fn open(self: &Arc<Self>) -> Result<(), SignalingError> {
        let endpoint = match self.config.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!("{}", e);
                self.events.emit(TransportEvent::Error(e.clone()));
                return Err(e);
            }
        };

        let epoch = {
            let mut link = self.link.lock();
            link.ready_state = ReadyState::Connecting;
            link.epoch += 1;
            link.epoch
        };

        tracing::info!("Connecting to signaling server: {}", endpoint);

        let pair = match self.connector.connect(&endpoint).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("Signaling connection failed: {}", e);
                self.events.emit(TransportEvent::Error(e.clone()));
                self.handle_close(epoch, CloseInfo::abnormal(e.to_string()));
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = {
            let mut link = self.link.lock();
            if link.intentional_close {
                link.ready_state = ReadyState::Closing;
                true
            } else {
                link.ready_state = ReadyState::Open;
                link.outbound = Some(tx.clone());
                link.reconnect_attempts = 0;
                false
            }
        };

        tokio::spawn(write_loop(pair.sink, rx, self.config.heartbeat_interval));
        tokio::spawn(read_loop(Arc::clone(self), pair.stream, epoch));

        if cancelled {
            // disconnect() kam während des Verbindungsaufbaus
            let _ = tx.send(Frame::Close {
                code: CLOSE_NORMAL,
                reason: "Client disconnect".to_string(),
            });
            return Err(SignalingError::ConnectionFailed(
                "Disconnected while connecting".to_string(),
            ));
        }

        tracing::info!("Connected to signaling server");
        self.events.emit(TransportEvent::Connection);
        Ok(())
    }

    fn dispatch_text(&self, text: String) {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => self.events.emit(TransportEvent::Message(value)),
            Err(e) => {
                tracing::warn!("Dropping malformed signaling frame: {}", e);
                self.events
                    .emit(TransportEvent::Error(SignalingError::MalformedFrame {
                        raw: text,
                        reason: e.to_string(),
                    }));
            }
        }
    }

    fn dispatch_invalid(&self, data: Vec<u8>) {
        tracing::warn!(
            "Dropping signaling frame with invalid UTF-8 ({} bytes)",
            data.len()
        );
        self.events
            .emit(TransportEvent::Error(SignalingError::MalformedFrame {
                raw: String::from_utf8_lossy(&data).into_owned(),
                reason: "invalid UTF-8".to_string(),
            }));
    }

    fn handle_close(self: &Arc<Self>, epoch: u64, close: CloseInfo) {
        let reconnect = {
            let mut link = self.link.lock();
            if link.epoch != epoch {
                return;
            }
            link.ready_state = ReadyState::Closed;
            link.outbound = None;
            !link.intentional_close && close.is_unexpected()
        };

        tracing::info!(
            code = close.code,
            was_clean = close.was_clean,
            "Signaling connection closed: {}",
            close.reason
        );
        self.events.emit(TransportEvent::Close(close));

        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut link = self.link.lock();

        if link.reconnect_attempts >= self.config.max_reconnect_attempts {
            drop(link);
            let attempts = self.config.max_reconnect_attempts;
            tracing::error!("Max reconnection attempts ({}) reached", attempts);
            self.events
                .emit(TransportEvent::Error(SignalingError::ReconnectExhausted { attempts }));
            return;
        }

        link.reconnect_attempts += 1;
        let attempt = link.reconnect_attempts;
        let delay = self.config.reconnect_delay(attempt);

        tracing::info!(
            "Scheduling reconnect attempt {}/{} in {:?}",
            attempt,
            self.config.max_reconnect_attempts,
            delay
        );

        if let Some(timer) = link.reconnect_timer.take() {
            timer.abort();
        }

        let inner = Arc::clone(self);
        link.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Ab hier kann der Timer nicht mehr abgebrochen werden
            inner.link.lock().reconnect_timer = None;

            let _guard = inner.connect_lock.lock().await;
            {
                let link = inner.link.lock();
                if link.intentional_close || link.ready_state == ReadyState::Open {
                    return;
                }
            }

            if let Err(e) = inner.open().await {
                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
            }
        }));
    }
}

// ============================================================================
// SOCKET TASKS
// ============================================================================

async fn read_loop(inner: Arc<ClientInner>, mut stream: FrameStream, epoch: u64) {
    let close = loop {
        match stream.next().await {
            Some(Ok(Frame::Text(text))) => inner.dispatch_text(text),
            Some(Ok(Frame::Invalid(data))) => inner.dispatch_invalid(data),
            Some(Ok(Frame::Close { code, reason })) => {
                break CloseInfo {
                    code,
                    reason,
                    was_clean: true,
                }
            }
            Some(Ok(Frame::Ping(_))) => {}
            Some(Err(e)) => {
                tracing::error!("WebSocket error: {}", e);
                inner.events.emit(TransportEvent::Error(e.clone()));
                break CloseInfo::abnormal(e.to_string());
            }
            None => break CloseInfo::abnormal("Connection lost"),
        }
    };

    inner.handle_close(epoch, close);
}

async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    heartbeat: Option<Duration>,
) {
    let mut heartbeat = heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = next_heartbeat(&mut heartbeat) => Frame::Ping(Vec::new()),
        };

        let closing = matches!(frame, Frame::Close { .. });
        if let Err(e) = sink.send(frame).await {
            tracing::error!("Failed to send WebSocket message: {}", e);
            break;
        }
        if closing {
            break;
        }
    }

    let _ = sink.close().await;
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.inner.link.lock();
        f.debug_struct("SignalingClient")
            .field("url", &self.inner.config.url)
            .field("state", &link.ready_state)
            .field("reconnect_attempts", &link.reconnect_attempts)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
