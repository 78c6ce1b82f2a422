//! App - Zusammenbau von Signaling und CallEngine
//!
//! Hält genau einen `SignalingClient` und eine `CallEngine`. Callbacks der
//! Engine und Transport-Events werden als `AppEvent` über einen Broadcast
//! Channel verteilt.

use crate::call_engine::{
    CallConfig, CallEngine, CallObserver, ConfigError, ConnectionState, LocalMediaDevices,
    MediaDevices, PeerConnectionFactory, RemoteStream, StreamKind, WebRtcPeerFactory,
};
use crate::signaling::{
    SignalingClient, SignalingError, SignalingTransport, Subscription, TransportConfig,
    TransportEvent, TransportEventKind, DEFAULT_SIGNALING_URL,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub const ENV_SIGNALING_URL: &str = "SENDELIVER_SIGNALING_URL";
pub const ENV_USER_ID: &str = "SENDELIVER_USER_ID";
pub const ENV_CALL_CONFIG: &str = "SENDELIVER_CALL_CONFIG";
pub const ENV_CALL_TARGET: &str = "SENDELIVER_CALL_TARGET";

pub const DEFAULT_LOG_FILTER: &str = "sendeliver_rtc=debug,webrtc=warn";

/// Logging initialisieren; `RUST_LOG` hat Vorrang
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Zweiter Aufruf (z.B. in Tests) ist kein Fehler
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub call: CallConfig,
    /// Wird nach dem Verbinden automatisch angerufen
    pub call_target: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let url = non_empty(ENV_SIGNALING_URL).unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        let mut transport = TransportConfig::new(url);
        if let Some(user_id) = non_empty(ENV_USER_ID) {
            transport = transport.with_user_id(user_id);
        }

        let call = match non_empty(ENV_CALL_CONFIG) {
            Some(json) => CallConfig::from_json(&json)?,
            None => CallConfig::default(),
        };

        Ok(Self {
            transport,
            call,
            call_target: non_empty(ENV_CALL_TARGET),
        })
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events für den Host
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Verbindung zum Relay (geöffnet, geschlossen, Fehler)
    Transport(TransportEvent),
    CallStateChanged(ConnectionState),
    IncomingCall {
        call_id: String,
        from_user_id: Option<String>,
    },
    RemoteStream(RemoteStream),
    StreamEnded(StreamKind),
    DataChannelMessage(serde_json::Value),
    Error(String),
}

/// Leitet Engine-Callbacks in den Broadcast Channel
struct BroadcastObserver {
    events: broadcast::Sender<AppEvent>,
}

impl BroadcastObserver {
    fn publish(&self, event: AppEvent) {
        // Keine Empfänger ist kein Fehler
        let _ = self.events.send(event);
    }
}

impl CallObserver for BroadcastObserver {
    fn on_connection_state_change(&self, state: ConnectionState) {
        self.publish(AppEvent::CallStateChanged(state));
    }

    fn on_remote_stream(&self, stream: RemoteStream) {
        self.publish(AppEvent::RemoteStream(stream));
    }

    fn on_stream_ended(&self, kind: StreamKind) {
        self.publish(AppEvent::StreamEnded(kind));
    }

    fn on_error(&self, message: String) {
        self.publish(AppEvent::Error(message));
    }

    fn on_data_channel_message(&self, message: serde_json::Value) {
        self.publish(AppEvent::DataChannelMessage(message));
    }

    fn on_incoming_call(&self, call_id: &str, from_user_id: Option<&str>) {
        self.publish(AppEvent::IncomingCall {
            call_id: call_id.to_string(),
            from_user_id: from_user_id.map(str::to_string),
        });
    }
}

// ============================================================================
// APP
// ============================================================================

pub struct App {
    signaling: SignalingClient,
    engine: Arc<CallEngine>,
    events: broadcast::Sender<AppEvent>,
    subscriptions: Vec<Subscription>,
}

impl App {
    /// Muss innerhalb einer Tokio Runtime aufgerufen werden
    pub fn new(config: AppConfig) -> Self {
        Self::with_backends(
            SignalingClient::new(config.transport),
            config.call,
            Arc::new(WebRtcPeerFactory),
            Arc::new(LocalMediaDevices),
        )
    }

    pub fn with_backends(
        signaling: SignalingClient,
        call: CallConfig,
        peers: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaDevices>,
    ) -> Self {
        let (events, _) = broadcast::channel(100);

        let observer = Arc::new(BroadcastObserver {
            events: events.clone(),
        });
        let transport: Arc<dyn SignalingTransport> = Arc::new(signaling.clone());
        let engine = Arc::new(CallEngine::with_backends(
            call, transport, peers, media, observer,
        ));

        let subscriptions = [
            TransportEventKind::Connection,
            TransportEventKind::Close,
            TransportEventKind::Error,
        ]
        .into_iter()
        .map(|kind| {
            let events = events.clone();
            signaling.subscribe(kind, move |event| {
                let _ = events.send(AppEvent::Transport(event.clone()));
            })
        })
        .collect();

        Self {
            signaling,
            engine,
            events,
            subscriptions,
        }
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        &self.engine
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    /// Verbindet mit dem Relay
    pub async fn start(&self) -> Result<(), SignalingError> {
        tracing::info!("Connecting to signaling relay {}", self.signaling.config().url);
        self.signaling.connect().await
    }

    /// Anruf beenden, Engine abmelden, Verbindung trennen
    pub async fn shutdown(self) {
        self.engine.dispose().await;
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        self.signaling.disconnect();
        tracing::info!("Shutdown complete");
    }
}
