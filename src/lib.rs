//! Sendeliver RTC - Echtzeit-Kern der Sendeliver Plattform
//!
//! Verbindet Versender und Frachtführer per Videoanruf:
//! - Reconnecting WebSocket zum Signaling-Relay
//! - WebRTC Video-Sitzungen mit Bildschirmfreigabe und Data Channel
//! - Neuversuche bei Verbindungsverlust
//!
//! Keine globalen Singletons: `SignalingClient` und `CallEngine` werden vom
//! Host (siehe `app::App`) erzeugt und übergeben.

pub mod app;
pub mod call_engine;
pub mod signaling;

pub use app::{App, AppConfig, AppEvent};
pub use call_engine::{CallConfig, CallEngine, CallObserver, ConnectionState};
pub use signaling::{SignalingClient, SignalingMessage, TransportConfig};
