//! Schnittstelle zwischen CallEngine und Signaling-Transport
//!
//! Die CallEngine braucht vom Transport nur zwei Dinge: Umschläge senden und
//! eingehende Umschläge empfangen. Andere Nachrichten auf demselben Relay
//! (z.B. Fahrzeug-Updates) werden hier herausgefiltert.

use super::client::SignalingClient;
use super::events::{Subscription, TransportEvent, TransportEventKind};
use super::messages::SignalingMessage;

pub type SignalHandler = Box<dyn Fn(SignalingMessage) + Send + Sync>;

pub trait SignalingTransport: Send + Sync {
    /// Sendet einen Umschlag; `false` wenn der Transport nicht verbunden ist
    fn send_signal(&self, message: &SignalingMessage) -> bool;

    /// Registriert einen Handler für eingehende Umschläge
    fn on_signal(&self, handler: SignalHandler) -> Subscription;

    /// Eigene Kennung, geht als `fromUserId` in ausgehende Umschläge
    fn local_user_id(&self) -> Option<String>;
}

impl SignalingTransport for SignalingClient {
    fn send_signal(&self, message: &SignalingMessage) -> bool {
        tracing::debug!(call_id = message.call_id(), "Sending {}", message.kind());
        self.send(message)
    }

    fn local_user_id(&self) -> Option<String> {
        self.config().user_id.clone()
    }

    fn on_signal(&self, handler: SignalHandler) -> Subscription {
        self.subscribe(TransportEventKind::Message, move |event| {
            let TransportEvent::Message(value) = event else {
                return;
            };

            match serde_json::from_value::<SignalingMessage>(value.clone()) {
                Ok(message) => {
                    tracing::debug!(call_id = message.call_id(), "Received {}", message.kind());
                    handler(message);
                }
                Err(e) => {
                    tracing::trace!("Ignoring non-signaling message: {}", e);
                }
            }
        })
    }
}
