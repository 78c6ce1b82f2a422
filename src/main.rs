//! Sendeliver RTC Node
//!
//! Verbindet sich mit dem Relay, nimmt eingehende Anrufe automatisch an und
//! ruft optional `SENDELIVER_CALL_TARGET` an. Beenden mit Ctrl-C.

use anyhow::Context;
use sendeliver_rtc::app::{init_tracing, App, AppConfig, AppEvent};
use sendeliver_rtc::call_engine::ConnectionState;
use sendeliver_rtc::signaling::TransportEvent;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("Failed to read configuration")?;
    let call_target = config.call_target.clone();
    tracing::info!(
        "Starting Sendeliver RTC as {}",
        config.transport.user_id.as_deref().unwrap_or("anonymous")
    );

    let app = App::new(config);
    let engine = app.engine().clone();
    let mut events = app.subscribe();

    // Bei Fehlschlag läuft der Reconnect im Hintergrund weiter
    if let Err(e) = app.start().await {
        tracing::warn!("Signaling relay not reachable yet: {}", e);
    }

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(AppEvent::Transport(TransportEvent::Connection)) => {
                    tracing::info!("Connected to signaling relay");
                    if let Some(target) = &call_target {
                        if engine.connection_state() == ConnectionState::Disconnected {
                            engine.initiate_video_call(target).await;
                        }
                    }
                }
                Ok(AppEvent::IncomingCall { call_id, from_user_id }) => {
                    // Unbekannter Anrufer: nur annehmen, wenn ein Ziel konfiguriert ist
                    match from_user_id.or_else(|| call_target.clone()) {
                        Some(peer) => {
                            tracing::info!("Answering call {} from {}", call_id, peer);
                            engine.accept_call(&call_id, &peer).await;
                        }
                        None => {
                            tracing::warn!("Call {} has no known caller, rejecting", call_id);
                            engine.reject_call(&call_id).await;
                        }
                    }
                }
                Ok(AppEvent::CallStateChanged(state)) => {
                    tracing::info!("Call is {}", state);
                }
                Ok(AppEvent::RemoteStream(stream)) => {
                    tracing::info!(
                        "Remote stream {} with {} track(s)",
                        stream.id(),
                        stream.tracks().len()
                    );
                }
                Ok(AppEvent::DataChannelMessage(message)) => {
                    tracing::info!("Peer message: {}", message);
                }
                Ok(AppEvent::Error(message)) => {
                    tracing::error!("Call error: {}", message);
                }
                Ok(other) => tracing::debug!("{:?}", other),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} app events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    app.shutdown().await;
    Ok(())
}
