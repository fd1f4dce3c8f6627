//! The Gemini Live WebSocket connection.

use crate::types::{self, ServerMessage};
use async_trait::async_trait;
use focus_core::{
    error::SessionError,
    generic_types::{ClientEvent, ServerEvent, SessionSetup},
    realtime_api::{RealtimeConnection, RealtimeTransport},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::{fmt::Display, time::Duration};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, protocol::Message as WsMessage},
};
use tracing::{Instrument, debug, error, info, warn};

pub const DEFAULT_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);
const CHANNEL_CAPACITY: usize = 64;

/// Opens Gemini Live sessions with an API key.
pub struct GeminiLiveTransport {
    api_key: SecretString,
    model: String,
    url: String,
}

impl GeminiLiveTransport {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
            url: DEFAULT_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl RealtimeTransport for GeminiLiveTransport {
    async fn connect(&self, setup: SessionSetup) -> Result<RealtimeConnection, SessionError> {
        let url = format!("{}?key={}", self.url, self.api_key.expose_secret());
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        info!(model = %self.model, "Connected to Gemini Live WebSocket");
        let (mut sink, mut stream) = ws_stream.split();

        let setup_msg = serde_json::to_string(&types::setup_message(&self.model, &setup))
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        sink.send(WsMessage::Text(setup_msg.into()))
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        tokio::time::timeout(SETUP_TIMEOUT, await_setup_complete(&mut stream))
            .await
            .map_err(|_| SessionError::Connection("timed out waiting for setup".to_string()))??;
        info!("Gemini session setup is complete. Ready for bidirectional streaming.");

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(sink, stream, outbound_rx, inbound_tx).in_current_span());

        Ok(RealtimeConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Gemini sends JSON in both text and binary frames.
fn frame_text(message: &WsMessage) -> Option<&str> {
    match message {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

/// Reads frames until the server acknowledges the setup message.
pub(crate) async fn await_setup_complete<St>(stream: &mut St) -> Result<(), SessionError>
where
    St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| SessionError::Connection(e.to_string()))?;
        if let WsMessage::Close(close_frame) = &frame {
            return Err(SessionError::Connection(format!(
                "closed during setup: {close_frame:?}"
            )));
        }
        let Some(text) = frame_text(&frame) else {
            continue;
        };
        let message: ServerMessage =
            serde_json::from_str(text).map_err(|e| SessionError::Protocol(e.to_string()))?;
        if message.setup_complete.is_some() {
            return Ok(());
        }
        warn!("Ignoring message received before setup completed");
    }
    Err(SessionError::Connection(
        "connection ended during setup".to_string(),
    ))
}

/// Moves events between the session channels and the socket until either
/// side goes away.
pub(crate) async fn pump<Si, St>(
    mut sink: Si,
    mut stream: St,
    mut outbound: mpsc::Receiver<ClientEvent>,
    inbound: mpsc::Sender<ServerEvent>,
) where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
    St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(message) = event.and_then(types::client_message) else {
                    debug!("Session closed the connection");
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                };
                let payload = match serde_json::to_string(&message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize Gemini message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(payload.into())).await {
                    error!(error = %e, "Error writing to Gemini WebSocket");
                    let _ = inbound.send(ServerEvent::Error(e.to_string())).await;
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Close(close_frame))) => {
                    info!(?close_frame, "Gemini WebSocket connection closed by server.");
                    let reason = close_frame.map(|f| f.reason.to_string());
                    let _ = inbound.send(ServerEvent::Closed { reason }).await;
                    break;
                }
                Some(Ok(frame)) => {
                    let Some(text) = frame_text(&frame) else {
                        continue;
                    };
                    let message = match serde_json::from_str::<ServerMessage>(text) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "Failed to parse Gemini message");
                            continue;
                        }
                    };
                    let mut delivered = true;
                    for event in types::server_events(message) {
                        if inbound.send(event).await.is_err() {
                            delivered = false;
                            break;
                        }
                    }
                    if !delivered {
                        debug!("Session is gone; closing Gemini WebSocket");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Error reading from Gemini WebSocket");
                    let _ = inbound.send(ServerEvent::Error(e.to_string())).await;
                    break;
                }
                None => {
                    let _ = inbound.send(ServerEvent::Closed { reason: None }).await;
                    break;
                }
            },
        }
    }
}
