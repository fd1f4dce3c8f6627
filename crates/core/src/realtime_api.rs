//! The seam between the session and a speech-to-speech provider.

use crate::{
    error::SessionError,
    generic_types::{ClientEvent, ServerEvent, SessionSetup},
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Both halves of an established provider connection.
///
/// Dropping `outbound` (or sending [`ClientEvent::Close`]) ends the
/// connection; `inbound` yields `None` once the provider side is gone.
#[derive(Debug)]
pub struct RealtimeConnection {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::Receiver<ServerEvent>,
}

/// A provider that can open realtime voice sessions.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Connects and completes the provider's setup handshake.
    async fn connect(&self, setup: SessionSetup) -> Result<RealtimeConnection, SessionError>;
}
