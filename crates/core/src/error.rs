//! Error types for the voice session components.
//!
//! Each component owns a narrow error enum so that callers can decide, per the
//! propagation policy, whether a failure ends the session, degrades it, or is
//! answered on the wire.

/// Inbound or outbound audio that cannot be turned into samples.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Payload is not valid transport encoding, or its byte length is not a
    /// whole number of sample frames.
    #[error("malformed audio: {0}")]
    Malformed(String),
}

/// The speaker (or its context) could not accept a unit.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("playback device error: {0}")]
    Device(String),
}

/// Failures produced while handling a single tool call.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },
    #[error("tool {name} failed: {reason}")]
    Handler { name: String, reason: String },
}

/// Session-level faults surfaced to the host.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Microphone permission denied, device busy or missing.
    #[error("microphone unavailable: {0}")]
    Acquisition(String),
    /// Handshake failure or a dropped connection.
    #[error("connection error: {0}")]
    Connection(String),
    /// The session was closed before start-up finished.
    #[error("session was closed before it opened")]
    Cancelled,
    /// The remote side sent something this client cannot follow.
    #[error("protocol error: {0}")]
    Protocol(String),
}
