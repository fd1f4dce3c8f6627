//! Gemini Live transport for the focus voice session.

pub mod transport;
pub mod types;

pub use transport::{DEFAULT_MODEL, DEFAULT_URL, GeminiLiveTransport};
