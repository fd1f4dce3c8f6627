pub mod assistant;
pub mod audio_io;
pub mod capture;
pub mod codec;
pub mod error;
pub mod generic_types;
pub mod playback;
pub mod realtime_api;
pub mod schedule;
pub mod session;
pub mod tools;
pub mod transcript;

#[cfg(test)]
pub(crate) mod testing;

pub use assistant::{Assistant, SessionHandle};
pub use session::{SessionConfig, SessionController, SessionDeps, SessionState};
