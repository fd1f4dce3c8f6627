//! Capability interfaces for the platform audio devices.
//!
//! The session logic only ever sees these traits. Each target platform provides
//! one adapter; tests provide fakes with a hand-driven clock.

use crate::{
    codec::PlayableBuffer,
    error::{PlaybackError, SessionError},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Called by an output when a unit reaches its natural end.
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// A microphone that can be acquired for one session.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Opens the device and starts delivering mono float frames at
    /// `sample_rate` on `frames`. Fails with [`SessionError::Acquisition`].
    async fn acquire(
        &self,
        sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureStream>, SessionError>;
}

/// An acquired microphone. Releasing it twice must be harmless.
pub trait CaptureStream: Send {
    fn close(&mut self);
}

/// Something that can open a playback context.
#[async_trait]
pub trait AudioOutputDevice: Send + Sync {
    async fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, PlaybackError>;
}

/// An open playback context with its own monotonic clock.
pub trait AudioOutput: Send + Sync {
    /// Seconds elapsed on the context clock.
    fn current_time(&self) -> f64;

    /// Starts `buffer` at context time `at` (or immediately if `at` has
    /// passed). `on_ended` fires once playback runs to the end; it is never
    /// invoked from inside `start` or `stop`, and is not invoked for a
    /// stopped source.
    fn start(
        &self,
        buffer: PlayableBuffer,
        at: f64,
        on_ended: Completion,
    ) -> Result<Box<dyn ScheduledSource>, PlaybackError>;

    /// Releases the context. Safe to call more than once.
    fn close(&self);
}

/// A unit that has been handed to the output.
pub trait ScheduledSource: Send {
    /// Silences the source immediately, whether or not it has begun.
    fn stop(&mut self);
}

/// Stand-in used when no speaker could be opened; every start fails.
pub struct UnavailableOutput {
    reason: String,
}

impl UnavailableOutput {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl AudioOutput for UnavailableOutput {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn start(
        &self,
        _buffer: PlayableBuffer,
        _at: f64,
        _on_ended: Completion,
    ) -> Result<Box<dyn ScheduledSource>, PlaybackError> {
        Err(PlaybackError::Device(self.reason.clone()))
    }

    fn close(&self) {}
}
