//! Microphone frames to encoded chunks.

use crate::{
    codec::{self, AudioChunk, AudioFormat},
    session::SessionState,
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Re-frames raw microphone samples into fixed-size PCM16 chunks.
///
/// Chunks are independent of each other; the only carried state is the
/// remainder of samples that did not yet fill a frame.
pub struct CaptureProducer {
    frame_size: usize,
    format: AudioFormat,
}

impl CaptureProducer {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size: frame_size.max(1),
            format: AudioFormat::mono(sample_rate),
        }
    }

    /// Runs until the microphone closes, the consumer goes away, or the
    /// session stops streaming. The session state is re-checked before every
    /// chunk. Returns the number of chunks emitted.
    pub async fn run(
        self,
        mut frames: mpsc::Receiver<Vec<f32>>,
        chunks: mpsc::Sender<AudioChunk>,
        mut state: watch::Receiver<SessionState>,
    ) -> usize {
        let mut pending: Vec<f32> = Vec::with_capacity(self.frame_size * 2);
        let mut emitted = 0;

        loop {
            let samples = tokio::select! {
                biased;
                _ = state.wait_for(|s| !s.is_streaming()) => break,
                samples = frames.recv() => match samples {
                    Some(samples) => samples,
                    None => break,
                },
            };
            pending.extend_from_slice(&samples);

            while pending.len() >= self.frame_size {
                if !state.borrow().is_streaming() {
                    debug!(emitted, "Session stopped streaming; capture ends");
                    return emitted;
                }
                let frame: Vec<f32> = pending.drain(..self.frame_size).collect();
                if chunks
                    .send(codec::encode_chunk(&frame, self.format))
                    .await
                    .is_err()
                {
                    return emitted;
                }
                emitted += 1;
            }
        }

        debug!(emitted, "Capture producer finished");
        emitted
    }
}
