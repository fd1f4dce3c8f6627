//! Microphone capture using cpal.
//!
//! The cpal stream is not `Send`, so it lives on a dedicated thread. The
//! device callback downmixes into a lock-free ring; the thread drains the
//! ring, resamples to the session rate and forwards frames to the session.

use super::resample::MonoResampler;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample, StreamConfig};
use focus_core::{
    audio_io::{AudioInput, CaptureStream},
    error::SessionError,
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// About two seconds of 48kHz mono.
const RING_CAPACITY: usize = 96_000;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const RESAMPLE_CHUNK: usize = 480;

/// The system microphone, or a named input device.
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl AudioInput for CpalInput {
    async fn acquire(
        &self,
        sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureStream>, SessionError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let device_name = self.device_name.clone();
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || capture_thread(device_name, sample_rate, frames, thread_stop, ready_tx))
            .map_err(|e| SessionError::Acquisition(format!("failed to spawn capture thread: {e}")))?;

        let ready = ready_rx.await.unwrap_or_else(|_| {
            Err("capture thread exited before the microphone opened".to_string())
        });
        let mut capture = CpalCapture {
            stop,
            thread: Some(thread),
        };
        match ready {
            Ok(()) => Ok(Box::new(capture)),
            Err(reason) => {
                capture.close();
                Err(SessionError::Acquisition(reason))
            }
        }
    }
}

/// A running microphone. Closing only signals the capture thread, which
/// drops the stream within one poll interval; the thread is reaped on drop.
pub struct CpalCapture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCapture {
    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
        let Some(thread) = self.thread.take() else {
            return;
        };
        let reap = move || {
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
        };
        // Never park a runtime worker on the join.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(reap);
            }
            Err(_) => reap(),
        }
    }
}

fn find_input_device(name: Option<&str>) -> Result<cpal::Device, String> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| format!("cannot enumerate input devices: {e}"))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("input device '{name}' not found")),
        None => host
            .default_input_device()
            .ok_or_else(|| "no default input device".to_string()),
    }
}

fn capture_thread(
    device_name: Option<String>,
    target_rate: u32,
    frames: mpsc::Sender<Vec<f32>>,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let (stream, mut consumer, native_rate) = match open_stream(device_name.as_deref()) {
        Ok(opened) => opened,
        Err(reason) => {
            let _ = ready.send(Err(reason));
            return;
        }
    };
    let mut resampler = match MonoResampler::new(native_rate, target_rate, RESAMPLE_CHUNK) {
        Ok(resampler) => resampler,
        Err(e) => {
            let _ = ready.send(Err(format!("cannot resample {native_rate}Hz input: {e}")));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("failed to start input stream: {e}")));
        return;
    }
    info!(native_rate, target_rate, "Microphone capture started");
    let _ = ready.send(Ok(()));

    let mut scratch = vec![0.0f32; RING_CAPACITY];
    while !stop.load(Ordering::SeqCst) {
        let n = consumer.pop_slice(&mut scratch);
        if n > 0 {
            let samples = resampler.process(&scratch[..n]);
            if !samples.is_empty() && frames.try_send(samples).is_err() {
                if frames.is_closed() {
                    debug!("Capture receiver is gone");
                    break;
                }
                debug!("audio channel full, dropping frame");
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    drop(stream);
    info!("Microphone released");
}

fn open_stream(device_name: Option<&str>) -> Result<(cpal::Stream, HeapCons<f32>, u32), String> {
    let device = find_input_device(device_name)?;
    info!(
        device = device.name().unwrap_or_else(|_| "<unknown>".into()),
        "Using input device"
    );
    let supported = device
        .default_input_config()
        .map_err(|e| format!("no default input config: {e}"))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let native_rate = config.sample_rate.0;

    let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, producer),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, producer),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, producer),
        other => return Err(format!("unsupported input sample format {other:?}")),
    }?;
    Ok((stream, consumer, native_rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HeapProd<f32>,
) -> Result<cpal::Stream, String>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let mut mono = Vec::with_capacity(RING_CAPACITY);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks_exact(channels).map(|frame| {
                    frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / channels as f32
                }));
                let pushed = producer.push_slice(&mono);
                if pushed < mono.len() {
                    warn!(dropped = mono.len() - pushed, "capture ring full");
                }
            },
            |err| error!("audio input stream error: {err}"),
            None,
        )
        .map_err(|e| format!("failed to build input stream: {e}"))
}
