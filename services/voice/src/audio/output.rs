//! Speaker playback using cpal.
//!
//! A [`Mixer`] owns every scheduled unit and a frame clock that advances as
//! the device pulls audio. The clock is what the session schedules against,
//! so back-to-back units land sample-exact. The mixer always runs at the
//! session's stream rate; when the speaker cannot, one streaming resampler
//! converts the mixed signal on its way to the device.

use super::resample::{create_resampler, to_mono};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use rubato::{FastFixedIn, Resampler};
use focus_core::{
    audio_io::{AudioOutput, AudioOutputDevice, Completion, ScheduledSource},
    codec::PlayableBuffer,
    error::PlaybackError,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Stream-rate frames mixed per resampler pass.
const RENDER_BLOCK: usize = 480;

struct Voice {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
    pos: usize,
    on_ended: Option<Completion>,
}

#[derive(Default)]
struct MixerState {
    clock: u64,
    next_id: u64,
    voices: Vec<Voice>,
    // Reused across callbacks.
    mix: Vec<f32>,
}

/// Mixes scheduled mono units onto a frame clock.
pub struct Mixer {
    sample_rate: u32,
    state: Mutex<MixerState>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(MixerState::default()),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn current_time(&self) -> f64 {
        self.lock().clock as f64 / f64::from(self.sample_rate)
    }

    /// Queues mono samples at context time `at`, clamped to the present.
    pub fn schedule(&self, samples: Vec<f32>, at: f64, on_ended: Completion) -> u64 {
        let mut state = self.lock();
        let requested = (at.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        let start_frame = requested.max(state.clock);
        let id = state.next_id;
        state.next_id += 1;
        state.voices.push(Voice {
            id,
            start_frame,
            samples,
            pos: 0,
            on_ended: Some(on_ended),
        });
        id
    }

    /// Drops a unit without running its completion.
    pub fn cancel(&self, id: u64) {
        self.lock().voices.retain(|v| v.id != id);
    }

    pub fn clear(&self) {
        self.lock().voices.clear();
    }

    #[cfg(test)]
    fn voice_count(&self) -> usize {
        self.lock().voices.len()
    }

    /// Fills an interleaved output buffer and advances the clock. Units that
    /// finish have their completions run after the lock is released.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let mut finished = Vec::new();
        {
            let mut state = self.lock();
            let MixerState {
                clock, voices, mix, ..
            } = &mut *state;
            mix.clear();
            mix.resize(frames, 0.0);
            for voice in voices.iter_mut() {
                let offset = voice.start_frame.saturating_sub(*clock) as usize;
                for slot in mix.iter_mut().skip(offset) {
                    let Some(sample) = voice.samples.get(voice.pos) else {
                        break;
                    };
                    *slot += sample;
                    voice.pos += 1;
                }
            }
            voices.retain_mut(|voice| {
                if voice.pos < voice.samples.len() {
                    return true;
                }
                if let Some(done) = voice.on_ended.take() {
                    finished.push(done);
                }
                false
            });
            *clock += frames as u64;

            for (frame, sample) in out.chunks_mut(channels).zip(mix.iter()) {
                frame.fill(sample.clamp(-1.0, 1.0));
            }
        }
        for done in finished {
            done();
        }
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Feeds the device from the mixer, converting rates when the speaker does
/// not run at the stream rate.
///
/// The mixer is pulled in fixed blocks through a single long-lived
/// resampler, so unit boundaries stay continuous and every scheduled frame
/// reaches the speaker.
struct DeviceRenderer {
    mixer: Arc<Mixer>,
    converter: Option<Converter>,
}

struct Converter {
    resampler: FastFixedIn<f32>,
    block: Vec<f32>,
    converted: Vec<Vec<f32>>,
    fifo: VecDeque<f32>,
}

impl DeviceRenderer {
    fn new(mixer: Arc<Mixer>, device_rate: u32) -> anyhow::Result<Self> {
        let stream_rate = mixer.sample_rate();
        let converter = if stream_rate == device_rate {
            None
        } else {
            let resampler = create_resampler(
                f64::from(stream_rate),
                f64::from(device_rate),
                RENDER_BLOCK,
            )?;
            let max_out = resampler.output_frames_max();
            Some(Converter {
                block: vec![0.0; resampler.input_frames_max()],
                converted: vec![vec![0.0; max_out]],
                fifo: VecDeque::with_capacity(max_out * 8),
                resampler,
            })
        };
        Ok(Self { mixer, converter })
    }

    fn render(&mut self, out: &mut [f32], channels: usize) {
        let Some(conv) = self.converter.as_mut() else {
            self.mixer.render(out, channels);
            return;
        };
        let channels = channels.max(1);
        let frames = out.len() / channels;
        while conv.fifo.len() < frames {
            let needed = conv.resampler.input_frames_next();
            conv.block.resize(needed, 0.0);
            self.mixer.render(&mut conv.block, 1);
            match conv
                .resampler
                .process_into_buffer(&[&conv.block], &mut conv.converted, None)
            {
                Ok((_, 0)) => break,
                Ok((_, produced)) => conv.fifo.extend(&conv.converted[0][..produced]),
                Err(e) => {
                    error!(error = %e, "Output resampler failed");
                    break;
                }
            }
        }
        for frame in out.chunks_mut(channels) {
            frame.fill(conv.fifo.pop_front().unwrap_or(0.0));
        }
    }
}

/// The system speaker, or a named output device.
pub struct CpalOutputDevice {
    device_name: Option<String>,
}

impl CpalOutputDevice {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl AudioOutputDevice for CpalOutputDevice {
    async fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, PlaybackError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let device_name = self.device_name.clone();
        let thread_stop = stop.clone();

        std::thread::Builder::new()
            .name("speaker-playback".to_string())
            .spawn(move || playback_thread(device_name, sample_rate, thread_stop, ready_tx))
            .map_err(|e| PlaybackError::Device(format!("failed to spawn playback thread: {e}")))?;

        let mixer = ready_rx
            .await
            .unwrap_or_else(|_| Err("playback thread exited before the speaker opened".into()))
            .map_err(PlaybackError::Device)?;
        Ok(Arc::new(CpalOutput { mixer, stop }))
    }
}

/// An open speaker. Units must arrive at the stream rate the device was
/// opened with.
pub struct CpalOutput {
    mixer: Arc<Mixer>,
    stop: Arc<AtomicBool>,
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn start(
        &self,
        buffer: PlayableBuffer,
        at: f64,
        on_ended: Completion,
    ) -> Result<Box<dyn ScheduledSource>, PlaybackError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(PlaybackError::Device("output is closed".to_string()));
        }
        if buffer.sample_rate != self.mixer.sample_rate() {
            return Err(PlaybackError::Device(format!(
                "unit is {}Hz but the output runs at {}Hz",
                buffer.sample_rate,
                self.mixer.sample_rate()
            )));
        }
        let samples = to_mono(&buffer.samples, buffer.channels);
        let id = self.mixer.schedule(samples, at, on_ended);
        Ok(Box::new(MixerSource {
            mixer: self.mixer.clone(),
            id,
        }))
    }

    fn close(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            self.mixer.clear();
            info!("Speaker released");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

struct MixerSource {
    mixer: Arc<Mixer>,
    id: u64,
}

impl ScheduledSource for MixerSource {
    fn stop(&mut self) {
        self.mixer.cancel(self.id);
    }
}

fn find_output_device(name: Option<&str>) -> Result<cpal::Device, String> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| format!("cannot enumerate output devices: {e}"))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("output device '{name}' not found")),
        None => host
            .default_output_device()
            .ok_or_else(|| "no output device available".to_string()),
    }
}

/// Prefers an f32 config at the requested rate, mono then stereo, and falls
/// back to the device default.
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig, String> {
    let rate = SampleRate(sample_rate);
    let matching = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
    };
    if let Some(supported) = matching(1).or_else(|| matching(2)) {
        return Ok(supported.with_sample_rate(rate).config());
    }
    let fallback = device
        .default_output_config()
        .map_err(|e| format!("no default output config: {e}"))?;
    if fallback.sample_format() != cpal::SampleFormat::F32 {
        return Err(format!(
            "unsupported output sample format {:?}",
            fallback.sample_format()
        ));
    }
    warn!(
        requested = sample_rate,
        device_rate = fallback.sample_rate().0,
        "Speaker does not support the stream rate; resampling"
    );
    Ok(fallback.config())
}

fn playback_thread(
    device_name: Option<String>,
    sample_rate: u32,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<Arc<Mixer>, String>>,
) {
    let opened = find_output_device(device_name.as_deref()).and_then(|device| {
        let config = output_config(&device, sample_rate)?;
        let mixer = Arc::new(Mixer::new(sample_rate));
        let channels = usize::from(config.channels);
        let mut renderer = DeviceRenderer::new(mixer.clone(), config.sample_rate.0)
            .map_err(|e| format!("cannot resample {sample_rate}Hz output: {e}"))?;
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    renderer.render(data, channels);
                },
                |err| error!("audio output stream error: {err}"),
                None,
            )
            .map_err(|e| format!("failed to build output stream: {e}"))?;
        stream
            .play()
            .map_err(|e| format!("failed to start output stream: {e}"))?;
        info!(
            device = device.name().unwrap_or_default(),
            stream_rate = sample_rate,
            device_rate = config.sample_rate.0,
            channels,
            "Speaker playback started"
        );
        Ok((stream, mixer))
    });

    let stream = match opened {
        Ok((stream, mixer)) => {
            let _ = ready.send(Ok(mixer));
            stream
        }
        Err(reason) => {
            let _ = ready.send(Err(reason));
            return;
        }
    };
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
    }
    drop(stream);
}
