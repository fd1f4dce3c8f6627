//! Hand-driven fakes for the device, transport and store seams.

use crate::{
    audio_io::{AudioInput, AudioOutput, AudioOutputDevice, CaptureStream, Completion, ScheduledSource},
    codec::{OUTPUT_SAMPLE_RATE, PlayableBuffer},
    error::{PlaybackError, SessionError},
    generic_types::{ClientEvent, ServerEvent, SessionSetup},
    realtime_api::{RealtimeConnection, RealtimeTransport},
    schedule::{Appointment, AppointmentStore, NewTask, TaskStore},
    session::SessionDeps,
};
use async_trait::async_trait;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// A mono buffer of `seconds` at the output rate.
pub fn buffer_of(seconds: f64) -> PlayableBuffer {
    let frames = (seconds * OUTPUT_SAMPLE_RATE as f64).round() as usize;
    PlayableBuffer {
        samples: vec![0.0; frames],
        sample_rate: OUTPUT_SAMPLE_RATE,
        channels: 1,
    }
}

/// Polls `cond` until it holds, failing the test after two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

struct FakeUnit {
    at: f64,
    frames: usize,
    stopped: Arc<AtomicBool>,
    on_ended: Option<Completion>,
}

#[derive(Default)]
struct FakeOutputState {
    time: f64,
    failing: bool,
    units: Vec<FakeUnit>,
}

/// Output context whose clock only moves when the test says so.
#[derive(Default)]
pub struct FakeOutput {
    state: Mutex<FakeOutputState>,
    closes: AtomicUsize,
}

impl FakeOutput {
    pub fn set_time(&self, time: f64) {
        self.state.lock().unwrap().time = time;
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Plays unit `index` to its natural end.
    pub fn finish(&self, index: usize) {
        let on_ended = {
            let mut state = self.state.lock().unwrap();
            let unit = &mut state.units[index];
            if unit.stopped.load(Ordering::SeqCst) {
                None
            } else {
                unit.on_ended.take()
            }
        };
        if let Some(on_ended) = on_ended {
            on_ended();
        }
    }

    pub fn is_stopped(&self, index: usize) -> bool {
        self.state.lock().unwrap().units[index]
            .stopped
            .load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    /// Scheduled start and frame count of unit `index`.
    pub fn unit(&self, index: usize) -> (f64, usize) {
        let state = self.state.lock().unwrap();
        (state.units[index].at, state.units[index].frames)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct FakeSource {
    stopped: Arc<AtomicBool>,
}

impl ScheduledSource for FakeSource {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    fn start(
        &self,
        buffer: PlayableBuffer,
        at: f64,
        on_ended: Completion,
    ) -> Result<Box<dyn ScheduledSource>, PlaybackError> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(PlaybackError::Device("fake output failing".to_string()));
        }
        let stopped = Arc::new(AtomicBool::new(false));
        state.units.push(FakeUnit {
            at,
            frames: buffer.frames(),
            stopped: stopped.clone(),
            on_ended: Some(on_ended),
        });
        Ok(Box::new(FakeSource { stopped }))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeOutputDevice {
    pub output: Arc<FakeOutput>,
    pub fail: bool,
}

#[async_trait]
impl AudioOutputDevice for FakeOutputDevice {
    async fn open(&self, _sample_rate: u32) -> Result<Arc<dyn AudioOutput>, PlaybackError> {
        if self.fail {
            return Err(PlaybackError::Device("no speaker".to_string()));
        }
        Ok(self.output.clone())
    }
}

/// A microphone the test feeds by hand.
#[derive(Default)]
pub struct FakeInput {
    pub fail: bool,
    pub hold: bool,
    pub acquired: AtomicUsize,
    pub released: Arc<AtomicUsize>,
    pub frames: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
}

impl FakeInput {
    /// Delivers one captured frame, as the device callback would.
    pub async fn push(&self, samples: Vec<f32>) -> bool {
        let sender = self.frames.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(samples).await.is_ok(),
            None => false,
        }
    }
}

struct FakeCapture {
    released: Arc<AtomicUsize>,
    frames: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
    closed: bool,
}

impl CaptureStream for FakeCapture {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.frames.lock().unwrap().take();
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AudioInput for FakeInput {
    async fn acquire(
        &self,
        _sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureStream>, SessionError> {
        if self.hold {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(SessionError::Acquisition("permission denied".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        *self.frames.lock().unwrap() = Some(frames);
        Ok(Box::new(FakeCapture {
            released: self.released.clone(),
            frames: self.frames.clone(),
            closed: false,
        }))
    }
}

/// The provider's end of a fake connection.
pub struct RemoteEnd {
    pub from_client: mpsc::Receiver<ClientEvent>,
    pub to_client: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
pub struct FakeTransport {
    pub fail: bool,
    pub hold: bool,
    pub connects: AtomicUsize,
    pub setup: Mutex<Option<SessionSetup>>,
    pub remote: Mutex<Option<RemoteEnd>>,
}

impl FakeTransport {
    pub fn take_remote(&self) -> Option<RemoteEnd> {
        self.remote.lock().unwrap().take()
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn connect(&self, setup: SessionSetup) -> Result<RealtimeConnection, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.hold {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(SessionError::Connection("handshake refused".to_string()));
        }
        *self.setup.lock().unwrap() = Some(setup);
        let (outbound, from_client) = mpsc::channel(64);
        let (to_client, inbound) = mpsc::channel(64);
        *self.remote.lock().unwrap() = Some(RemoteEnd {
            from_client,
            to_client,
        });
        Ok(RealtimeConnection { outbound, inbound })
    }
}

/// Records everything the tools write, optionally slowly.
#[derive(Default)]
pub struct RecordingStore {
    pub delay: Option<Duration>,
    pub tasks: Mutex<Vec<NewTask>>,
    pub appointments: Mutex<Vec<Appointment>>,
}

#[async_trait]
impl TaskStore for RecordingStore {
    async fn create(&self, task: NewTask) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

#[async_trait]
impl AppointmentStore for RecordingStore {
    async fn create(&self, appointment: Appointment) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.appointments.lock().unwrap().push(appointment);
        Ok(())
    }
}

/// One set of fakes wired into [`SessionDeps`].
pub struct Fakes {
    pub transport: Arc<FakeTransport>,
    pub input: Arc<FakeInput>,
    pub output: Arc<FakeOutput>,
    pub store: Arc<RecordingStore>,
    pub output_fails: bool,
}

impl Fakes {
    pub fn new(transport: FakeTransport, input: FakeInput, store: RecordingStore) -> Self {
        Self {
            transport: Arc::new(transport),
            input: Arc::new(input),
            output: Arc::new(FakeOutput::default()),
            store: Arc::new(store),
            output_fails: false,
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            transport: self.transport.clone(),
            input: self.input.clone(),
            output: Arc::new(FakeOutputDevice {
                output: self.output.clone(),
                fail: self.output_fails,
            }),
            tasks: self.store.clone(),
            appointments: self.store.clone(),
        }
    }
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new(
            FakeTransport::default(),
            FakeInput::default(),
            RecordingStore::default(),
        )
    }
}
