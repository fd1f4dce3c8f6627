//! The voice session state machine.
//!
//! A [`SessionController`] owns one remote connection and the devices feeding
//! it. Start-up runs on the caller's task and waits on the two suspension
//! points (microphone, network); once open, a single driver task owns the
//! playback scheduler and the connection halves and reacts to everything
//! through one `select!` loop. Closing from any trigger funnels into the same
//! cancellation token, so teardown happens exactly once.

use crate::{
    audio_io::{AudioInput, AudioOutput, AudioOutputDevice, CaptureStream, UnavailableOutput},
    capture::CaptureProducer,
    codec::{self, AudioChunk, CAPTURE_FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE},
    error::SessionError,
    generic_types::{ClientEvent, ServerEvent, SessionSetup},
    playback::PlaybackScheduler,
    realtime_api::RealtimeTransport,
    schedule::{AppointmentStore, ContextSnapshot, TaskStore},
    tools::{Dispatched, ToolCall, ToolDispatcher, ToolResponse},
    transcript::{SessionStatus, Speaker, TRANSCRIPT_CAPACITY, TranscriptLog},
};
use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::{self, JoinError, JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether captured audio may still flow to the remote side.
    pub fn is_streaming(self) -> bool {
        matches!(self, SessionState::Open | SessionState::Active)
    }
}

/// What ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    User,
    Remote,
    Error,
    EndSession,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per outbound chunk.
    pub frame_size: usize,
    pub voice: String,
    /// System instruction template, see [`ContextSnapshot::render`].
    pub prompt_template: String,
    /// Delay between answering `endSession` and closing, so trailing audio
    /// can finish.
    pub end_session_grace: Duration,
    /// How long teardown waits for running tool handlers.
    pub tool_drain_timeout: Duration,
    pub channel_capacity: usize,
    pub transcript_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: CAPTURE_FRAME_SIZE,
            voice: "Charon".to_string(),
            prompt_template: String::new(),
            end_session_grace: Duration::from_millis(1500),
            tool_drain_timeout: Duration::from_secs(5),
            channel_capacity: 64,
            transcript_capacity: TRANSCRIPT_CAPACITY,
        }
    }
}

/// The collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn RealtimeTransport>,
    pub input: Arc<dyn AudioInput>,
    pub output: Arc<dyn AudioOutputDevice>,
    pub tasks: Arc<dyn TaskStore>,
    pub appointments: Arc<dyn AppointmentStore>,
}

type ClosedCallback = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    id: Uuid,
    config: SessionConfig,
    deps: SessionDeps,
    started: AtomicBool,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    log: TranscriptLog,
    on_closed: Mutex<Option<ClosedCallback>>,
}

/// Handle to one voice session. Clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// `on_closed` runs exactly once, when the session reaches
    /// [`SessionState::Closed`].
    pub fn new(
        config: SessionConfig,
        deps: SessionDeps,
        on_closed: impl FnOnce() + Send + 'static,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let log = TranscriptLog::new(config.transcript_capacity);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                config,
                deps,
                started: AtomicBool::new(false),
                state,
                cancel: CancellationToken::new(),
                close_reason: Mutex::new(None),
                log,
                on_closed: Mutex::new(Some(Box::new(on_closed))),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn transcript(&self) -> &TranscriptLog {
        &self.shared.log
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.lock_reason()
    }

    /// Acquires the microphone, opens the speaker and connects.
    ///
    /// Only the first call does anything; later calls return `Ok(())`
    /// immediately. Fails with [`SessionError::Cancelled`] if the session is
    /// closed before the connection is up.
    pub async fn start(&self, snapshot: ContextSnapshot) -> Result<(), SessionError> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            debug!("Duplicate start ignored");
            return Ok(());
        }
        if !self.transition(&[SessionState::Idle], SessionState::Connecting) {
            return Err(SessionError::Cancelled);
        }
        let config = &self.shared.config;
        let deps = &self.shared.deps;
        let cancel = &self.shared.cancel;
        self.shared.log.set_status(SessionStatus::Connecting);

        let (frames_tx, frames_rx) = mpsc::channel(config.channel_capacity);
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = deps.input.acquire(config.input_sample_rate, frames_tx) => Some(acquired),
        };
        let mut capture = match acquired {
            None => {
                info!("Session closed while acquiring the microphone");
                self.finish();
                return Err(SessionError::Cancelled);
            }
            Some(Err(e)) => {
                error!(error = %e, "Could not acquire the microphone");
                self.shared.log.set_status(SessionStatus::MicrophoneUnavailable);
                self.finish();
                return Err(e);
            }
            Some(Ok(capture)) => capture,
        };

        let output: Arc<dyn AudioOutput> = match deps.output.open(config.output_sample_rate).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Speaker unavailable; assistant audio will be silent");
                Arc::new(UnavailableOutput::new(e.to_string()))
            }
        };
        if cancel.is_cancelled() {
            info!("Session closed while opening the speaker");
            release(capture.as_mut(), output.as_ref());
            self.finish();
            return Err(SessionError::Cancelled);
        }

        let setup = SessionSetup {
            instructions: snapshot.render(&config.prompt_template),
            voice: config.voice.clone(),
            tools: ToolDispatcher::declarations(),
            input_sample_rate: config.input_sample_rate,
        };
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            connected = deps.transport.connect(setup) => Some(connected),
        };
        let connection = match connected {
            None => {
                info!("Session closed while connecting");
                release(capture.as_mut(), output.as_ref());
                self.finish();
                return Err(SessionError::Cancelled);
            }
            Some(Err(e)) => {
                error!(error = %e, "Could not connect to the voice service");
                self.shared.log.set_status(SessionStatus::ConnectionError);
                release(capture.as_mut(), output.as_ref());
                self.finish();
                return Err(e);
            }
            Some(Ok(connection)) => connection,
        };
        if cancel.is_cancelled() {
            info!("Session closed right after connecting");
            let _ = connection.outbound.send(ClientEvent::Close).await;
            release(capture.as_mut(), output.as_ref());
            self.finish();
            return Err(SessionError::Cancelled);
        }

        self.transition(&[SessionState::Connecting], SessionState::Open);
        self.shared.log.set_status(SessionStatus::Listening);

        let (chunks_tx, chunks_rx) = mpsc::channel(config.channel_capacity);
        let producer = CaptureProducer::new(config.frame_size, config.input_sample_rate);
        let capture_task = tokio::spawn(
            producer
                .run(frames_rx, chunks_tx, self.subscribe_state())
                .in_current_span(),
        );
        let driver = Driver {
            controller: self.clone(),
            capture,
            capture_task,
            chunks: chunks_rx,
            capture_open: true,
            outbound: connection.outbound,
            inbound: connection.inbound,
            scheduler: PlaybackScheduler::new(output),
            dispatcher: ToolDispatcher::new(deps.tasks.clone(), deps.appointments.clone()),
            tools: JoinSet::new(),
            pending: HashMap::new(),
            utterance: None,
        };
        tokio::spawn(driver.run().in_current_span());
        Ok(())
    }

    /// Requests the session to close. Safe to call any number of times, from
    /// any state; only the first call decides the close reason.
    pub fn close(&self) {
        self.close_with(CloseReason::User);
    }

    /// Resolves once the session has reached [`SessionState::Closed`].
    pub async fn wait_closed(&self) {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    fn close_with(&self, reason: CloseReason) {
        {
            let mut requested = self.lock_reason();
            if requested.is_none() {
                *requested = Some(reason);
            }
        }
        // Never started: nothing is held, so close right here.
        if self.transition(&[SessionState::Idle], SessionState::Closed) {
            self.shared.log.set_status(SessionStatus::Ended);
            self.fire_on_closed();
            return;
        }
        self.shared.cancel.cancel();
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let changed = self.shared.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(state = ?to, "Session state changed");
        }
        changed
    }

    fn finish(&self) {
        let log = &self.shared.log;
        if !matches!(
            log.status(),
            SessionStatus::MicrophoneUnavailable | SessionStatus::ConnectionError
        ) {
            log.set_status(SessionStatus::Ended);
        }
        self.shared.state.send_replace(SessionState::Closed);
        info!(reason = ?self.close_reason(), "Session closed");
        self.fire_on_closed();
    }

    fn fire_on_closed(&self) {
        let callback = self
            .shared
            .on_closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn lock_reason(&self) -> std::sync::MutexGuard<'_, Option<CloseReason>> {
        self.shared
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn release(capture: &mut dyn CaptureStream, output: &dyn AudioOutput) {
    capture.close();
    output.close();
}

/// Owns everything a running session touches.
struct Driver {
    controller: SessionController,
    capture: Box<dyn CaptureStream>,
    capture_task: JoinHandle<usize>,
    chunks: mpsc::Receiver<AudioChunk>,
    capture_open: bool,
    outbound: mpsc::Sender<ClientEvent>,
    inbound: mpsc::Receiver<ServerEvent>,
    scheduler: PlaybackScheduler,
    dispatcher: ToolDispatcher,
    tools: JoinSet<Dispatched>,
    /// Calls not yet answered, by the task answering them.
    pending: HashMap<task::Id, (String, String)>,
    /// Transcript fragments of the utterance in progress.
    utterance: Option<(Speaker, String)>,
}

impl Driver {
    async fn run(mut self) {
        let shared = self.controller.shared.clone();
        let mut grace: Option<Instant> = None;
        info!("Voice session running");

        let reason = loop {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => {
                    break self.controller.close_reason().unwrap_or(CloseReason::User);
                }
                _ = tokio::time::sleep_until(grace.unwrap_or_else(Instant::now)), if grace.is_some() => {
                    info!("End of session requested by the assistant");
                    break CloseReason::EndSession;
                }
                Some(joined) = self.tools.join_next_with_id(), if !self.tools.is_empty() => {
                    if self.on_tool_finished(joined).await && grace.is_none() {
                        grace = Some(Instant::now() + shared.config.end_session_grace);
                    }
                }
                chunk = self.chunks.recv(), if self.capture_open => match chunk {
                    Some(chunk) => {
                        self.controller.transition(&[SessionState::Open], SessionState::Active);
                        if self.outbound.send(ClientEvent::Audio(chunk)).await.is_err() {
                            warn!("Connection gone while sending audio");
                            break CloseReason::Remote;
                        }
                    }
                    None => {
                        debug!("Capture stream ended");
                        self.capture_open = false;
                    }
                },
                event = self.inbound.recv() => {
                    let Some(event) = event else {
                        info!("Voice service connection ended");
                        break CloseReason::Remote;
                    };
                    if let ControlFlow::Break(reason) = self.on_server_event(event) {
                        break reason;
                    }
                }
            }
        };

        self.teardown(reason).await;
    }

    fn on_server_event(&mut self, event: ServerEvent) -> ControlFlow<CloseReason> {
        match event {
            ServerEvent::Audio(data) => {
                self.controller.transition(&[SessionState::Open], SessionState::Active);
                let config = &self.controller.shared.config;
                match codec::decode(&data, config.output_sample_rate, 1) {
                    Ok(buffer) => {
                        if let Err(e) = self.scheduler.enqueue(buffer) {
                            warn!(error = %e, "Dropping assistant audio");
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed audio chunk"),
                }
            }
            ServerEvent::Transcript { speaker, text } => self.on_transcript(speaker, &text),
            ServerEvent::ToolCalls(calls) => {
                for call in calls {
                    self.spawn_tool(call);
                }
            }
            ServerEvent::Interrupted => {
                let stopped = self.scheduler.interrupt();
                info!(stopped, "User interrupted the assistant");
                self.flush_utterance();
            }
            ServerEvent::TurnComplete => self.flush_utterance(),
            ServerEvent::ToolCallCancellation(ids) => {
                // Answered anyway once their handlers finish.
                info!(?ids, "Voice service cancelled tool calls");
            }
            ServerEvent::GoingAway => warn!("Voice service will close the connection soon"),
            ServerEvent::Closed { reason } => {
                info!(?reason, "Voice service closed the connection");
                return ControlFlow::Break(CloseReason::Remote);
            }
            ServerEvent::Error(message) => {
                error!(%message, "Voice service connection failed");
                self.controller
                    .shared
                    .log
                    .set_status(SessionStatus::ConnectionError);
                return ControlFlow::Break(CloseReason::Error);
            }
        }
        ControlFlow::Continue(())
    }

    fn on_transcript(&mut self, speaker: Speaker, text: &str) {
        match &mut self.utterance {
            Some((current, buffer)) if *current == speaker => buffer.push_str(text),
            _ => {
                self.flush_utterance();
                self.utterance = Some((speaker, text.to_string()));
            }
        }
    }

    fn flush_utterance(&mut self) {
        if let Some((speaker, text)) = self.utterance.take() {
            let text = text.trim();
            if !text.is_empty() {
                self.controller.shared.log.push(speaker, text);
            }
        }
    }

    fn spawn_tool(&mut self, call: ToolCall) {
        debug!(tool = %call.name, call_id = %call.id, "Dispatching tool call");
        let label = (call.id.clone(), call.name.clone());
        let dispatcher = self.dispatcher.clone();
        let outbound = self.outbound.clone();
        let handle = self.tools.spawn(
            async move {
                let dispatched = dispatcher.dispatch(call).await;
                let response = ClientEvent::ToolResponses(vec![dispatched.response.clone()]);
                if outbound.send(response).await.is_err() {
                    warn!(call_id = %dispatched.response.id, "Connection gone before tool response was sent");
                }
                dispatched
            }
            .in_current_span(),
        );
        self.pending.insert(handle.id(), label);
    }

    /// Books a finished tool task. Returns whether it asked to end the session.
    async fn on_tool_finished(&mut self, joined: Result<(task::Id, Dispatched), JoinError>) -> bool {
        match joined {
            Ok((id, dispatched)) => {
                self.pending.remove(&id);
                dispatched.end_session
            }
            Err(e) => {
                // The task never got to answer; answer for it.
                if let Some((call_id, name)) = self.pending.remove(&e.id()) {
                    warn!(%call_id, tool = %name, error = %e, "Tool task did not finish");
                    let response = ToolResponse::failure(call_id, name, "tool call was abandoned");
                    let _ = self
                        .outbound
                        .send(ClientEvent::ToolResponses(vec![response]))
                        .await;
                }
                false
            }
        }
    }

    async fn teardown(mut self, reason: CloseReason) {
        let shared = self.controller.shared.clone();
        self.controller.transition(
            &[SessionState::Open, SessionState::Active],
            SessionState::Closing,
        );
        {
            let mut requested = self.controller.lock_reason();
            if requested.is_none() {
                *requested = Some(reason);
            }
        }
        shared.cancel.cancel();
        info!(?reason, "Closing voice session");

        self.capture.close();
        self.capture_task.abort();

        if !self.tools.is_empty() {
            let drained = tokio::time::timeout(shared.config.tool_drain_timeout, async {
                while let Some(joined) = self.tools.join_next_with_id().await {
                    self.on_tool_finished(joined).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(pending = self.pending.len(), "Tool calls still running at close");
                self.tools.abort_all();
                while let Some(joined) = self.tools.join_next_with_id().await {
                    self.on_tool_finished(joined).await;
                }
            }
        }

        self.flush_utterance();
        self.scheduler.close();
        let _ = self.outbound.send(ClientEvent::Close).await;
        self.controller.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{decode_pcm16, encode},
        testing::{FakeInput, FakeTransport, Fakes, RecordingStore, RemoteEnd, eventually},
        tools::{CREATE_TASK, END_SESSION, SCHEDULE_APPOINTMENT},
    };
    use serde_json::json;
    use std::{collections::HashSet, sync::atomic::AtomicUsize};

    fn test_config() -> SessionConfig {
        SessionConfig {
            frame_size: 4,
            prompt_template: "You help {user_name}.".to_string(),
            end_session_grace: Duration::from_millis(20),
            tool_drain_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot {
            user_name: "Boss".to_string(),
            ..Default::default()
        }
    }

    fn controller(fakes: &Fakes) -> (SessionController, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let controller = SessionController::new(test_config(), fakes.deps(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (controller, closed)
    }

    async fn open(fakes: &Fakes) -> (SessionController, RemoteEnd, Arc<AtomicUsize>) {
        let (controller, closed) = controller(fakes);
        controller.start(snapshot()).await.unwrap();
        let remote = fakes.transport.take_remote().unwrap();
        (controller, remote, closed)
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    /// Next tool response the remote side receives, skipping audio.
    async fn next_responses(remote: &mut RemoteEnd) -> Vec<ToolResponse> {
        loop {
            match remote.from_client.recv().await {
                Some(ClientEvent::ToolResponses(responses)) => return responses,
                Some(ClientEvent::Audio(_)) => continue,
                other => panic!("expected tool responses, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_start_connects_once() {
        let fakes = Fakes::default();
        let (controller, _closed) = controller(&fakes);

        let (first, second) = tokio::join!(controller.start(snapshot()), controller.start(snapshot()));
        assert!(first.is_ok());
        assert!(second.is_ok());

        assert_eq!(fakes.transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fakes.input.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), SessionState::Open);
        assert_eq!(controller.transcript().status(), SessionStatus::Listening);
    }

    #[tokio::test]
    async fn test_setup_carries_prompt_voice_and_tools() {
        let fakes = Fakes::default();
        let (_controller, _remote, _closed) = open(&fakes).await;

        let setup = fakes.transport.setup.lock().unwrap().clone().unwrap();
        assert_eq!(setup.instructions, "You help Boss.");
        assert_eq!(setup.voice, "Charon");
        assert_eq!(setup.input_sample_rate, 16_000);
        let names: Vec<_> = setup.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec![CREATE_TASK, SCHEDULE_APPOINTMENT, END_SESSION]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fakes = Fakes::default();
        let (controller, mut remote, closed) = open(&fakes).await;

        controller.close();
        controller.wait_closed().await;
        controller.close();
        controller.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(controller.close_reason(), Some(CloseReason::User));
        assert_eq!(controller.transcript().status(), SessionStatus::Ended);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(fakes.input.released.load(Ordering::SeqCst), 1);
        assert_eq!(fakes.output.close_count(), 1);
        assert!(matches!(remote.from_client.recv().await, Some(ClientEvent::Close)));
    }

    #[tokio::test]
    async fn test_captured_frames_reach_the_network_in_order() {
        let fakes = Fakes::default();
        let (controller, mut remote, _closed) = open(&fakes).await;

        assert!(fakes.input.push(vec![0.5; 4]).await);
        assert!(fakes.input.push(vec![-0.5; 4]).await);

        for expected in [16384, -16384] {
            match remote.from_client.recv().await {
                Some(ClientEvent::Audio(chunk)) => {
                    assert_eq!(decode_pcm16(&chunk.data).unwrap(), vec![expected; 4]);
                    assert_eq!(chunk.format.mime_type(), "audio/pcm;rate=16000");
                }
                other => panic!("expected audio, got {other:?}"),
            }
        }
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_inbound_audio_plays_gapless_until_interrupted() {
        let fakes = Fakes::default();
        let (controller, remote, _closed) = open(&fakes).await;
        let tenth_of_a_second = encode(&[0i16; 2400]);

        remote.to_client.send(ServerEvent::Audio(tenth_of_a_second.clone())).await.unwrap();
        remote.to_client.send(ServerEvent::Audio(tenth_of_a_second)).await.unwrap();
        eventually(|| fakes.output.started() == 2).await;

        assert_eq!(fakes.output.unit(0), (0.0, 2400));
        let (second_start, _) = fakes.output.unit(1);
        assert!((second_start - 0.1).abs() < 1e-9);

        remote.to_client.send(ServerEvent::Interrupted).await.unwrap();
        eventually(|| fakes.output.is_stopped(0) && fakes.output.is_stopped(1)).await;
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_malformed_audio_is_dropped_and_session_continues() {
        let fakes = Fakes::default();
        let (controller, remote, _closed) = open(&fakes).await;

        remote.to_client.send(ServerEvent::Audio("not base64!".to_string())).await.unwrap();
        remote.to_client.send(ServerEvent::Audio(encode(&[1, 2, 3]))).await.unwrap();
        eventually(|| fakes.output.started() == 1).await;

        assert_eq!(fakes.output.unit(0).1, 3);
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_every_tool_call_in_a_batch_is_answered() {
        let fakes = Fakes::default();
        let (_controller, mut remote, _closed) = open(&fakes).await;

        remote
            .to_client
            .send(ServerEvent::ToolCalls(vec![
                call("a", CREATE_TASK, json!({ "title": "Buy milk" })),
                call(
                    "b",
                    SCHEDULE_APPOINTMENT,
                    json!({ "title": "Dentist", "time": "14:30", "durationMinutes": 45 }),
                ),
                call("c", "summonDragon", json!({})),
            ]))
            .await
            .unwrap();

        let mut ids = Vec::new();
        while ids.len() < 3 {
            for response in next_responses(&mut remote).await {
                ids.push(response.id);
            }
        }
        let unique: HashSet<_> = ids.iter().map(String::as_str).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(unique, HashSet::from(["a", "b", "c"]));
        assert_eq!(fakes.store.tasks.lock().unwrap().len(), 1);
        assert_eq!(fakes.store.appointments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_end_session_answers_before_closing() {
        let fakes = Fakes::default();
        let (controller, mut remote, closed) = open(&fakes).await;

        remote
            .to_client
            .send(ServerEvent::ToolCalls(vec![call("bye", END_SESSION, json!({}))]))
            .await
            .unwrap();

        let responses = next_responses(&mut remote).await;
        assert_eq!(responses[0].id, "bye");
        assert!(!responses[0].is_error());
        assert!(matches!(remote.from_client.recv().await, Some(ClientEvent::Close)));

        controller.wait_closed().await;
        assert_eq!(controller.close_reason(), Some(CloseReason::EndSession));
        assert_eq!(controller.transcript().status(), SessionStatus::Ended);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_close_tears_down() {
        let fakes = Fakes::default();
        let (controller, remote, closed) = open(&fakes).await;

        remote.to_client.send(ServerEvent::Closed { reason: None }).await.unwrap();
        controller.wait_closed().await;

        assert_eq!(controller.close_reason(), Some(CloseReason::Remote));
        assert_eq!(fakes.input.released.load(Ordering::SeqCst), 1);
        assert_eq!(fakes.output.close_count(), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_error_keeps_error_status() {
        let fakes = Fakes::default();
        let (controller, remote, _closed) = open(&fakes).await;

        remote
            .to_client
            .send(ServerEvent::Error("socket reset".to_string()))
            .await
            .unwrap();
        controller.wait_closed().await;

        assert_eq!(controller.close_reason(), Some(CloseReason::Error));
        assert_eq!(controller.transcript().status(), SessionStatus::ConnectionError);
    }

    #[tokio::test]
    async fn test_microphone_failure_never_connects() {
        let fakes = Fakes::new(
            FakeTransport::default(),
            FakeInput {
                fail: true,
                ..Default::default()
            },
            RecordingStore::default(),
        );
        let (controller, closed) = controller(&fakes);

        let err = controller.start(snapshot()).await.unwrap_err();
        assert!(matches!(err, SessionError::Acquisition(_)));
        assert_eq!(fakes.transport.connects.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(
            controller.transcript().status(),
            SessionStatus::MicrophoneUnavailable
        );
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_releases_devices() {
        let fakes = Fakes::new(
            FakeTransport {
                fail: true,
                ..Default::default()
            },
            FakeInput::default(),
            RecordingStore::default(),
        );
        let (controller, closed) = controller(&fakes);

        let err = controller.start(snapshot()).await.unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
        assert_eq!(controller.transcript().status(), SessionStatus::ConnectionError);
        assert_eq!(fakes.input.released.load(Ordering::SeqCst), 1);
        assert_eq!(fakes.output.close_count(), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_while_acquiring_cancels_start() {
        let fakes = Fakes::new(
            FakeTransport::default(),
            FakeInput {
                hold: true,
                ..Default::default()
            },
            RecordingStore::default(),
        );
        let (controller, closed) = controller(&fakes);

        let starting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start(snapshot()).await }
        });
        eventually(|| controller.state() == SessionState::Connecting).await;
        controller.close();

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(fakes.transport.connects.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_while_connecting_releases_microphone() {
        let fakes = Fakes::new(
            FakeTransport {
                hold: true,
                ..Default::default()
            },
            FakeInput::default(),
            RecordingStore::default(),
        );
        let (controller, closed) = controller(&fakes);

        let starting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start(snapshot()).await }
        });
        eventually(|| fakes.transport.connects.load(Ordering::SeqCst) == 1).await;
        controller.close();

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(fakes.input.released.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let fakes = Fakes::default();
        let (controller, closed) = controller(&fakes);

        controller.close();
        assert_eq!(controller.state(), SessionState::Closed);
        assert!(matches!(
            controller.start(snapshot()).await,
            Err(SessionError::Cancelled)
        ));
        assert_eq!(fakes.input.acquired.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_speaker_is_not_fatal() {
        let mut fakes = Fakes::default();
        fakes.output_fails = true;
        let (controller, mut remote, _closed) = open(&fakes).await;

        remote.to_client.send(ServerEvent::Audio(encode(&[0; 480]))).await.unwrap();
        remote
            .to_client
            .send(ServerEvent::ToolCalls(vec![call("t", CREATE_TASK, json!({ "title": "Stretch" }))]))
            .await
            .unwrap();

        let responses = next_responses(&mut remote).await;
        assert_eq!(responses[0].id, "t");
        assert_eq!(fakes.output.started(), 0);
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_slow_tool_does_not_hold_up_audio() {
        let fakes = Fakes::new(
            FakeTransport::default(),
            FakeInput::default(),
            RecordingStore {
                delay: Some(Duration::from_millis(300)),
                ..Default::default()
            },
        );
        let (_controller, mut remote, _closed) = open(&fakes).await;

        remote
            .to_client
            .send(ServerEvent::ToolCalls(vec![call("slow", CREATE_TASK, json!({ "title": "Taxes" }))]))
            .await
            .unwrap();
        remote.to_client.send(ServerEvent::Audio(encode(&[0; 240]))).await.unwrap();

        eventually(|| fakes.output.started() == 1).await;
        assert!(fakes.store.tasks.lock().unwrap().is_empty());

        let responses = next_responses(&mut remote).await;
        assert_eq!(responses[0].id, "slow");
        assert_eq!(fakes.store.tasks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_answers_tools_that_never_finish() {
        let fakes = Fakes::new(
            FakeTransport::default(),
            FakeInput::default(),
            RecordingStore {
                delay: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        );
        let (controller, mut remote, _closed) = open(&fakes).await;

        remote
            .to_client
            .send(ServerEvent::ToolCalls(vec![call("stuck", CREATE_TASK, json!({ "title": "Wait" }))]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.close();

        let responses = next_responses(&mut remote).await;
        assert_eq!(responses[0].id, "stuck");
        assert!(responses[0].is_error());
        assert!(matches!(remote.from_client.recv().await, Some(ClientEvent::Close)));
        controller.wait_closed().await;
    }

    #[tokio::test]
    async fn test_transcript_fragments_form_one_line() {
        let fakes = Fakes::default();
        let (controller, remote, _closed) = open(&fakes).await;

        for fragment in ["You got", " it,", " Boss"] {
            remote
                .to_client
                .send(ServerEvent::Transcript {
                    speaker: Speaker::Assistant,
                    text: fragment.to_string(),
                })
                .await
                .unwrap();
        }
        remote.to_client.send(ServerEvent::TurnComplete).await.unwrap();

        eventually(|| !controller.transcript().entries().is_empty()).await;
        let entries = controller.transcript().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to_string(), "AI: You got it, Boss");
    }
}
