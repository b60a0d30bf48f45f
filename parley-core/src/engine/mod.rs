//! `CallEngine`: drives one voice call from first word to hang-up.
//!
//! ## Lifecycle
//!
//! ```text
//! CallEngine::start()   → encoding negotiated, mic open, recording, Listening
//!     ├─► (turn loop runs until EndCall)
//!     ├─► end_call()    → Ended, all resources released, phase = Ended
//!     └─► score()       → loop stopped, phase = Scoring → Completed
//! ```
//!
//! ## Ownership
//!
//! One tokio task, the call loop, owns the turn state, the capture session,
//! the speech-end detector and the playback slot. Nothing else mutates
//! them. The loop wakes on two sources:
//!
//! - an analyser tick (`frame_interval`), which pumps audio through the
//!   detector and may raise `SpeechEnded`;
//! - an inbox of `TurnEvent`s posted by stage tasks, the playback waiter,
//!   and `end_call()`.
//!
//! Every event goes through `turn::transition`; the loop only executes the
//! commands it returns. Stage tasks check the pipeline's cancellation flag
//! before posting, and the loop aborts them on `ReleaseAll`.

pub mod pipeline;
pub mod turn;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{
    audio::{
        encoding::default_priority, AnalyserConfig, AudioCaptureSession, CaptureConstraints,
        EncoderRegistry, MicrophoneSource,
    },
    error::{ParleyError, PipelineStage, Result},
    ipc::events::{CallStatus, CallStatusEvent, TranscriptEvent},
    lifecycle::{ResourceKind, ResourceLedger, Slot},
    playback::{AudioOutput, PlaybackHandle, SynthesizedAudio},
    services::{DialogueService, MessageLog, SpeechRecognizer, SpeechSynthesizer},
    session::{CallSession, DialogueTurn, ScoreReport, SessionPhase},
    vad::{
        endpoint::DEFAULT_DEBOUNCE_FRAMES,
        level::{DEFAULT_SILENCE_FLOOR_DB, DEFAULT_SPEECH_THRESHOLD_DB},
        LevelVad, SpeechEndDetector, VadEvent,
    },
};

pub use pipeline::{DiagnosticsSnapshot, DialoguePipeline, PipelineDiagnostics};
pub use turn::{TurnCommand, TurnEvent, TurnState};

/// Broadcast channel capacity for slow status/transcript consumers.
const BROADCAST_CAP: usize = 256;

/// Log the VAD level once every this many frames.
const LEVEL_LOG_EVERY: usize = 50;

/// Configuration for `CallEngine`.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Level (dB re full scale) above which a frame counts as speech. Default: -13.
    pub speech_threshold_db: f32,
    /// Level below which a frame counts as silence. Default: -22.
    pub silence_floor_db: f32,
    /// Consecutive silent frames, after speech, that end the caller's turn.
    /// Default: 300.
    pub silence_debounce_frames: u32,
    /// Analyser tick cadence. Default: 16 ms.
    pub frame_interval: Duration,
    /// Delay from call start until scoring may be requested. Default: 60 s.
    pub scoring_delay: Duration,
    pub analyser: AnalyserConfig,
    /// Recording encodings in preference order.
    pub encoding_priority: Vec<String>,
    pub constraints: CaptureConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            speech_threshold_db: DEFAULT_SPEECH_THRESHOLD_DB,
            silence_floor_db: DEFAULT_SILENCE_FLOOR_DB,
            silence_debounce_frames: DEFAULT_DEBOUNCE_FRAMES,
            frame_interval: Duration::from_millis(16),
            scoring_delay: Duration::from_secs(60),
            analyser: AnalyserConfig::default(),
            encoding_priority: default_priority(),
            constraints: CaptureConstraints::default(),
        }
    }
}

/// The external collaborators of a call.
#[derive(Clone)]
pub struct CallServices {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub dialogue: Arc<dyn DialogueService>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub output: Arc<dyn AudioOutput>,
    pub log: Arc<dyn MessageLog>,
}

// ── Status board ────────────────────────────────────────────────────────────

struct BoardInner {
    state: TurnState,
    phase: SessionPhase,
    ended_after: Option<Duration>,
}

/// Read-side mirror of the call for presentation code. Written by the call
/// loop and the scoring path, never by subscribers.
struct StatusBoard {
    inner: Mutex<BoardInner>,
    scoring_available: AtomicBool,
    started: Instant,
    tx: broadcast::Sender<CallStatusEvent>,
}

impl StatusBoard {
    fn new(tx: broadcast::Sender<CallStatusEvent>) -> Self {
        Self {
            inner: Mutex::new(BoardInner {
                state: TurnState::Listening,
                phase: SessionPhase::Active,
                ended_after: None,
            }),
            scoring_available: AtomicBool::new(false),
            started: Instant::now(),
            tx,
        }
    }

    fn snapshot(&self) -> CallStatus {
        let inner = self.inner.lock();
        let elapsed = inner.ended_after.unwrap_or_else(|| self.started.elapsed());
        CallStatus::new(
            inner.state,
            inner.phase,
            elapsed.as_millis() as u64,
            self.scoring_available.load(Ordering::Acquire),
        )
    }

    fn publish(&self, detail: Option<String>) {
        let _ = self.tx.send(CallStatusEvent {
            status: self.snapshot(),
            detail,
        });
    }

    /// `detail` explains a recovery, e.g. the stage error that sent the
    /// call back to Listening.
    fn set_state(&self, state: TurnState, detail: Option<String>) {
        {
            let mut inner = self.inner.lock();
            inner.state = state;
            if state == TurnState::Ended && inner.ended_after.is_none() {
                inner.ended_after = Some(self.started.elapsed());
            }
        }
        self.publish(detail);
    }

    fn phase(&self) -> SessionPhase {
        self.inner.lock().phase
    }

    fn set_phase(&self, phase: SessionPhase, detail: Option<String>) {
        self.inner.lock().phase = phase;
        self.publish(detail);
    }

    /// Active → Ended, leaving Scoring/Completed alone.
    fn finish(&self, detail: Option<String>) {
        {
            let mut inner = self.inner.lock();
            inner.state = TurnState::Ended;
            if inner.ended_after.is_none() {
                inner.ended_after = Some(self.started.elapsed());
            }
            if inner.phase == SessionPhase::Active {
                inner.phase = SessionPhase::Ended;
            }
        }
        self.publish(detail);
    }

    /// Atomically move into Scoring from Active or a scoreless Ended.
    fn begin_scoring(&self) -> Result<()> {
        if !self.scoring_available.load(Ordering::Acquire) {
            return Err(ParleyError::ScoringUnavailable);
        }
        {
            let mut inner = self.inner.lock();
            match inner.phase {
                SessionPhase::Active | SessionPhase::Ended => inner.phase = SessionPhase::Scoring,
                other => return Err(ParleyError::InvalidPhase(other.to_string())),
            }
        }
        self.publish(None);
        Ok(())
    }

    fn make_scoring_available(&self) {
        if !self.scoring_available.swap(true, Ordering::AcqRel) {
            info!("scoring available");
            self.publish(None);
        }
    }
}

// ── Engine handle ───────────────────────────────────────────────────────────

/// Handle to a running call.
///
/// `CallEngine` is `Send + Sync`; wrap it in an `Arc` to share between a
/// command handler and event-forwarding tasks. Dropping it ends the call.
pub struct CallEngine {
    session: CallSession,
    board: Arc<StatusBoard>,
    pipeline: Arc<DialoguePipeline>,
    inbox: mpsc::UnboundedSender<TurnEvent>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    scoring_timer: JoinHandle<()>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    ledger: Arc<ResourceLedger>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl CallEngine {
    /// Open capture, start the first recording and spawn the call loop.
    ///
    /// Must be called from inside a tokio runtime.
    ///
    /// # Errors
    /// Fatal capture errors: `EncodingNegotiation`, `DeviceAccess`,
    /// `NoInputDevice`. Nothing is left running when this fails.
    pub fn start(
        session: CallSession,
        config: CallConfig,
        services: CallServices,
        microphone: &dyn MicrophoneSource,
        encoders: &EncoderRegistry,
    ) -> Result<Self> {
        let call_span = info_span!("call", session_id = %session.id);
        let _enter = call_span.enter();

        let ledger = ResourceLedger::new();
        let mut capture = AudioCaptureSession::open(
            microphone,
            &config.constraints,
            encoders,
            &config.encoding_priority,
            config.analyser.clone(),
            Arc::clone(&ledger),
        )?;
        capture.start(TurnState::Listening)?;

        if let Err(e) = services.log.start_session(&session) {
            warn!("failed to record session start: {e}");
        }

        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let board = Arc::new(StatusBoard::new(status_tx));
        let pipeline = Arc::new(DialoguePipeline::new(
            session.clone(),
            Arc::clone(&services.recognizer),
            Arc::clone(&services.dialogue),
            Arc::clone(&services.synthesizer),
            Arc::clone(&services.log),
            transcript_tx.clone(),
            Arc::clone(&diagnostics),
        ));

        let detector = SpeechEndDetector::new(
            Box::new(LevelVad::new(
                config.speech_threshold_db,
                config.silence_floor_db,
            )),
            config.silence_debounce_frames,
        );

        let (inbox, rx) = mpsc::unbounded_channel();
        let call_loop = CallLoop {
            state: TurnState::Listening,
            capture,
            detector,
            playback: Slot::new(ResourceKind::Playback, Arc::clone(&ledger)),
            output: Arc::clone(&services.output),
            pipeline: Arc::clone(&pipeline),
            board: Arc::clone(&board),
            diagnostics: Arc::clone(&diagnostics),
            inbox: inbox.clone(),
            tasks: Vec::new(),
            turn: 0,
            call_span: call_span.clone(),
            turn_span: Span::none(),
            fatal: None,
        };
        let loop_task = tokio::spawn(
            call_loop
                .run(rx, config.frame_interval)
                .instrument(call_span.clone()),
        );

        let timer_board = Arc::clone(&board);
        let delay = config.scoring_delay;
        let scoring_timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timer_board.make_scoring_available();
        });

        info!(
            persona_id = %session.scenario.persona_id,
            voice_id = %session.voice_id,
            "call started, listening"
        );
        board.publish(None);

        Ok(Self {
            session,
            board,
            pipeline,
            inbox,
            loop_task: Mutex::new(Some(loop_task)),
            scoring_timer,
            transcript_tx,
            ledger,
            diagnostics,
        })
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Hang up. Idempotent; returns once every call resource is released.
    pub async fn end_call(&self) -> Result<()> {
        self.stop_loop().await;
        Ok(())
    }

    /// Stop the turn loop and score the conversation so far.
    ///
    /// # Errors
    /// - `ScoringUnavailable` before `scoring_delay` has elapsed.
    /// - `InvalidPhase` while scoring is running or after it completed.
    /// - `Network` if the scoring call fails; the phase returns to Ended and
    ///   the call may be scored again.
    pub async fn score(&self) -> Result<ScoreReport> {
        self.board.begin_scoring()?;
        self.stop_loop().await;

        match self.pipeline.score().await {
            Ok(report) => {
                self.board.set_phase(SessionPhase::Completed, None);
                Ok(report)
            }
            Err(e) => {
                error!("scoring failed: {e}");
                self.board
                    .set_phase(SessionPhase::Ended, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> CallStatus {
        self.board.snapshot()
    }

    pub fn phase(&self) -> SessionPhase {
        self.board.phase()
    }

    /// Turns appended so far, oldest first.
    pub fn history(&self) -> Vec<DialogueTurn> {
        self.pipeline.history()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<CallStatusEvent> {
        self.board.tx.subscribe()
    }

    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript_tx.subscribe()
    }

    /// Snapshot of call counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Acquire/release counts for every resource this call touched.
    pub fn resource_ledger(&self) -> Arc<ResourceLedger> {
        Arc::clone(&self.ledger)
    }

    async fn stop_loop(&self) {
        self.pipeline.cancel();
        let _ = self.inbox.send(TurnEvent::EndCall);
        let task = self.loop_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("call loop terminated abnormally: {e}");
            }
        }
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        self.scoring_timer.abort();
        self.pipeline.cancel();
        let _ = self.inbox.send(TurnEvent::EndCall);
    }
}

// ── Call loop ───────────────────────────────────────────────────────────────

struct CallLoop {
    state: TurnState,
    capture: AudioCaptureSession,
    detector: SpeechEndDetector,
    playback: Slot<PlaybackHandle>,
    output: Arc<dyn AudioOutput>,
    pipeline: Arc<DialoguePipeline>,
    board: Arc<StatusBoard>,
    diagnostics: Arc<PipelineDiagnostics>,
    inbox: mpsc::UnboundedSender<TurnEvent>,
    /// Stage and playback-waiter tasks, aborted on release.
    tasks: Vec<JoinHandle<()>>,
    turn: u64,
    call_span: Span,
    turn_span: Span,
    /// Error that forced the call to end, reported in the final status.
    fatal: Option<String>,
}

impl CallLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TurnEvent>, frame_interval: Duration) {
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.state != TurnState::Ended {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(event) => self.dispatch(event),
                    None => self.dispatch(TurnEvent::EndCall),
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }

        self.release_all();
        self.board.finish(self.fatal.take());
        info!(turns = self.turn, "call ended");
    }

    fn on_tick(&mut self) {
        let frame = match self.capture.pump() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let frames = PipelineDiagnostics::bump(&self.diagnostics.frames_analysed);
        let armed = self.capture.is_recording() && self.state == TurnState::Listening;
        let observation = self.detector.observe(&frame, armed);
        if observation.decision.is_speech() {
            PipelineDiagnostics::bump(&self.diagnostics.speech_frames);
        }
        if frames % LEVEL_LOG_EVERY == 0 {
            debug!(
                level_db = observation.level_db,
                silence_run = self.detector.silence_run(),
                speech_observed = self.detector.speech_observed(),
                "vad level"
            );
        }
        if observation.event == Some(VadEvent::SpeechEnded) {
            self.dispatch(TurnEvent::SpeechEnded);
        }
    }

    fn dispatch(&mut self, event: TurnEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            if matches!(event, TurnEvent::PlaybackEnded | TurnEvent::PlaybackFailed(_)) {
                self.playback.release();
            }
            let name = event.name();
            let detail = event.failure();
            let step = turn::transition(self.state, event);
            if step.is_ignored() {
                debug!(state = %self.state, event = name, "event ignored");
                continue;
            }
            if let Some(next) = step.next {
                if next != self.state {
                    info!(from = %self.state, to = %next, event = name, "turn state changed");
                    self.state = next;
                    self.board.set_state(next, detail);
                }
            }
            for command in step.commands {
                if let Some(follow_up) = self.execute(command) {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    fn execute(&mut self, command: TurnCommand) -> Option<TurnEvent> {
        match command {
            TurnCommand::StopRecording => {
                self.turn += 1;
                PipelineDiagnostics::bump(&self.diagnostics.turns_started);
                self.turn_span = info_span!(parent: &self.call_span, "turn", turn = self.turn);
                match self.capture.stop() {
                    Ok(recording) => {
                        let bytes = recording.len();
                        debug!(parent: &self.turn_span, bytes, "recording finalised");
                        Some(TurnEvent::RecordingReady(recording))
                    }
                    Err(e) if e.is_fatal() => {
                        error!(parent: &self.turn_span, "capture failed while stopping: {e}");
                        self.fatal = Some(e.to_string());
                        Some(TurnEvent::EndCall)
                    }
                    Err(e) => {
                        warn!(parent: &self.turn_span, "could not finalise recording: {e}");
                        Some(TurnEvent::StageFailed(
                            PipelineStage::Transcribe,
                            e.to_string(),
                        ))
                    }
                }
            }
            TurnCommand::Transcribe(recording) => {
                let pipeline = Arc::clone(&self.pipeline);
                self.spawn_stage(PipelineStage::Transcribe, async move {
                    pipeline
                        .transcribe(&recording)
                        .await
                        .map(TurnEvent::TranscriptReady)
                })
            }
            TurnCommand::Respond(transcript) => {
                let pipeline = Arc::clone(&self.pipeline);
                self.spawn_stage(PipelineStage::Respond, async move {
                    pipeline
                        .respond(&transcript)
                        .await
                        .map(TurnEvent::ResponseReady)
                })
            }
            TurnCommand::Synthesize(text) => {
                let pipeline = Arc::clone(&self.pipeline);
                self.spawn_stage(PipelineStage::Synthesize, async move {
                    pipeline.synthesize(&text).await.map(TurnEvent::AudioReady)
                })
            }
            TurnCommand::Play(audio) => self.play(audio),
            TurnCommand::StartRecording => {
                self.detector.reset();
                match self.capture.start(self.state) {
                    Ok(()) => None,
                    Err(e) => {
                        self.fatal = Some(e.to_string());
                        error!("cannot restart capture: {e}");
                        Some(TurnEvent::EndCall)
                    }
                }
            }
            TurnCommand::ReleaseAll => {
                self.release_all();
                None
            }
        }
    }

    fn spawn_stage<F>(&mut self, stage: PipelineStage, work: F) -> Option<TurnEvent>
    where
        F: Future<Output = Result<TurnEvent>> + Send + 'static,
    {
        let guard = match self.pipeline.begin() {
            Ok(guard) => guard,
            Err(e) => {
                error!(%stage, "cannot start stage: {e}");
                return Some(TurnEvent::StageFailed(stage, e.to_string()));
            }
        };
        let inbox = self.inbox.clone();
        let pipeline = Arc::clone(&self.pipeline);

        let task = tokio::spawn(
            async move {
                let outcome = work.await;
                drop(guard);
                if pipeline.is_cancelled() {
                    debug!(%stage, "call ended; dropping stage result");
                    return;
                }
                let event = match outcome {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(%stage, "stage failed: {e}");
                        TurnEvent::StageFailed(stage, e.to_string())
                    }
                };
                let _ = inbox.send(event);
            }
            .instrument(self.turn_span.clone()),
        );
        self.track(task);
        None
    }

    fn play(&mut self, audio: SynthesizedAudio) -> Option<TurnEvent> {
        let span = self.turn_span.clone();
        let _enter = span.enter();
        let playback = match self.output.play(audio) {
            Ok(playback) => playback,
            Err(e) => {
                PipelineDiagnostics::bump(&self.diagnostics.playback_failures);
                warn!("playback could not start: {e}");
                return Some(TurnEvent::PlaybackFailed(e.to_string()));
            }
        };
        if let Err(e) = self.playback.acquire(playback.handle) {
            self.fatal = Some(e.to_string());
            error!("{e}");
            return Some(TurnEvent::EndCall);
        }
        PipelineDiagnostics::bump(&self.diagnostics.playbacks_started);

        let inbox = self.inbox.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let diagnostics = Arc::clone(&self.diagnostics);
        let finished = playback.finished;
        let task = tokio::spawn(
            async move {
                let event = match finished.await {
                    Ok(Ok(())) => TurnEvent::PlaybackEnded,
                    Ok(Err(e)) => {
                        PipelineDiagnostics::bump(&diagnostics.playback_failures);
                        TurnEvent::PlaybackFailed(e.to_string())
                    }
                    Err(_) => {
                        PipelineDiagnostics::bump(&diagnostics.playback_failures);
                        TurnEvent::PlaybackFailed("playback dropped without finishing".into())
                    }
                };
                if pipeline.is_cancelled() {
                    return;
                }
                let _ = inbox.send(event);
            }
            .instrument(span.clone()),
        );
        self.track(task);
        None
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn fail(&mut self, err: ParleyError) {
        error!("capture failed: {err}");
        self.fatal = Some(err.to_string());
        self.dispatch(TurnEvent::EndCall);
    }

    /// Cancel pending work and release every resource. Idempotent.
    fn release_all(&mut self) {
        self.pipeline.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.playback.release();
        self.capture.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_calibration() {
        let config = CallConfig::default();
        assert_eq!(config.speech_threshold_db, -13.0);
        assert_eq!(config.silence_floor_db, -22.0);
        assert_eq!(config.silence_debounce_frames, 300);
        assert_eq!(config.frame_interval, Duration::from_millis(16));
        assert_eq!(config.scoring_delay, Duration::from_secs(60));
        assert_eq!(config.encoding_priority.last().map(String::as_str), Some("audio/wav"));
        assert!(config.constraints.echo_cancellation);
    }

    #[tokio::test]
    async fn board_freezes_elapsed_and_gates_scoring() {
        let (tx, _) = broadcast::channel(8);
        let board = StatusBoard::new(tx);
        assert!(matches!(
            board.begin_scoring(),
            Err(ParleyError::ScoringUnavailable)
        ));

        board.finish(None);
        let frozen = board.snapshot();
        assert_eq!(frozen.state, TurnState::Ended);
        assert_eq!(frozen.phase, SessionPhase::Ended);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(board.snapshot().elapsed_ms, frozen.elapsed_ms);

        board.make_scoring_available();
        board.begin_scoring().unwrap();
        assert_eq!(board.phase(), SessionPhase::Scoring);
        assert!(matches!(
            board.begin_scoring(),
            Err(ParleyError::InvalidPhase(_))
        ));
    }
}
