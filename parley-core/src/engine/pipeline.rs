//! Dialogue pipeline: speech recognition → dialogue → speech synthesis,
//! plus the out-of-band scoring call.
//!
//! ## Per-turn stages
//!
//! ```text
//! 1. transcribe(recording)  → transcript ("" = no speech, turn ends here)
//! 2. respond(transcript)    → response text   (user + agent turns appended)
//! 3. synthesize(response)   → SynthesizedAudio
//! ```
//!
//! The engine runs each stage as its own task and feeds the result back
//! through the turn state machine. `begin()` hands out a single in-flight
//! guard so two stage calls can never overlap. A session-scoped
//! cancellation flag is checked before every side effect so results that
//! land after the call ended are dropped.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::Recording,
    error::{ParleyError, PipelineStage, Result},
    ipc::events::TranscriptEvent,
    playback::SynthesizedAudio,
    services::{DialogueService, MessageLog, SpeechRecognizer, SpeechSynthesizer},
    session::{CallSession, DialogueTurn, Role, ScoreReport},
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub frames_analysed: AtomicUsize,
    pub speech_frames: AtomicUsize,
    pub turns_started: AtomicUsize,
    pub empty_transcripts: AtomicUsize,
    pub stage_failures: AtomicUsize,
    pub playbacks_started: AtomicUsize,
    pub playback_failures: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_analysed.store(0, Ordering::Relaxed);
        self.speech_frames.store(0, Ordering::Relaxed);
        self.turns_started.store(0, Ordering::Relaxed);
        self.empty_transcripts.store(0, Ordering::Relaxed);
        self.stage_failures.store(0, Ordering::Relaxed);
        self.playbacks_started.store(0, Ordering::Relaxed);
        self.playback_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_analysed: self.frames_analysed.load(Ordering::Relaxed),
            speech_frames: self.speech_frames.load(Ordering::Relaxed),
            turns_started: self.turns_started.load(Ordering::Relaxed),
            empty_transcripts: self.empty_transcripts.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            playbacks_started: self.playbacks_started.load(Ordering::Relaxed),
            playback_failures: self.playback_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) -> usize {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub frames_analysed: usize,
    pub speech_frames: usize,
    pub turns_started: usize,
    pub empty_transcripts: usize,
    pub stage_failures: usize,
    pub playbacks_started: usize,
    pub playback_failures: usize,
}

/// Held while a stage call is outstanding. Dropping it frees the pipeline.
#[derive(Debug)]
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Outcome of `run_turn`.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    NoSpeech,
    Reply {
        transcript: String,
        response: String,
        audio: SynthesizedAudio,
    },
}

pub struct DialoguePipeline {
    session: CallSession,
    recognizer: Arc<dyn SpeechRecognizer>,
    dialogue: Arc<dyn DialogueService>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    log: Arc<dyn MessageLog>,
    history: Mutex<Vec<DialogueTurn>>,
    in_flight: Arc<AtomicBool>,
    cancelled: AtomicBool,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    seq: AtomicU64,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl DialoguePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: CallSession,
        recognizer: Arc<dyn SpeechRecognizer>,
        dialogue: Arc<dyn DialogueService>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        log: Arc<dyn MessageLog>,
        transcript_tx: broadcast::Sender<TranscriptEvent>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            session,
            recognizer,
            dialogue,
            synthesizer,
            log,
            history: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicBool::new(false)),
            cancelled: AtomicBool::new(false),
            transcript_tx,
            seq: AtomicU64::new(0),
            diagnostics,
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Claim the single in-flight slot.
    ///
    /// # Errors
    /// `PipelineBusy` if another stage call has not resolved yet,
    /// `SessionEnded` after `cancel()`.
    pub fn begin(&self) -> Result<InFlightGuard> {
        if self.is_cancelled() {
            return Err(ParleyError::SessionEnded);
        }
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ParleyError::PipelineBusy)?;
        Ok(InFlightGuard {
            flag: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Flip the session-scoped cancellation flag. Irreversible.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!(session_id = %self.session.id, "pipeline cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stage 1. Whitespace-only results are normalised to `""`.
    pub async fn transcribe(&self, recording: &Recording) -> Result<String> {
        let stage = PipelineStage::Transcribe;
        let transcript = self
            .recognizer
            .transcribe(recording)
            .await
            .map_err(|e| self.stage_error(stage, e))?;
        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            PipelineDiagnostics::bump(&self.diagnostics.empty_transcripts);
            info!("no speech in recording");
        } else {
            debug!(chars = transcript.len(), "transcript ready");
        }
        Ok(transcript)
    }

    /// Stage 2. Appends the user turn before the call and the agent turn after.
    pub async fn respond(&self, transcript: &str) -> Result<String> {
        let stage = PipelineStage::Respond;
        if self.is_cancelled() {
            return Err(ParleyError::SessionEnded);
        }
        self.append(Role::User, transcript);

        let response = self
            .dialogue
            .respond(&self.session.id, transcript, &self.session.scenario)
            .await
            .map_err(|e| self.stage_error(stage, e))?;

        if self.is_cancelled() {
            debug!("dropping dialogue response after call end");
            return Err(ParleyError::SessionEnded);
        }
        self.append(Role::Agent, &response);
        Ok(response)
    }

    /// Stage 3.
    pub async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        self.synthesizer
            .synthesize(text, &self.session.voice_id)
            .await
            .map_err(|e| self.stage_error(PipelineStage::Synthesize, e))
    }

    /// Run all three stages back to back under one in-flight guard.
    pub async fn run_turn(&self, recording: &Recording) -> Result<TurnOutcome> {
        let _guard = self.begin()?;
        let transcript = self.transcribe(recording).await?;
        if transcript.is_empty() {
            return Ok(TurnOutcome::NoSpeech);
        }
        let response = self.respond(&transcript).await?;
        let audio = self.synthesize(&response).await?;
        Ok(TurnOutcome::Reply {
            transcript,
            response,
            audio,
        })
    }

    /// Submit the full history for scoring and mark the session completed.
    ///
    /// Runs after the turn loop stopped, so it ignores the cancellation flag.
    pub async fn score(&self) -> Result<ScoreReport> {
        let history = self.history();
        info!(turns = history.len(), "requesting score");
        let report = self
            .dialogue
            .score(&self.session.id, &history, &self.session.scenario)
            .await
            .map_err(|e| self.stage_error(PipelineStage::Score, e))?;

        if let Err(e) = self.log.complete_session(&self.session.id, &report) {
            warn!("failed to persist score: {e}");
        }
        info!(score = report.score, "session scored");
        Ok(report)
    }

    /// In-memory copy of the turns appended so far, oldest first.
    pub fn history(&self) -> Vec<DialogueTurn> {
        self.history.lock().clone()
    }

    pub fn diagnostics(&self) -> &PipelineDiagnostics {
        &self.diagnostics
    }

    fn append(&self, role: Role, text: &str) {
        let turn = DialogueTurn::new(role, text);
        if let Err(e) = self.log.append_turn(&self.session.id, &turn) {
            warn!(role = role.as_str(), "failed to persist turn: {e}");
        }
        let event = TranscriptEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            session_id: self.session.id.clone(),
            role,
            text: turn.text.clone(),
            timestamp: turn.timestamp,
        };
        self.history.lock().push(turn);
        let _ = self.transcript_tx.send(event);
    }

    fn stage_error(&self, stage: PipelineStage, err: ParleyError) -> ParleyError {
        PipelineDiagnostics::bump(&self.diagnostics.stage_failures);
        match err {
            ParleyError::Network { .. } => err,
            other => ParleyError::network(stage, other.to_string()),
        }
    }
}
