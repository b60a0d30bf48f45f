//! External collaborators of a call: speech recognition, dialogue
//! generation and scoring, speech synthesis, and the message log.
//!
//! The async traits are dyn-compatible (boxed futures) so the engine can
//! hold them as `Arc<dyn …>` and tests can swap in scripted fakes.

pub mod memory;

#[cfg(feature = "http")]
pub mod http;

use std::future::Future;
use std::pin::Pin;

use crate::{
    audio::Recording,
    error::Result,
    playback::SynthesizedAudio,
    session::{CallSession, DialogueTurn, ScenarioContext, ScoreReport},
};

pub use memory::InMemoryMessageLog;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Speech-to-text.
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe one recording. An empty string means no speech was heard
    /// and is not an error.
    fn transcribe<'a>(&'a self, recording: &'a Recording) -> BoxFuture<'a, Result<String>>;
}

/// Dialogue generation plus out-of-band scoring.
pub trait DialogueService: Send + Sync {
    fn respond<'a>(
        &'a self,
        session_id: &'a str,
        transcript: &'a str,
        scenario: &'a ScenarioContext,
    ) -> BoxFuture<'a, Result<String>>;

    fn score<'a>(
        &'a self,
        session_id: &'a str,
        history: &'a [DialogueTurn],
        scenario: &'a ScenarioContext,
    ) -> BoxFuture<'a, Result<ScoreReport>>;
}

/// Text-to-speech.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        voice_id: &'a str,
    ) -> BoxFuture<'a, Result<SynthesizedAudio>>;
}

/// Append-only, creation-ordered store of call transcripts.
pub trait MessageLog: Send + Sync {
    /// Record that a call began. Stores that keep no session table may ignore it.
    fn start_session(&self, _session: &CallSession) -> Result<()> {
        Ok(())
    }

    fn append_turn(&self, session_id: &str, turn: &DialogueTurn) -> Result<()>;

    /// All turns of a session in the order they were appended.
    fn turns(&self, session_id: &str) -> Result<Vec<DialogueTurn>>;

    /// Mark the session completed with its score.
    fn complete_session(&self, session_id: &str, report: &ScoreReport) -> Result<()>;
}
