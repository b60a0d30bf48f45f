//! # parley-core
//!
//! Turn-taking engine for voice calls with an AI agent.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SPSC RingBuffer → Analyser → AudioFrame → SpeechEndDetector
//!                    │                                          │ SpeechEnded
//!                    └──► Recorder ──► Recording ◄── stop() ────┤
//!                                          │                    ▼
//!                                          │          turn::transition (CallLoop)
//!                                          ▼                    │
//!                         DialoguePipeline: ASR → dialogue → TTS
//!                                                               │
//!                                                    AudioOutput::play
//!                                                               │
//!                                          PlaybackEnded → Listening → start()
//! ```
//!
//! The audio callback is zero-alloc. Analysis, encoding and every state
//! transition happen on the call loop task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod playback;
pub mod services;
pub mod session;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{CaptureConstraints, EncoderRegistry, MicrophoneSource, Recording};
pub use engine::{CallConfig, CallEngine, CallServices, TurnState};
pub use error::{ParleyError, PipelineStage};
pub use ipc::events::{CallStatus, CallStatusEvent, TranscriptEvent};
pub use playback::{AudioOutput, SynthesizedAudio};
pub use services::{DialogueService, MessageLog, SpeechRecognizer, SpeechSynthesizer};
pub use session::{CallSession, DialogueTurn, Role, ScenarioContext, ScoreReport, SessionPhase};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalMicrophone;

#[cfg(feature = "playback-rodio")]
pub use playback::RodioOutput;
