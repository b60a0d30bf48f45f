use thiserror::Error;

use crate::engine::turn::TurnState;
use crate::lifecycle::ResourceKind;

/// Which external pipeline stage produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Transcribe,
    Respond,
    Synthesize,
    Score,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transcribe => write!(f, "transcribe"),
            Self::Respond => write!(f, "respond"),
            Self::Synthesize => write!(f, "synthesize"),
            Self::Score => write!(f, "score"),
        }
    }
}

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("microphone access failed: {0}")]
    DeviceAccess(String),

    #[error("no input device found")]
    NoInputDevice,

    #[error("no supported recording encoding (tried: {})", tried.join(", "))]
    EncodingNegotiation { tried: Vec<String> },

    #[error("{stage} call failed: {message}")]
    Network {
        stage: PipelineStage,
        message: String,
    },

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("a recording is already active")]
    AlreadyRecording,

    #[error("no recording is active")]
    NotRecording,

    #[error("capture cannot start while {0}")]
    CaptureRejected(TurnState),

    #[error("a pipeline call is already in flight")]
    PipelineBusy,

    #[error("{0} is already held")]
    ResourceAlreadyHeld(ResourceKind),

    #[error("call session has ended")]
    SessionEnded,

    #[error("scoring is not available yet")]
    ScoringUnavailable,

    #[error("operation not valid in session phase {0}")]
    InvalidPhase(String),

    #[error("encoder error: {0}")]
    Encoding(String),

    #[error("invalid audio payload: {0}")]
    Payload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    pub fn network(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self::Network {
            stage,
            message: message.into(),
        }
    }

    /// Capture, negotiation and resource errors end the session. Pipeline and
    /// playback errors only abort the current turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceAccess(_)
                | Self::NoInputDevice
                | Self::EncodingNegotiation { .. }
                | Self::ResourceAlreadyHeld(_)
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
