//! Events published to presentation code.
//!
//! | Event | Source |
//! |-------|--------|
//! | `CallStatusEvent` | `CallEngine::subscribe_status` |
//! | `TranscriptEvent` | `CallEngine::subscribe_transcripts` |
//!
//! Both serialize to camelCase JSON so a UI shell can forward them as-is.
//! Consumers read these; nothing here feeds back into the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    engine::turn::TurnState,
    session::{Role, SessionPhase},
};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Point-in-time view of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatus {
    pub state: TurnState,
    pub phase: SessionPhase,
    pub is_listening: bool,
    pub is_thinking: bool,
    pub is_speaking: bool,
    /// The turn loop has stopped for good.
    pub is_ended: bool,
    /// Time since the call started; frozen once the call ends.
    pub elapsed_ms: u64,
    pub scoring_available: bool,
}

impl CallStatus {
    pub fn new(
        state: TurnState,
        phase: SessionPhase,
        elapsed_ms: u64,
        scoring_available: bool,
    ) -> Self {
        Self {
            state,
            phase,
            is_listening: state == TurnState::Listening,
            is_thinking: state == TurnState::Thinking,
            is_speaking: state == TurnState::Speaking,
            is_ended: state == TurnState::Ended,
            elapsed_ms,
            scoring_available,
        }
    }
}

/// Emitted whenever the turn state, session phase or scoring flag changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusEvent {
    #[serde(flatten)]
    pub status: CallStatus,
    /// Optional human-readable detail (e.g. the error that ended the call).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

/// One dialogue turn as it is appended to the call history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing per call.
    pub seq: u64,
    pub session_id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_flattens_with_camel_case_flags() {
        let event = CallStatusEvent {
            status: CallStatus::new(TurnState::Thinking, SessionPhase::Active, 61_500, true),
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["state"], "thinking");
        assert_eq!(json["phase"], "active");
        assert_eq!(json["isListening"], false);
        assert_eq!(json["isThinking"], true);
        assert_eq!(json["isSpeaking"], false);
        assert_eq!(json["isEnded"], false);
        assert_eq!(json["elapsedMs"], 61_500);
        assert_eq!(json["scoringAvailable"], true);
        assert!(json["detail"].is_null());

        let round_trip: CallStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, event.status);
    }

    #[test]
    fn ended_flag_follows_turn_state() {
        let ended = CallStatus::new(TurnState::Ended, SessionPhase::Completed, 90_000, true);
        assert!(ended.is_ended);
        assert!(!ended.is_listening && !ended.is_thinking && !ended.is_speaking);
        assert!(!CallStatus::new(TurnState::Speaking, SessionPhase::Active, 0, false).is_ended);
    }

    #[test]
    fn transcript_event_uses_lowercase_role() {
        let event = TranscriptEvent {
            seq: 4,
            session_id: "call-1".into(),
            role: Role::Agent,
            text: "Thanks for taking my call.".into(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).expect("serialize transcript event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["sessionId"], "call-1");
        assert_eq!(json["role"], "agent");
    }

    #[test]
    fn turn_state_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<TurnState>(r#""Listening""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }
}
