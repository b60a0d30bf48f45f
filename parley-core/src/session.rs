//! Call-session records shared by the engine, the services and the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the caller is rehearsing. Sent with every dialogue and scoring call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioContext {
    pub persona_id: String,
    pub call_type: String,
    pub description: String,
}

/// Session-level phase, orthogonal to the per-turn `TurnState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// The turn loop is running.
    Active,
    /// Capture and playback are stopped and a scoring call is outstanding.
    Scoring,
    /// A score was recorded. Terminal.
    Completed,
    /// The call ended without a score (hang-up, fatal error, failed scoring).
    Ended,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Scoring => "scoring",
            Self::Completed => "completed",
            Self::Ended => "ended",
        }
    }

    /// True once the turn loop has stopped for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Ended)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: String,
    pub voice_id: String,
    pub scenario: ScenarioContext,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(voice_id: impl Into<String>, scenario: ScenarioContext) -> Self {
        Self {
            id: new_session_id(),
            voice_id: voice_id.into(),
            scenario,
            started_at: Utc::now(),
        }
    }

    pub fn persona_id(&self) -> &str {
        &self.scenario.persona_id
    }
}

fn new_session_id() -> String {
    format!(
        "call-{}-{:08x}",
        Utc::now().timestamp_micros(),
        rand::random::<u32>()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// One utterance in the call history. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl DialogueTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of the scoring call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ScoreReport {
    /// 0–100.
    pub score: u8,
    pub feedback: Option<String>,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
}

impl ScoreReport {
    /// Build a report from an unbounded raw score, clamping into 0–100.
    pub fn from_raw(raw: i64, feedback: Option<String>) -> Self {
        Self {
            score: raw.clamp(0, 100) as u8,
            feedback: feedback.filter(|f| !f.trim().is_empty()),
            strengths: Vec::new(),
            improvements: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_prefixed() {
        let scenario = ScenarioContext::default();
        let a = CallSession::new("v1", scenario.clone());
        let b = CallSession::new("v1", scenario);
        assert!(a.id.starts_with("call-"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn score_is_clamped() {
        assert_eq!(ScoreReport::from_raw(140, None).score, 100);
        assert_eq!(ScoreReport::from_raw(-3, None).score, 0);
        assert_eq!(ScoreReport::from_raw(72, None).score, 72);
        assert_eq!(ScoreReport::from_raw(50, Some("  ".into())).feedback, None);
    }

    #[test]
    fn scenario_serializes_camel_case() {
        let scenario = ScenarioContext {
            persona_id: "p-1".into(),
            call_type: "cold-call".into(),
            description: "Pitch to a busy CFO".into(),
        };
        let json = serde_json::to_value(&scenario).expect("serialize scenario");
        assert_eq!(json["personaId"], "p-1");
        assert_eq!(json["callType"], "cold-call");
    }

    #[test]
    fn phase_terminality() {
        assert!(!SessionPhase::Active.is_terminal());
        assert!(!SessionPhase::Scoring.is_terminal());
        assert!(SessionPhase::Completed.is_terminal());
        assert!(SessionPhase::Ended.is_terminal());
        assert_eq!(Role::parse("agent"), Some(Role::Agent));
        assert_eq!(Role::parse("bot"), None);
    }
}
