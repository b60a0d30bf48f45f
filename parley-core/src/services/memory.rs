use std::collections::HashMap;

use parking_lot::Mutex;

use super::MessageLog;
use crate::{
    error::Result,
    session::{CallSession, DialogueTurn, ScoreReport},
};

#[derive(Debug, Default)]
struct LogState {
    turns: HashMap<String, Vec<DialogueTurn>>,
    scores: HashMap<String, ScoreReport>,
}

/// Process-local `MessageLog`, used when no durable store is configured.
#[derive(Debug, Default)]
pub struct InMemoryMessageLog {
    state: Mutex<LogState>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, session_id: &str) -> Option<ScoreReport> {
        self.state.lock().scores.get(session_id).cloned()
    }
}

impl MessageLog for InMemoryMessageLog {
    fn start_session(&self, session: &CallSession) -> Result<()> {
        self.state
            .lock()
            .turns
            .entry(session.id.clone())
            .or_default();
        Ok(())
    }

    fn append_turn(&self, session_id: &str, turn: &DialogueTurn) -> Result<()> {
        self.state
            .lock()
            .turns
            .entry(session_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    fn turns(&self, session_id: &str) -> Result<Vec<DialogueTurn>> {
        Ok(self
            .state
            .lock()
            .turns
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    fn complete_session(&self, session_id: &str, report: &ScoreReport) -> Result<()> {
        self.state
            .lock()
            .scores
            .insert(session_id.to_string(), report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[test]
    fn turns_come_back_in_append_order_per_session() {
        let log = InMemoryMessageLog::new();
        log.append_turn("a", &DialogueTurn::new(Role::User, "hi")).unwrap();
        log.append_turn("b", &DialogueTurn::new(Role::User, "other")).unwrap();
        log.append_turn("a", &DialogueTurn::new(Role::Agent, "hello")).unwrap();

        let turns = log.turns("a").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "hi");
        assert_eq!(turns[1].role, Role::Agent);
        assert!(log.turns("missing").unwrap().is_empty());
    }

    #[test]
    fn completion_stores_score() {
        let log = InMemoryMessageLog::new();
        log.complete_session("a", &ScoreReport::from_raw(88, Some("good".into())))
            .unwrap();
        assert_eq!(log.score("a").map(|r| r.score), Some(88));
    }
}
