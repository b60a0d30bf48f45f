//! SQLite-backed `MessageLog`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use parley_core::{
    error::{ParleyError, Result},
    CallSession, DialogueTurn, MessageLog, Role, ScoreReport,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub persona_id: String,
    pub voice_id: String,
    pub call_type: String,
    pub started_at: String,
    pub status: String,
    pub score: Option<u8>,
    pub feedback: Option<String>,
}

pub struct SqliteMessageLog {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> ParleyError {
    ParleyError::Other(anyhow::anyhow!("sqlite: {e}"))
}

impl SqliteMessageLog {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path).map_err(db_err)?;
        init_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn session(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT id, persona_id, voice_id, call_type, started_at, status, score, feedback
            FROM sessions WHERE id = ?1
            "#,
            params![session_id],
            |row| {
                Ok(SessionSummary {
                    id: row.get(0)?,
                    persona_id: row.get(1)?,
                    voice_id: row.get(2)?,
                    call_type: row.get(3)?,
                    started_at: micros_to_rfc3339(row.get(4)?),
                    status: row.get(5)?,
                    score: row.get::<_, Option<i64>>(6)?.map(|s| s.clamp(0, 100) as u8),
                    feedback: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS sessions (
          id TEXT PRIMARY KEY,
          persona_id TEXT NOT NULL,
          voice_id TEXT NOT NULL,
          call_type TEXT NOT NULL,
          scenario_json TEXT NOT NULL,
          started_at INTEGER NOT NULL,
          status TEXT NOT NULL DEFAULT 'active',
          score INTEGER,
          feedback TEXT,
          report_json TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          session_id TEXT NOT NULL,
          role TEXT NOT NULL,
          text TEXT NOT NULL,
          created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);
        "#,
    )
    .map_err(db_err)
}

impl MessageLog for SqliteMessageLog {
    fn start_session(&self, session: &CallSession) -> Result<()> {
        let scenario_json = serde_json::to_string(&session.scenario)
            .map_err(|e| ParleyError::Other(e.into()))?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO sessions
            (id, persona_id, voice_id, call_type, scenario_json, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                session.id,
                session.scenario.persona_id,
                session.voice_id,
                session.scenario.call_type,
                scenario_json,
                session.started_at.timestamp_micros()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn append_turn(&self, session_id: &str, turn: &DialogueTurn) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (session_id, role, text, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id,
                turn.role.as_str(),
                turn.text,
                turn.timestamp.timestamp_micros()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn turns(&self, session_id: &str) -> Result<Vec<DialogueTurn>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT role, text, created_at FROM messages
                WHERE session_id = ?1
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut turns = Vec::new();
        for row in rows {
            let (role, text, created_at) = row.map_err(db_err)?;
            let Some(role) = Role::parse(&role) else {
                tracing::warn!(session_id, role = %role, "skipping message with unknown role");
                continue;
            };
            turns.push(DialogueTurn {
                role,
                text,
                timestamp: micros_to_datetime(created_at),
            });
        }
        Ok(turns)
    }

    fn complete_session(&self, session_id: &str, report: &ScoreReport) -> Result<()> {
        let report_json =
            serde_json::to_string(report).map_err(|e| ParleyError::Other(e.into()))?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE sessions
            SET status = 'completed', score = ?2, feedback = ?3, report_json = ?4
            WHERE id = ?1
            "#,
            params![session_id, report.score as i64, report.feedback, report_json],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn micros_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(ts).single().unwrap_or_else(Utc::now)
}

fn micros_to_rfc3339(ts: i64) -> String {
    micros_to_datetime(ts).to_rfc3339()
}
