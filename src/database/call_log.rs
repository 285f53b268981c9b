//! Call History
//!
//! SQLite-Datenbank mit allen beendeten Calls.

use crate::call_engine::{Call, CallDirection, ChatId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call {0} has not ended yet")]
    CallNotEnded(String),
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Eintrag in der Anrufliste
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: i64,
    pub call_id: String,
    pub chat_id: String,
    pub direction: String,
    pub audio: bool,
    pub video: bool,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub end_reason: String,
}

impl CallRecord {
    pub fn was_answered(&self) -> bool {
        self.answered_at.is_some()
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == CallDirection::Outgoing.to_string()
    }

    fn from_row(row: &Row<'_>) -> SqliteResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            call_id: row.get(1)?,
            chat_id: row.get(2)?,
            direction: row.get(3)?,
            audio: row.get::<_, i32>(4)? != 0,
            video: row.get::<_, i32>(5)? != 0,
            created_at: row.get(6)?,
            answered_at: row.get(7)?,
            ended_at: row.get(8)?,
            duration_secs: row.get(9)?,
            end_reason: row.get(10)?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, call_id, chat_id, direction, audio, video,
           created_at, answered_at, ended_at, duration_secs, end_reason
    FROM call_history
"#;

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Anrufliste (thread-safe durch Mutex)
pub struct CallLog {
    conn: Mutex<Connection>,
}

impl CallLog {
    /// Öffnet oder erstellt `<data_dir>/calls.db`
    pub fn open(data_dir: &Path) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("calls.db");

        tracing::info!("Opening call log at {:?}", db_path);

        let log = Self {
            conn: Mutex::new(Connection::open(&db_path)?),
        };
        log.init_schema()?;
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let log = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS call_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                call_id TEXT NOT NULL UNIQUE,
                chat_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                audio INTEGER NOT NULL,
                video INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                answered_at TEXT,
                ended_at TEXT NOT NULL,
                duration_secs INTEGER NOT NULL DEFAULT 0,
                end_reason TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_history_chat ON call_history(chat_id);
            CREATE INDEX IF NOT EXISTS idx_call_history_ended ON call_history(ended_at);
            "#,
        )?;
        Ok(())
    }

    /// Speichert einen beendeten Call; doppeltes Speichern ist ein No-op
    pub fn record(&self, call: &Call) -> Result<(), DatabaseError> {
        let ended_at = call
            .ended_at
            .filter(|_| call.state.is_terminal())
            .ok_or_else(|| DatabaseError::CallNotEnded(call.handle.to_string()))?;

        let duration = call.duration().map(|d| d.num_seconds()).unwrap_or(0);
        let reason = call
            .end_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO call_history
                (call_id, chat_id, direction, audio, video,
                 created_at, answered_at, ended_at, duration_secs, end_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                call.handle.to_string(),
                call.chat.as_str(),
                call.direction.to_string(),
                call.audio_enabled as i32,
                call.video_enabled as i32,
                call.created_at,
                call.answered_at,
                ended_at,
                duration,
                reason,
            ],
        )?;

        tracing::debug!("Recorded call {} with {} ({})", call.handle, call.chat, reason);
        Ok(())
    }

    /// Neueste Einträge zuerst
    pub fn recent(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY ended_at DESC, id DESC LIMIT ?1"))?;
        let records = stmt
            .query_map(params![limit as i64], CallRecord::from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(records)
    }

    pub fn for_chat(&self, chat: &ChatId) -> Result<Vec<CallRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{SELECT_COLUMNS} WHERE chat_id = ?1 ORDER BY ended_at DESC, id DESC"))?;
        let records = stmt
            .query_map(params![chat.as_str()], CallRecord::from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM call_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Löscht die Historie eines Chats, gibt die Anzahl gelöschter Einträge zurück
    pub fn delete_for_chat(&self, chat: &ChatId) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM call_history WHERE chat_id = ?1",
            params![chat.as_str()],
        )?;
        Ok(deleted)
    }
}

impl std::fmt::Debug for CallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLog").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::{CallTrigger, EndReason};

    fn ended_call(chat: &str, answered: bool) -> Call {
        let mut call = Call::new(chat.into(), CallDirection::Incoming, true, false, 48);
        if answered {
            call.transition(CallTrigger::Accept).unwrap();
        }
        call.end(EndReason::Remote);
        call
    }

    #[test]
    fn test_record_and_query() {
        let log = CallLog::open_in_memory().unwrap();
        log.record(&ended_call("alice", true)).unwrap();
        log.record(&ended_call("bob", false)).unwrap();

        assert_eq!(log.count().unwrap(), 2);

        let alice = log.for_chat(&"alice".into()).unwrap();
        assert_eq!(alice.len(), 1);
        assert!(alice[0].was_answered());
        assert!(!alice[0].is_outgoing());
        assert_eq!(alice[0].end_reason, "remote");

        let bob = log.for_chat(&"bob".into()).unwrap();
        assert!(!bob[0].was_answered());
        assert_eq!(bob[0].duration_secs, 0);
    }

    #[test]
    fn test_record_is_idempotent() {
        let log = CallLog::open_in_memory().unwrap();
        let call = ended_call("alice", true);

        log.record(&call).unwrap();
        log.record(&call).unwrap();
        assert_eq!(log.count().unwrap(), 1);
    }

    #[test]
    fn test_live_call_rejected() {
        let log = CallLog::open_in_memory().unwrap();
        let call = Call::new("alice".into(), CallDirection::Outgoing, true, false, 48);
        assert!(matches!(log.record(&call), Err(DatabaseError::CallNotEnded(_))));
    }

    #[test]
    fn test_recent_limit_and_delete() {
        let log = CallLog::open_in_memory().unwrap();
        for _ in 0..3 {
            log.record(&ended_call("alice", true)).unwrap();
        }
        log.record(&ended_call("bob", true)).unwrap();

        assert_eq!(log.recent(2).unwrap().len(), 2);
        assert_eq!(log.delete_for_chat(&"alice".into()).unwrap(), 3);
        assert_eq!(log.count().unwrap(), 1);
    }
}
