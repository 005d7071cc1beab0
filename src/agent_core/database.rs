//! SQLite database for conversation sessions and versioned artifacts.
//!
//! Uses `rusqlite` in synchronous mode; async callers wrap the handle in a
//! `tokio::sync::Mutex` (see the SQLite store backends). WAL mode is enabled
//! so the session listing can read while a turn is saving.

use rusqlite::{params, Connection, OptionalExtension};

use super::errors::AgentError;
use super::types::{Artifact, ConversationSession, SessionSummary};

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for the agent core.
pub struct AgentDatabase {
    conn: Connection,
}

impl AgentDatabase {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                turn_count INTEGER NOT NULL DEFAULT 0,
                last_intent TEXT,
                last_action TEXT,
                preview TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_updated
                ON sessions(updated_at);

            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                artifact_type TEXT NOT NULL,
                content_format TEXT NOT NULL,
                content TEXT NOT NULL,
                resources TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                PRIMARY KEY (id, version)
            );
            ",
        )?;
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    /// Insert or replace a whole session in one statement.
    pub fn upsert_session(&self, session: &ConversationSession) -> Result<(), AgentError> {
        let payload = serde_json::to_string(session)?;
        let summary = session.summary();
        self.conn.execute(
            "INSERT INTO sessions
                (id, payload, turn_count, last_intent, last_action, preview, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                turn_count = excluded.turn_count,
                last_intent = excluded.last_intent,
                last_action = excluded.last_action,
                preview = excluded.preview,
                updated_at = excluded.updated_at",
            params![
                session.id,
                payload,
                summary.turn_count as i64,
                summary.last_intent,
                summary.last_action,
                summary.preview,
                session.created_at,
                session.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a session by ID.
    pub fn get_session(&self, session_id: &str) -> Result<Option<ConversationSession>, AgentError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// List session summaries, most recently updated first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, turn_count, last_intent, last_action, preview, updated_at
             FROM sessions
             ORDER BY updated_at DESC, id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                turn_count: row.get::<_, i64>(1)? as usize,
                last_intent: row.get(2)?,
                last_action: row.get(3)?,
                preview: row.get(4)?,
                updated_at: row.get(5)?,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Delete a session. Returns whether a row existed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, AgentError> {
        let deleted = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(deleted > 0)
    }

    // ─── Artifacts ──────────────────────────────────────────────────────

    /// Insert one artifact version. Fails if `(id, version)` already exists.
    pub fn insert_artifact(&self, artifact: &Artifact) -> Result<(), AgentError> {
        let content = serde_json::to_string(&artifact.content)?;
        let resources = serde_json::to_string(&artifact.resources)?;
        self.conn.execute(
            "INSERT INTO artifacts
                (id, version, artifact_type, content_format, content, resources, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact.artifact_id,
                artifact.version,
                artifact.artifact_type,
                artifact.content_format,
                content,
                resources,
                artifact.created_at,
            ],
        )?;
        Ok(())
    }

    /// Latest version of an artifact.
    pub fn get_latest_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>, AgentError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, version, artifact_type, content_format, content, resources, created_at
                 FROM artifacts WHERE id = ?1
                 ORDER BY version DESC LIMIT 1",
                params![artifact_id],
                row_to_artifact,
            )
            .optional()?;
        Ok(row)
    }

    /// A specific version of an artifact.
    pub fn get_artifact_version(
        &self,
        artifact_id: &str,
        version: u32,
    ) -> Result<Option<Artifact>, AgentError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, version, artifact_type, content_format, content, resources, created_at
                 FROM artifacts WHERE id = ?1 AND version = ?2",
                params![artifact_id, version],
                row_to_artifact,
            )
            .optional()?;
        Ok(row)
    }

    /// Every version of an artifact, oldest first.
    pub fn list_artifact_versions(&self, artifact_id: &str) -> Result<Vec<Artifact>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, version, artifact_type, content_format, content, resources, created_at
             FROM artifacts WHERE id = ?1
             ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![artifact_id], row_to_artifact)?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }

    /// Append the next version (latest + 1) inside one transaction.
    ///
    /// Returns `None` when the artifact does not exist.
    pub fn append_artifact_version(
        &mut self,
        artifact_id: &str,
        content: &serde_json::Value,
        resources: Option<&[String]>,
    ) -> Result<Option<Artifact>, AgentError> {
        let tx = self.conn.transaction()?;
        let latest = tx
            .query_row(
                "SELECT id, version, artifact_type, content_format, content, resources, created_at
                 FROM artifacts WHERE id = ?1
                 ORDER BY version DESC LIMIT 1",
                params![artifact_id],
                row_to_artifact,
            )
            .optional()?;

        let Some(latest) = latest else {
            return Ok(None);
        };

        let next = Artifact {
            artifact_id: latest.artifact_id,
            artifact_type: latest.artifact_type,
            content_format: latest.content_format,
            content: content.clone(),
            version: latest.version + 1,
            resources: resources.map(<[String]>::to_vec).unwrap_or(latest.resources),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        tx.execute(
            "INSERT INTO artifacts
                (id, version, artifact_type, content_format, content, resources, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                next.artifact_id,
                next.version,
                next.artifact_type,
                next.content_format,
                serde_json::to_string(&next.content)?,
                serde_json::to_string(&next.resources)?,
                next.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(Some(next))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        artifact_id: row.get(0)?,
        version: row.get(1)?,
        artifact_type: row.get(2)?,
        content_format: row.get(3)?,
        content: parse_json_value(row.get::<_, String>(4)?),
        resources: parse_json_array(row.get::<_, String>(5)?),
        created_at: row.get(6)?,
    })
}

fn parse_json_array(json: String) -> Vec<String> {
    serde_json::from_str(&json).unwrap_or_default()
}

fn parse_json_value(json: String) -> serde_json::Value {
    serde_json::from_str(&json).unwrap_or(serde_json::Value::Null)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::Turn;

    fn test_db() -> AgentDatabase {
        AgentDatabase::open(":memory:").unwrap()
    }

    fn artifact(id: &str) -> Artifact {
        Artifact {
            artifact_id: id.into(),
            artifact_type: "quiz".into(),
            content_format: "json".into(),
            content: serde_json::json!({"questions": []}),
            version: 1,
            resources: vec!["r1".into()],
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_upsert_and_get_session() {
        let db = test_db();
        let mut session = ConversationSession::new("s1");
        session.append(Turn::user("hello"));
        db.upsert_session(&session).unwrap();

        session.append(Turn::assistant("hi", "chat"));
        db.upsert_session(&session).unwrap();

        let loaded = db.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(db.list_sessions().unwrap()[0].turn_count, 2);
    }

    #[test]
    fn test_session_not_found() {
        let db = test_db();
        assert!(db.get_session("nonexistent").unwrap().is_none());
        assert!(!db.delete_session("nonexistent").unwrap());
    }

    #[test]
    fn test_delete_session() {
        let db = test_db();
        db.upsert_session(&ConversationSession::new("s1")).unwrap();
        assert!(db.delete_session("s1").unwrap());
        assert!(db.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_artifact_versions() {
        let mut db = test_db();
        db.insert_artifact(&artifact("a1")).unwrap();

        let v2 = db
            .append_artifact_version("a1", &serde_json::json!({"questions": [1]}), None)
            .unwrap()
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.resources, vec!["r1"]);

        let latest = db.get_latest_artifact("a1").unwrap().unwrap();
        assert_eq!(latest.version, 2);
        let v1 = db.get_artifact_version("a1", 1).unwrap().unwrap();
        assert_eq!(v1.content["questions"], serde_json::json!([]));

        let versions = db.list_artifact_versions("a1").unwrap();
        assert_eq!(versions.iter().map(|a| a.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_append_to_missing_artifact() {
        let mut db = test_db();
        let result = db
            .append_artifact_version("missing", &serde_json::json!({}), None)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let db = test_db();
        db.insert_artifact(&artifact("a1")).unwrap();
        assert!(db.insert_artifact(&artifact("a1")).is_err());
    }
}
