//! Session persistence behind an async trait.
//!
//! `save` replaces the whole session atomically; concurrent saves to the
//! same id resolve last-write-wins.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::database::AgentDatabase;
use super::errors::AgentError;
use super::types::{ConversationSession, SessionSummary};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<ConversationSession>, AgentError>;

    async fn save(&self, session: &ConversationSession) -> Result<(), AgentError>;

    /// Returns whether the session existed.
    async fn delete(&self, id: &str) -> Result<bool, AgentError>;

    /// Summaries, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionSummary>, AgentError>;

    async fn load_or_create(&self, id: &str) -> Result<ConversationSession, AgentError> {
        Ok(self
            .load(id)
            .await?
            .unwrap_or_else(|| ConversationSession::new(id)))
    }
}

// ─── In-memory ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, ConversationSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<ConversationSession>, AgentError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save(&self, session: &ConversationSession) -> Result<(), AgentError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, AgentError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, AgentError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(ConversationSession::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }
}

// ─── SQLite ─────────────────────────────────────────────────────────────────

pub struct SqliteSessionStore {
    db: Mutex<AgentDatabase>,
}

impl SqliteSessionStore {
    pub fn new(db: AgentDatabase) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &str) -> Result<Self, AgentError> {
        Ok(Self::new(AgentDatabase::open(path)?))
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, id: &str) -> Result<Option<ConversationSession>, AgentError> {
        self.db.lock().await.get_session(id)
    }

    async fn save(&self, session: &ConversationSession) -> Result<(), AgentError> {
        self.db.lock().await.upsert_session(session)
    }

    async fn delete(&self, id: &str) -> Result<bool, AgentError> {
        self.db.lock().await.delete_session(id)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, AgentError> {
        self.db.lock().await.list_sessions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::Turn;

    async fn exercise(store: &dyn SessionStore) {
        let mut session = store.load_or_create("s1").await.unwrap();
        assert!(session.turns.is_empty());
        session.append(Turn::user("Make a quiz"));
        store.save(&session).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.turns.len(), 1);

        // last write wins
        let mut stale = loaded.clone();
        stale.append(Turn::assistant("Which grade?", "clarify"));
        store.save(&stale).await.unwrap();
        store.save(&loaded).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap().unwrap().turns.len(), 1);

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].preview.as_deref(), Some("Make a quiz"));

        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let store = SqliteSessionStore::open(path.to_str().unwrap()).unwrap();
        exercise(&store).await;
    }
}
