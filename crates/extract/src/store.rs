//! Persistence seams for schemas and conversation history.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::schema::SchemaSpec;

#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn get_schema(&self, owner_key: &str) -> Result<Option<SchemaSpec>>;
    async fn put_schema(&self, owner_key: &str, spec: &SchemaSpec) -> Result<()>;
    async fn delete_schema(&self, owner_key: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Human,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn human(content: impl Into<String>) -> Self {
        Self { role: TurnRole::Human, content: content.into(), timestamp: Utc::now() }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self { role: TurnRole::Ai, content: content.into(), timestamp: Utc::now() }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<()>;

    /// The last `limit` turns, oldest first.
    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>>;
}

#[derive(Default)]
pub struct InMemorySchemaStore {
    schemas: DashMap<String, SchemaSpec>,
}

impl InMemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaStore for InMemorySchemaStore {
    async fn get_schema(&self, owner_key: &str) -> Result<Option<SchemaSpec>> {
        Ok(self.schemas.get(owner_key).map(|s| s.clone()))
    }

    async fn put_schema(&self, owner_key: &str, spec: &SchemaSpec) -> Result<()> {
        self.schemas.insert(owner_key.to_string(), spec.clone());
        Ok(())
    }

    async fn delete_schema(&self, owner_key: &str) -> Result<bool> {
        Ok(self.schemas.remove(owner_key).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    sessions: DashMap<String, Vec<Turn>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<()> {
        self.sessions.entry(session_id.to_string()).or_default().push(turn);
        Ok(())
    }

    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|turns| {
                let start = turns.len().saturating_sub(limit);
                turns[start..].to_vec()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recent_turns_returns_tail_in_order() {
        let store = InMemoryHistoryStore::new();
        for i in 0..5 {
            store.append_turn("s1", Turn::human(format!("q{}", i))).await.unwrap();
        }
        let tail = store.recent_turns("s1", 2).await.unwrap();
        assert_eq!(tail.iter().map(|t| t.content.as_str()).collect::<Vec<_>>(), ["q3", "q4"]);
        assert!(store.recent_turns("missing", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schema_store_roundtrip() {
        let store = InMemorySchemaStore::new();
        let spec = crate::schema::build_static_schema();
        store.put_schema("alice", &spec).await.unwrap();
        assert_eq!(store.get_schema("alice").await.unwrap(), Some(spec));
        assert!(store.delete_schema("alice").await.unwrap());
        assert!(!store.delete_schema("alice").await.unwrap());
    }
}
