//! In-memory store for tests and for running without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stockchat_core::error::StoreError;
use stockchat_core::store::*;
use tokio::sync::RwLock;

struct ConversationRow {
    seq: u64,
    id: String,
    title: String,
    summary: Option<String>,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    conversations: HashMap<String, ConversationRow>,
    messages: HashMap<String, Vec<StoredMessage>>,
    next_seq: u64,
    next_message_id: i64,
}

impl State {
    fn record(&self, row: &ConversationRow) -> ConversationRecord {
        ConversationRecord {
            id: row.id.clone(),
            title: row.title.clone(),
            summary: row.summary.clone(),
            metadata: row.metadata.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            message_count: self.messages.get(&row.id).map_or(0, |m| m.len() as u64),
        }
    }

    /// Newest first, optionally filtered by a title keyword.
    fn listed(&self, keyword: Option<&str>) -> Vec<&ConversationRow> {
        let needle = keyword.map(str::to_lowercase);
        let mut rows: Vec<&ConversationRow> = self
            .conversations
            .values()
            .filter(|c| {
                needle
                    .as_deref()
                    .is_none_or(|n| c.title.to_lowercase().contains(n))
            })
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.seq.cmp(&a.seq)));
        rows
    }

    fn page(&self, keyword: Option<&str>, skip: u32, limit: u32) -> Vec<ConversationRecord> {
        self.listed(keyword)
            .into_iter()
            .skip(skip as usize)
            .take(limit as usize)
            .map(|row| self.record(row))
            .collect()
    }
}

/// A store that keeps everything in process memory.
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_conversation(
        &self,
        id: &str,
        title: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<ConversationRecord, StoreError> {
        let mut state = self.state.write().await;
        if state.conversations.contains_key(id) {
            return Err(StoreError::Query(format!("conversation {id} already exists")));
        }
        let now = Utc::now();
        state.next_seq += 1;
        let row = ConversationRow {
            seq: state.next_seq,
            id: id.to_string(),
            title: title.to_string(),
            summary: None,
            metadata,
            created_at: now,
            updated_at: now,
        };
        let record = state.record(&row);
        state.conversations.insert(id.to_string(), row);
        Ok(record)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.conversations.get(id).map(|row| state.record(row)))
    }

    async fn recent_conversations(&self, skip: u32, limit: u32) -> Result<Vec<ConversationRecord>, StoreError> {
        Ok(self.state.read().await.page(None, skip, limit))
    }

    async fn search_conversations(
        &self,
        keyword: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        Ok(self.state.read().await.page(Some(keyword), skip, limit))
    }

    async fn count_conversations(&self, keyword: Option<&str>) -> Result<u64, StoreError> {
        Ok(self.state.read().await.listed(keyword).len() as u64)
    }

    async fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let mut state = self.state.write().await;
        let Some(row) = state.conversations.get_mut(id) else {
            return Ok(None);
        };
        if let Some(title) = update.title {
            row.title = title;
        }
        if let Some(summary) = update.summary {
            row.summary = Some(summary);
        }
        row.updated_at = Utc::now();
        Ok(state.conversations.get(id).map(|row| state.record(row)))
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        state.messages.remove(id);
        Ok(state.conversations.remove(id).is_some())
    }

    async fn append_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        match state.conversations.get_mut(&message.conversation_id) {
            Some(row) => row.updated_at = now,
            None => return Err(StoreError::NotFound(message.conversation_id)),
        }
        state.next_message_id += 1;
        let stored = StoredMessage {
            id: state.next_message_id,
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            message_type: message.message_type,
            metadata: message.metadata,
            created_at: now,
        };
        state
            .messages
            .entry(stored.conversation_id.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn messages(&self, conversation_id: &str, skip: u32, limit: u32) -> Result<Vec<StoredMessage>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(conversation_id)
            .map(|m| {
                m.iter()
                    .skip(skip as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_messages(&self, conversation_id: &str) -> Result<u64, StoreError> {
        let state = self.state.read().await;
        Ok(state.messages.get(conversation_id).map_or(0, |m| m.len() as u64))
    }
}
