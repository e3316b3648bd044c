//! Conversation persistence trait.
//!
//! The agent hands every finished turn to a [`ConversationStore`]; the HTTP
//! layer reads conversations back for listing and display. Implementations
//! live in the `stockchat-store` crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::{Message, MessageKind, Role};

/// Title used when a conversation is created without one.
pub const DEFAULT_TITLE: &str = "New conversation";

/// A stored conversation header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u64,
}

/// A stored message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Rebuild the buffer entry this row was persisted from.
    ///
    /// Returns `None` for rows that lack the metadata a function-call
    /// record or tool output needs.
    pub fn to_message(&self) -> Option<Message> {
        let meta = self.metadata.as_ref();
        let field = |key: &str| {
            meta.and_then(|m| m.get(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let mut message = match self.message_type.as_str() {
            "function_call" => Message::function_call(
                field("call_id")?,
                field("tool_name")?,
                field("arguments").unwrap_or_else(|| "{}".into()),
            ),
            "function_call_output" => {
                Message::tool_output(field("call_id")?, self.content.clone().unwrap_or_default())
            }
            _ => {
                let content = self.content.clone().unwrap_or_default();
                match Role::parse(&self.role)? {
                    Role::System => Message::system(content),
                    Role::User => Message::user(content),
                    Role::Assistant => Message::assistant(content),
                    Role::ToolOutput => return None,
                }
            }
        };
        message.timestamp = self.created_at;
        Some(message)
    }
}

/// A message to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: String,
    pub content: Option<String>,
    pub message_type: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    /// Flatten a buffer entry into a storable row.
    pub fn from_message(conversation_id: &str, message: &Message) -> Self {
        let (content, metadata) = match &message.kind {
            MessageKind::Message => (message.content.clone(), None),
            MessageKind::FunctionCall {
                call_id,
                tool_name,
                arguments,
            } => (
                None,
                Some(serde_json::json!({
                    "call_id": call_id,
                    "tool_name": tool_name,
                    "arguments": arguments,
                })),
            ),
            MessageKind::FunctionCallOutput { call_id, output } => (
                Some(output.clone()),
                Some(serde_json::json!({ "call_id": call_id })),
            ),
        };
        Self {
            conversation_id: conversation_id.to_string(),
            role: message.role.as_str().to_string(),
            content,
            message_type: message.kind.type_name().to_string(),
            metadata,
        }
    }
}

/// Partial update of a conversation header.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub summary: Option<String>,
}

/// Durable storage for conversations and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "postgres", "memory").
    fn name(&self) -> &str;

    /// Create a conversation. Fails if the id is taken.
    async fn create_conversation(
        &self,
        id: &str,
        title: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<ConversationRecord, StoreError>;

    /// Fetch a conversation, creating it with `title` if it does not exist.
    async fn ensure_conversation(&self, id: &str, title: &str) -> Result<ConversationRecord, StoreError> {
        match self.get_conversation(id).await? {
            Some(existing) => Ok(existing),
            None => self.create_conversation(id, title, None).await,
        }
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError>;

    /// Newest first.
    async fn recent_conversations(&self, skip: u32, limit: u32) -> Result<Vec<ConversationRecord>, StoreError>;

    /// Case-insensitive substring match on the title, newest first.
    async fn search_conversations(
        &self,
        keyword: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<ConversationRecord>, StoreError>;

    async fn count_conversations(&self, keyword: Option<&str>) -> Result<u64, StoreError>;

    /// Returns `None` when the conversation does not exist.
    async fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> Result<Option<ConversationRecord>, StoreError>;

    /// Delete a conversation and its messages. Returns whether it existed.
    async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError>;

    async fn append_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Messages in append order.
    async fn messages(&self, conversation_id: &str, skip: u32, limit: u32) -> Result<Vec<StoredMessage>, StoreError>;

    async fn count_messages(&self, conversation_id: &str) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<bool, StoreError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(from: &NewMessage) -> StoredMessage {
        StoredMessage {
            id: 1,
            conversation_id: from.conversation_id.clone(),
            role: from.role.clone(),
            content: from.content.clone(),
            message_type: from.message_type.clone(),
            metadata: from.metadata.clone(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn function_call_keeps_call_metadata() {
        let msg = Message::function_call("c1", "get_stock_info", r#"{"symbol":"SH600519"}"#);
        let row = NewMessage::from_message("conv", &msg);
        assert_eq!(row.message_type, "function_call");
        assert!(row.content.is_none());
        assert_eq!(row.metadata.as_ref().unwrap()["tool_name"], "get_stock_info");

        let rebuilt = stored(&row).to_message().unwrap();
        assert_eq!(rebuilt.kind, msg.kind);
    }

    #[test]
    fn tool_output_roundtrips_through_row() {
        let msg = Message::tool_output("c1", "cash flow ...");
        let rebuilt = stored(&NewMessage::from_message("conv", &msg)).to_message().unwrap();
        assert_eq!(rebuilt.kind, msg.kind);
        assert_eq!(rebuilt.role, Role::ToolOutput);
    }

    #[test]
    fn plain_message_row() {
        let msg = Message::user("Analyze SH600519");
        let row = NewMessage::from_message("conv", &msg);
        assert_eq!(row.role, "user");
        assert_eq!(row.message_type, "message");
        assert_eq!(stored(&row).to_message().unwrap().text(), "Analyze SH600519");
    }

    #[test]
    fn output_row_without_call_id_is_skipped() {
        let mut row = NewMessage::from_message("conv", &Message::tool_output("c1", "x"));
        row.metadata = None;
        assert!(stored(&row).to_message().is_none());
    }
}
