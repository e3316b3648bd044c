//! Message domain types.
//!
//! A [`Message`] is one entry in a session's context buffer. Plain chat
//! messages carry text; function-call records carry the model's tool request
//! and tool outputs carry the result, correlated by `call_id`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation (one agent session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Generate a readable id of the form `YYYYMMDD-HHMMSS-NNNNN`.
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let suffix: u32 = rand::rng().random_range(10000..100000);
        Self(format!("{stamp}-{suffix}"))
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Result of a tool execution
    ToolOutput,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolOutput => "tool_output",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool_output" | "tool" => Some(Role::ToolOutput),
            _ => None,
        }
    }
}

/// Discriminates plain messages from function-call requests and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    FunctionCall {
        call_id: String,
        tool_name: String,
        /// Raw serialized arguments exactly as the model produced them.
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl MessageKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::FunctionCall { .. } => "function_call",
            MessageKind::FunctionCallOutput { .. } => "function_call_output",
        }
    }
}

/// A single entry in a context buffer. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Text content; absent for function-call records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: Option<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()), MessageKind::Message)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()), MessageKind::Message)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()), MessageKind::Message)
    }

    /// A function-call request issued by the model.
    pub fn function_call(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::new(
            Role::Assistant,
            None,
            MessageKind::FunctionCall {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                arguments: arguments.into(),
            },
        )
    }

    /// The output of a tool, answering the function call `call_id`.
    pub fn tool_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(
            Role::ToolOutput,
            None,
            MessageKind::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        )
    }

    /// The correlation id for function-call records and tool outputs.
    pub fn call_id(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::FunctionCall { call_id, .. }
            | MessageKind::FunctionCallOutput { call_id, .. } => Some(call_id),
            MessageKind::Message => None,
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self.kind, MessageKind::FunctionCall { .. })
    }

    pub fn is_tool_output(&self) -> bool {
        matches!(self.kind, MessageKind::FunctionCallOutput { .. })
    }

    /// Human-readable text for this entry: content for chat messages, the
    /// output for tool results and the arguments for function calls.
    pub fn text(&self) -> &str {
        match &self.kind {
            MessageKind::Message => self.content.as_deref().unwrap_or_default(),
            MessageKind::FunctionCall { arguments, .. } => arguments,
            MessageKind::FunctionCallOutput { output, .. } => output,
        }
    }
}

/// A function call extracted from one model response, consumed within the
/// same turn and never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: String,
}
