//! # Stockchat Core
//!
//! Domain types, traits, and error definitions for the stock analysis chat
//! backend. Every collaborator of the agent loop (model provider, tools,
//! persistence) is a trait here; implementations live in their own crates
//! and all crates depend inward on this one.

pub mod buffer;
pub mod error;
pub mod message;
pub mod provider;
pub mod schema;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use buffer::ContextBuffer;
pub use error::{ContextError, Error, ProviderError, Result, StoreError, ToolError};
pub use message::{ConversationId, Message, MessageKind, Role, ToolCallRecord};
pub use provider::{EventStream, OutputItem, Provider, ProviderRequest, ResponseEvent, ToolDefinition};
pub use schema::{ParamSpec, ParamType, ParameterSchema, ToolParams};
pub use store::{ConversationRecord, ConversationStore, ConversationUpdate, NewMessage, StoredMessage};
pub use tool::{Tool, ToolRegistry, ToolStatsSnapshot};
