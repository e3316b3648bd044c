//! Provider trait: the abstraction over the model backend.
//!
//! A Provider takes the context buffer plus the advertised tools and returns
//! the model's answer as a stream of [`ResponseEvent`]s. Events are typed by
//! their meaning (an output item was added, a text delta arrived, the
//! response completed) rather than by where they sit in the stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::Message;
use crate::schema::ParameterSchema;

/// One streaming request to the model.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// The model to use (e.g., "doubao-seed-1-6-251015")
    pub model: String,

    /// Input items: the full context buffer, or only the new tool outputs
    /// when `previous_response_id` is set.
    pub input: Vec<Message>,

    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,

    /// Continuation token of the response this request follows up on
    pub previous_response_id: Option<String>,

    pub temperature: Option<f32>,

    pub max_output_tokens: Option<u32>,

    /// Ask the backend to skip its reasoning phase where supported
    pub disable_thinking: bool,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, input: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            input,
            tools: Vec::new(),
            previous_response_id: None,
            temperature: None,
            max_output_tokens: None,
            disable_thinking: false,
        }
    }
}

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    /// The tool name, unique within a registry
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// Declared parameters
    pub parameters: ParameterSchema,
}

impl ToolDefinition {
    /// The parameters rendered as JSON Schema for the wire.
    pub fn json_schema(&self) -> serde_json::Value {
        self.parameters.to_json_schema()
    }
}

/// One item of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    /// Assistant text; empty while the item is still being streamed.
    Message { text: String },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    Reasoning,
    Other { item_type: String },
}

/// A semantically typed event from one streaming call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Created { response_id: String },
    OutputItemAdded { item: OutputItem },
    OutputItemDone { item: OutputItem },
    TextDelta { delta: String },
    FunctionCallArgumentsDelta { delta: String },
    Completed {
        response_id: String,
        output: Vec<OutputItem>,
    },
    /// Anything the reader does not need (usage, content parts, ...).
    Other { event_type: String },
}

/// Receiving half of a provider stream. A failure mid-stream arrives as an
/// `Err` item; closing the channel ends the stream.
pub type EventStream = mpsc::Receiver<Result<ResponseEvent, ProviderError>>;

/// The core Provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "doubao").
    fn name(&self) -> &str;

    /// Whether follow-up requests may pass `previous_response_id` instead of
    /// resending the whole history.
    fn supports_continuation(&self) -> bool {
        false
    }

    /// Send a request and get its event stream.
    async fn stream(&self, request: ProviderRequest) -> Result<EventStream, ProviderError>;

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}
