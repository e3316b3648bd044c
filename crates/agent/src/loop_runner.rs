//! The streaming tool-call orchestration loop.
//!
//! One user turn moves through these states:
//!
//! 1. **Awaiting model**: send the context buffer and the tool definitions
//! 2. **Streaming text**: forward each delta to the caller, append the
//!    final assistant message, finish
//! 3. **Tool call pending**: decode the call arguments
//! 4. **Tool executing**: dispatch every call, append call/output pairs,
//!    go back to 1 (continuing the previous response where supported)
//!
//! Tool failures become the tool's output text so the model can react.
//! Provider failures end the turn with an `error` event. The number of
//! tool round-trips per turn is capped.

use std::sync::Arc;

use serde_json::Value;
use stockchat_config::{AgentConfig, ProviderConfig};
use stockchat_core::error::{Error, ProviderError, ToolError};
use stockchat_core::message::{Message, ToolCallRecord};
use stockchat_core::provider::{Provider, ProviderRequest, ToolDefinition};
use stockchat_core::store::{ConversationStore, DEFAULT_TITLE, NewMessage};
use stockchat_core::tool::ToolRegistry;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{debug, info, warn};

use crate::reader::{DEFAULT_LOOKAHEAD, ResponseKind, ResponseReader};
use crate::session::AgentSession;
use crate::stream_event::TurnEvent;

/// Buffered events between a running turn and its consumer.
pub const TURN_CHANNEL_CAPACITY: usize = 16;

/// Characters of the first user message used as a conversation title.
const TITLE_CHARS: usize = 50;

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model produced its final answer.
    Completed { tool_rounds: u32 },
    /// The tool round-trip cap was hit and a cutoff message was sent.
    CutOff { tool_rounds: u32 },
    /// The provider failed; an `error` event was sent.
    Failed { message: String },
    /// The caller went away; no further calls were made.
    Cancelled,
}

/// The core agent loop: provider plus turn policy, shared by all sessions.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    disable_thinking: bool,
    max_tool_rounds: u32,
    use_continuation: bool,
    lookahead: usize,
    store: Option<Arc<dyn ConversationStore>>,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_output_tokens: None,
            disable_thinking: false,
            max_tool_rounds: 10,
            use_continuation: true,
            lookahead: DEFAULT_LOOKAHEAD,
            store: None,
        }
    }

    pub fn from_config(provider: Arc<dyn Provider>, provider_config: &ProviderConfig, agent: &AgentConfig) -> Self {
        let mut agent_loop = Self::new(provider, provider_config.model.clone())
            .with_max_tool_rounds(agent.max_tool_rounds)
            .with_continuation(agent.use_continuation)
            .with_disable_thinking(provider_config.disable_thinking);
        agent_loop.temperature = provider_config.temperature;
        agent_loop.max_output_tokens = provider_config.max_output_tokens;
        agent_loop
    }

    /// Set the maximum number of tool round-trips per turn.
    pub fn with_max_tool_rounds(mut self, max: u32) -> Self {
        self.max_tool_rounds = max;
        self
    }

    /// Follow up on the previous response instead of resending history,
    /// when the provider supports it.
    pub fn with_continuation(mut self, enabled: bool) -> Self {
        self.use_continuation = enabled;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    pub fn with_disable_thinking(mut self, disabled: bool) -> Self {
        self.disable_thinking = disabled;
        self
    }

    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead;
        self
    }

    /// Persist every turn's messages to `store`.
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tool_rounds(&self) -> u32 {
        self.max_tool_rounds
    }

    /// Run a turn on a background task, streaming its events.
    ///
    /// The session stays locked until the turn ends. Dropping the receiver
    /// cancels the turn at its next suspension point.
    pub fn spawn_turn(
        self: &Arc<Self>,
        mut session: OwnedMutexGuard<AgentSession>,
        user_message: String,
    ) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent.run(&mut session, &user_message, &tx).await;
        });
        rx
    }

    /// Process one user message, sending `chunk` events and then exactly
    /// one `done` or `error` event (none if the caller went away).
    pub async fn run(&self, session: &mut AgentSession, user_message: &str, tx: &mpsc::Sender<TurnEvent>) -> TurnOutcome {
        info!(
            conversation_id = session.id(),
            message_length = user_message.chars().count(),
            "Processing user turn"
        );

        let turn_start = session.buffer.len();
        let outcome = match session.buffer.append(Message::user(user_message)) {
            Ok(()) => self.drive(session, tx).await,
            Err(e) => TurnOutcome::Failed { message: e.to_string() },
        };

        self.persist(session, turn_start, user_message).await;

        let terminal = match &outcome {
            TurnOutcome::Completed { tool_rounds } | TurnOutcome::CutOff { tool_rounds } => Some(TurnEvent::Done {
                conversation_id: session.id().to_string(),
                tool_rounds: *tool_rounds,
            }),
            TurnOutcome::Failed { message } => Some(TurnEvent::Error {
                message: message.clone(),
            }),
            TurnOutcome::Cancelled => None,
        };
        if let Some(event) = terminal {
            let _ = tx.send(event).await;
        }

        info!(conversation_id = session.id(), outcome = ?outcome, "Turn finished");
        outcome
    }

    async fn drive(&self, session: &mut AgentSession, tx: &mpsc::Sender<TurnEvent>) -> TurnOutcome {
        let definitions = session.tools.definitions();
        let mut tool_rounds: u32 = 0;
        let mut previous_response_id: Option<String> = None;
        let mut call_mark = 0;

        loop {
            if tx.is_closed() {
                debug!(conversation_id = session.id(), "Caller gone, stopping turn");
                return TurnOutcome::Cancelled;
            }

            let request = self.build_request(session, &definitions, previous_response_id.take(), call_mark);
            debug!(
                conversation_id = session.id(),
                round = tool_rounds,
                input_items = request.input.len(),
                continued = request.previous_response_id.is_some(),
                "Requesting model response"
            );

            let stream = match self.provider.stream(request).await {
                Ok(stream) => stream,
                Err(e) => return provider_failure(session, e),
            };
            let mut reader = ResponseReader::new(stream).with_lookahead(self.lookahead);
            let kind = match reader.classify().await {
                Ok(kind) => kind,
                Err(e) => return provider_failure(session, e),
            };

            if kind == ResponseKind::Text {
                while let Some(delta) = reader.next_delta().await {
                    match delta {
                        Ok(delta) if delta.is_empty() => {}
                        Ok(delta) => {
                            if tx.send(TurnEvent::chunk(delta)).await.is_err() {
                                debug!(conversation_id = session.id(), "Caller gone mid-stream");
                                return TurnOutcome::Cancelled;
                            }
                        }
                        Err(e) => return provider_failure(session, e),
                    }
                }
                let answer = reader.into_text();
                if !answer.is_empty() {
                    self.append(session, Message::assistant(answer));
                }
                return TurnOutcome::Completed { tool_rounds };
            }

            let batch = match reader.finish_function_call().await {
                Ok(batch) => batch,
                Err(e) => return provider_failure(session, e),
            };

            if tool_rounds >= self.max_tool_rounds {
                warn!(
                    conversation_id = session.id(),
                    max_rounds = self.max_tool_rounds,
                    "Tool round limit reached, cutting the turn off"
                );
                let cutoff = Error::LoopBoundExceeded {
                    max_rounds: self.max_tool_rounds,
                }
                .to_string();
                self.append(session, Message::assistant(cutoff.clone()));
                if tx.send(TurnEvent::chunk(cutoff)).await.is_err() {
                    return TurnOutcome::Cancelled;
                }
                return TurnOutcome::CutOff { tool_rounds };
            }
            tool_rounds += 1;

            // Nothing has been appended for these calls yet; dropping them
            // here leaves the buffer consistent.
            if tx.is_closed() {
                return TurnOutcome::Cancelled;
            }

            let mut outputs = Vec::with_capacity(batch.calls.len());
            for call in &batch.calls {
                outputs.push(execute_call(&session.tools, call).await);
            }

            call_mark = session.buffer.len();
            for (call, output) in batch.calls.iter().zip(outputs) {
                let requested = self.append(
                    session,
                    Message::function_call(&call.call_id, &call.tool_name, &call.arguments),
                );
                // An output whose call was refused would answer an earlier call.
                if requested {
                    self.append(session, Message::tool_output(&call.call_id, output));
                }
            }
            previous_response_id = batch.response_id;
        }
    }

    fn build_request(
        &self,
        session: &AgentSession,
        definitions: &[ToolDefinition],
        previous_response_id: Option<String>,
        call_mark: usize,
    ) -> ProviderRequest {
        let continuation = previous_response_id.filter(|_| self.use_continuation && self.provider.supports_continuation());

        let input = match &continuation {
            // The provider already holds everything up to its last
            // response; only the new tool outputs go out.
            Some(_) => session
                .buffer
                .since(call_mark)
                .into_iter()
                .filter(|m| !m.is_function_call())
                .collect(),
            None => session.buffer.snapshot(),
        };

        let mut request = ProviderRequest::new(self.model.clone(), input);
        request.tools = definitions.to_vec();
        request.previous_response_id = continuation;
        request.temperature = self.temperature;
        request.max_output_tokens = self.max_output_tokens;
        request.disable_thinking = self.disable_thinking;
        request
    }

    /// Append to the buffer; `false` if the message was dropped.
    fn append(&self, session: &mut AgentSession, message: Message) -> bool {
        match session.buffer.append(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(conversation_id = session.id(), error = %e, "Dropped message that would break call pairing");
                false
            }
        }
    }

    /// Hand the messages appended during this turn to the store.
    async fn persist(&self, session: &AgentSession, turn_start: usize, user_message: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let conversation_id = session.id();

        if let Err(e) = store.ensure_conversation(conversation_id, &title_from(user_message)).await {
            warn!(conversation_id, error = %e, "Could not save conversation");
            return;
        }
        let new_messages = session.buffer.messages().get(turn_start..).unwrap_or_default();
        for message in new_messages {
            if let Err(e) = store.append_message(NewMessage::from_message(conversation_id, message)).await {
                warn!(conversation_id, error = %e, "Could not save message");
                return;
            }
        }
        debug!(conversation_id, saved = new_messages.len(), "Turn persisted");
    }
}

/// Run one requested call. Every failure becomes the output text.
async fn execute_call(tools: &ToolRegistry, call: &ToolCallRecord) -> String {
    info!(tool = %call.tool_name, call_id = %call.call_id, "Calling tool");

    let arguments = if call.arguments.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str::<Value>(&call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                let err = ToolError::ArgumentParse(e.to_string());
                warn!(tool = %call.tool_name, call_id = %call.call_id, error = %err, "Bad tool arguments");
                return format!("Error: {err}");
            }
        }
    };

    match tools.dispatch(&call.tool_name, &arguments).await {
        Ok(output) => output,
        Err(e) => format!("Error: {e}"),
    }
}

fn provider_failure(session: &AgentSession, error: ProviderError) -> TurnOutcome {
    warn!(conversation_id = session.id(), error = %error, "Provider stream failed");
    TurnOutcome::Failed {
        message: error.to_string(),
    }
}

/// Title for a conversation started by `user_message`.
pub fn title_from(user_message: &str) -> String {
    let title: String = user_message.trim().chars().take(TITLE_CHARS).collect();
    if title.is_empty() { DEFAULT_TITLE.to_string() } else { title }
}
