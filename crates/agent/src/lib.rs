//! The stock analysis agent.
//!
//! A user turn runs through a streaming **request → classify → stream text
//! or run tools → repeat** loop:
//!
//! 1. **Send** the context buffer and tool definitions to the provider
//! 2. **Classify** the response by its first distinguishing event
//! 3. **If text**: stream the deltas to the caller and finish
//! 4. **If tool calls**: run them, append call/output pairs, loop back to 1
//!
//! The loop stops on a text answer, a provider error, a departed caller or
//! the tool round limit.

pub mod loop_runner;
pub mod prompts;
pub mod reader;
pub mod session;
pub mod stream_event;

pub use loop_runner::{AgentLoop, TurnOutcome, title_from};
pub use prompts::{STOCK_ANALYST_PROMPT, system_prompt};
pub use reader::{FunctionCalls, ResponseKind, ResponseReader};
pub use session::{AgentSession, RegistryFactory, SessionError, SessionHandle, SessionManager, SessionStats};
pub use stream_event::TurnEvent;
