//! The conversation context buffer.
//!
//! An ordered, append-only log of messages that forms the model input on
//! every round-trip. Tool outputs may only be appended after the function
//! call they answer, each call is answered at most once, and every function
//! call needs an id of its own; [`ContextBuffer::append`] rejects anything
//! else.

use std::collections::HashSet;

use crate::error::ContextError;
use crate::message::{Message, MessageKind, Role};

#[derive(Debug, Clone, Default)]
pub struct ContextBuffer {
    messages: Vec<Message>,
    requested_calls: HashSet<String>,
    answered_calls: HashSet<String>,
}

impl ContextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer seeded with the system prompt as its first entry.
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut buffer = Self::new();
        buffer.messages.push(Message::system(prompt));
        buffer
    }

    /// Append one message, preserving order.
    pub fn append(&mut self, message: Message) -> Result<(), ContextError> {
        match &message.kind {
            MessageKind::FunctionCall { call_id, .. } => {
                if self.requested_calls.contains(call_id) {
                    return Err(ContextError::DuplicateCallId {
                        call_id: call_id.clone(),
                    });
                }
                self.requested_calls.insert(call_id.clone());
            }
            MessageKind::FunctionCallOutput { call_id, .. } => {
                if !self.requested_calls.contains(call_id) {
                    return Err(ContextError::OrphanToolOutput {
                        call_id: call_id.clone(),
                    });
                }
                if !self.answered_calls.insert(call_id.clone()) {
                    return Err(ContextError::AlreadyAnswered {
                        call_id: call_id.clone(),
                    });
                }
            }
            MessageKind::Message => {}
        }
        self.messages.push(message);
        Ok(())
    }

    /// Read-only copy of the whole log, used to build the next request.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Copy of the entries appended at or after position `mark`.
    pub fn since(&self, mark: usize) -> Vec<Message> {
        self.messages.get(mark..).map(<[Message]>::to_vec).unwrap_or_default()
    }

    /// Drop everything except the leading system message.
    pub fn reset(&mut self) {
        let keep = usize::from(
            self.messages
                .first()
                .is_some_and(|m| m.role == Role::System),
        );
        self.messages.truncate(keep);
        self.requested_calls.clear();
        self.answered_calls.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> ContextBuffer {
        ContextBuffer::with_system_prompt("You are a stock analyst.")
    }

    #[test]
    fn system_prompt_is_first() {
        let buffer = seeded();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.messages()[0].role, Role::System);
    }

    #[test]
    fn append_preserves_order() {
        let mut buffer = seeded();
        buffer.append(Message::user("hi")).unwrap();
        buffer.append(Message::assistant("hello")).unwrap();
        let roles: Vec<Role> = buffer.snapshot().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[test]
    fn orphan_tool_output_is_rejected() {
        let mut buffer = seeded();
        let err = buffer.append(Message::tool_output("missing", "x")).unwrap_err();
        assert_eq!(
            err,
            ContextError::OrphanToolOutput {
                call_id: "missing".into()
            }
        );
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn tool_output_after_its_call_is_accepted() {
        let mut buffer = seeded();
        buffer.append(Message::function_call("c1", "echo", "{}")).unwrap();
        buffer.append(Message::tool_output("c1", "done")).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.last().unwrap().call_id(), Some("c1"));
    }

    #[test]
    fn repeated_call_id_is_rejected() {
        let mut buffer = seeded();
        buffer.append(Message::function_call("", "get_stock_info", "{}")).unwrap();
        let err = buffer
            .append(Message::function_call("", "search_arxiv_papers", "{}"))
            .unwrap_err();
        assert_eq!(err, ContextError::DuplicateCallId { call_id: String::new() });
        assert_eq!(buffer.len(), 2);

        // The first call still pairs with exactly one output.
        buffer.append(Message::tool_output("", "report")).unwrap();
        let err = buffer.append(Message::tool_output("", "papers")).unwrap_err();
        assert_eq!(err, ContextError::AlreadyAnswered { call_id: String::new() });
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut buffer = seeded();
        buffer.append(Message::user("hi")).unwrap();
        buffer.append(Message::function_call("c1", "echo", "{}")).unwrap();
        buffer.reset();
        let once = buffer.snapshot();
        buffer.reset();
        let twice = buffer.snapshot();
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
        assert_eq!(twice[0].role, Role::System);
    }

    #[test]
    fn reset_forgets_requested_calls() {
        let mut buffer = seeded();
        buffer.append(Message::function_call("c1", "echo", "{}")).unwrap();
        buffer.reset();
        assert!(buffer.append(Message::tool_output("c1", "late")).is_err());
    }

    #[test]
    fn reset_without_system_message_empties() {
        let mut buffer = ContextBuffer::new();
        buffer.append(Message::user("hi")).unwrap();
        buffer.reset();
        assert!(buffer.is_empty());
    }

    #[test]
    fn since_returns_tail() {
        let mut buffer = seeded();
        buffer.append(Message::user("a")).unwrap();
        buffer.append(Message::user("b")).unwrap();
        let tail = buffer.since(2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].text(), "b");
        assert!(buffer.since(10).is_empty());
    }
}
