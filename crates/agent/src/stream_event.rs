//! Turn-level streaming events.
//!
//! `TurnEvent` is what the agent loop hands to its caller while a turn is
//! running. The gateway forwards them to clients as Server-Sent Events.

use serde::{Deserialize, Serialize};

/// Events emitted during one user turn.
///
/// - `chunk`: a fragment of the assistant's answer
/// - `done`: the turn finished; nothing follows
/// - `error`: the turn failed; nothing follows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Partial answer text.
    Chunk { content: String },

    /// The turn is complete.
    Done {
        conversation_id: String,
        tool_rounds: u32,
    },

    /// A provider failure ended the turn.
    Error { message: String },
}

impl TurnEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            content: content.into(),
        }
    }

    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_chunk() {
        let json = serde_json::to_string(&TurnEvent::chunk("Hello")).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert!(json.contains(r#""content":"Hello""#));
    }

    #[test]
    fn event_serialization_done() {
        let event = TurnEvent::Done {
            conversation_id: "20240115-093000-12345".into(),
            tool_rounds: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"done""#));
        assert!(json.contains(r#""tool_rounds":1"#));
    }

    #[test]
    fn event_roundtrip_error() {
        let event = TurnEvent::Error {
            message: "Stream interrupted: reset".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: TurnEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn event_type_names() {
        assert_eq!(TurnEvent::chunk("x").event_type(), "chunk");
        assert_eq!(
            TurnEvent::Error { message: "x".into() }.event_type(),
            "error"
        );
        assert!(!TurnEvent::chunk("x").is_terminal());
        assert!(TurnEvent::Error { message: "x".into() }.is_terminal());
    }
}
