//! Reads one streaming model response and decides what it is.
//!
//! A response is either plain text (surfaced delta by delta) or a request
//! to call tools (collected whole, never surfaced). The decision is made on
//! the first event whose *type* settles it, not on its position in the
//! stream, and only a bounded number of events is inspected for it.

use std::collections::{HashSet, VecDeque};

use stockchat_core::error::ProviderError;
use stockchat_core::message::ToolCallRecord;
use stockchat_core::provider::{EventStream, OutputItem, ResponseEvent};
use tracing::{debug, warn};

/// How many events [`ResponseReader::classify`] looks at by default.
pub const DEFAULT_LOOKAHEAD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Text,
    FunctionCall,
}

/// The tool calls requested by one response.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCalls {
    /// Continuation token of the response that asked for the calls.
    pub response_id: Option<String>,
    pub calls: Vec<ToolCallRecord>,
}

pub struct ResponseReader {
    stream: EventStream,
    lookahead: usize,
    response_id: Option<String>,
    /// Text seen while classifying, not yet handed out.
    pending: VecDeque<String>,
    text: String,
    finished: bool,
    completed_output: Option<Vec<OutputItem>>,
    added_call: Option<(String, String)>,
    argument_buf: String,
    done_calls: Vec<ToolCallRecord>,
}

impl ResponseReader {
    pub fn new(stream: EventStream) -> Self {
        Self {
            stream,
            lookahead: DEFAULT_LOOKAHEAD,
            response_id: None,
            pending: VecDeque::new(),
            text: String::new(),
            finished: false,
            completed_output: None,
            added_call: None,
            argument_buf: String::new(),
            done_calls: Vec::new(),
        }
    }

    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead.max(1);
        self
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Read until the response's kind is known.
    ///
    /// A stream that ends, or runs past the lookahead, without a classifying
    /// event is treated as text.
    pub async fn classify(&mut self) -> Result<ResponseKind, ProviderError> {
        for _ in 0..self.lookahead {
            let Some(event) = self.stream.recv().await else {
                self.finished = true;
                debug!("Stream closed before classification, treating as empty text");
                return Ok(ResponseKind::Text);
            };

            match event? {
                ResponseEvent::Created { response_id } => self.response_id = Some(response_id),
                ResponseEvent::OutputItemAdded {
                    item: OutputItem::FunctionCall { call_id, name, arguments },
                } => {
                    self.argument_buf.push_str(&arguments);
                    self.added_call = Some((call_id, name));
                    return Ok(ResponseKind::FunctionCall);
                }
                ResponseEvent::OutputItemDone {
                    item: OutputItem::FunctionCall { call_id, name, arguments },
                } => {
                    self.done_calls.push(ToolCallRecord {
                        call_id,
                        tool_name: name,
                        arguments,
                    });
                    return Ok(ResponseKind::FunctionCall);
                }
                ResponseEvent::FunctionCallArgumentsDelta { delta } => {
                    self.argument_buf.push_str(&delta);
                    return Ok(ResponseKind::FunctionCall);
                }
                ResponseEvent::OutputItemAdded {
                    item: OutputItem::Message { .. },
                } => return Ok(ResponseKind::Text),
                ResponseEvent::OutputItemDone {
                    item: OutputItem::Message { text },
                } => {
                    if !text.is_empty() {
                        self.pending.push_back(text);
                    }
                    return Ok(ResponseKind::Text);
                }
                ResponseEvent::TextDelta { delta } => {
                    self.pending.push_back(delta);
                    return Ok(ResponseKind::Text);
                }
                ResponseEvent::Completed { response_id, output } => {
                    self.response_id = Some(response_id);
                    self.finished = true;
                    let kind = if output.iter().any(|i| matches!(i, OutputItem::FunctionCall { .. })) {
                        ResponseKind::FunctionCall
                    } else {
                        let text = message_text(&output);
                        if !text.is_empty() {
                            self.pending.push_back(text);
                        }
                        ResponseKind::Text
                    };
                    self.completed_output = Some(output);
                    return Ok(kind);
                }
                ResponseEvent::OutputItemAdded { .. }
                | ResponseEvent::OutputItemDone { .. }
                | ResponseEvent::Other { .. } => {}
            }
        }

        warn!(
            lookahead = self.lookahead,
            "No classifying event within lookahead, treating response as text"
        );
        Ok(ResponseKind::Text)
    }

    /// Next text fragment of a text response, or `None` at the end.
    ///
    /// A stream that closes after classification but before its completion
    /// event yields [`ProviderError::StreamInterrupted`].
    pub async fn next_delta(&mut self) -> Option<Result<String, ProviderError>> {
        if let Some(delta) = self.pending.pop_front() {
            self.text.push_str(&delta);
            return Some(Ok(delta));
        }

        while !self.finished {
            let Some(event) = self.stream.recv().await else {
                self.finished = true;
                return Some(Err(closed_early()));
            };
            match event {
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Ok(ResponseEvent::TextDelta { delta }) => {
                    self.text.push_str(&delta);
                    return Some(Ok(delta));
                }
                Ok(ResponseEvent::Created { response_id }) => self.response_id = Some(response_id),
                Ok(ResponseEvent::Completed { response_id, output }) => {
                    self.response_id = Some(response_id);
                    self.finished = true;
                    // A completion that carries text we never saw as deltas.
                    let text = message_text(&output);
                    if self.text.is_empty() && !text.is_empty() {
                        self.text.push_str(&text);
                        return Some(Ok(text));
                    }
                }
                Ok(_) => {}
            }
        }
        None
    }

    /// Everything surfaced by [`next_delta`](Self::next_delta) so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Drain a function-call response and collect its calls.
    ///
    /// Calls are taken from the completion event when it lists them, then
    /// from finished output items, then from the streamed argument deltas.
    /// The stream must reach its completion event; a call cut off before
    /// that is never returned. Missing or repeated call ids are replaced so
    /// each call in the batch has its own.
    pub async fn finish_function_call(mut self) -> Result<FunctionCalls, ProviderError> {
        while !self.finished {
            let Some(event) = self.stream.recv().await else {
                return Err(closed_early());
            };
            match event? {
                ResponseEvent::Created { response_id } => self.response_id = Some(response_id),
                ResponseEvent::OutputItemAdded {
                    item: OutputItem::FunctionCall { call_id, name, arguments },
                } => {
                    self.argument_buf = arguments;
                    self.added_call = Some((call_id, name));
                }
                ResponseEvent::FunctionCallArgumentsDelta { delta } => self.argument_buf.push_str(&delta),
                ResponseEvent::OutputItemDone {
                    item: OutputItem::FunctionCall { call_id, name, arguments },
                } => self.done_calls.push(ToolCallRecord {
                    call_id,
                    tool_name: name,
                    arguments,
                }),
                ResponseEvent::Completed { response_id, output } => {
                    self.response_id = Some(response_id);
                    self.completed_output = Some(output);
                    self.finished = true;
                }
                _ => {}
            }
        }

        let from_completion: Vec<ToolCallRecord> = self
            .completed_output
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| match item {
                OutputItem::FunctionCall { call_id, name, arguments } => Some(ToolCallRecord {
                    call_id,
                    tool_name: name,
                    arguments,
                }),
                _ => None,
            })
            .collect();

        let mut calls = if !from_completion.is_empty() {
            from_completion
        } else if !self.done_calls.is_empty() {
            self.done_calls
        } else if let Some((call_id, tool_name)) = self.added_call {
            vec![ToolCallRecord {
                call_id,
                tool_name,
                arguments: self.argument_buf,
            }]
        } else {
            return Err(ProviderError::StreamInterrupted(
                "function call response ended without a complete call".into(),
            ));
        };

        assign_unique_call_ids(&mut calls, self.response_id.as_deref());
        Ok(FunctionCalls {
            response_id: self.response_id,
            calls,
        })
    }
}

fn closed_early() -> ProviderError {
    ProviderError::StreamInterrupted("stream closed before response.completed".into())
}

fn assign_unique_call_ids(calls: &mut [ToolCallRecord], response_id: Option<&str>) {
    let mut seen = HashSet::new();
    for (index, call) in calls.iter_mut().enumerate() {
        if call.call_id.is_empty() || seen.contains(&call.call_id) {
            let replacement = format!("{}_call_{index}", response_id.unwrap_or("response"));
            warn!(
                original = %call.call_id,
                replacement = %replacement,
                tool = %call.tool_name,
                "Function call without a unique id"
            );
            call.call_id = replacement;
        }
        seen.insert(call.call_id.clone());
    }
}

fn message_text(output: &[OutputItem]) -> String {
    output
        .iter()
        .filter_map(|item| match item {
            OutputItem::Message { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn stream_of(events: Vec<Result<ResponseEvent, ProviderError>>) -> EventStream {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(event).unwrap();
        }
        rx
    }

    fn created(id: &str) -> Result<ResponseEvent, ProviderError> {
        Ok(ResponseEvent::Created { response_id: id.into() })
    }

    fn other(kind: &str) -> Result<ResponseEvent, ProviderError> {
        Ok(ResponseEvent::Other { event_type: kind.into() })
    }

    fn delta(text: &str) -> Result<ResponseEvent, ProviderError> {
        Ok(ResponseEvent::TextDelta { delta: text.into() })
    }

    fn completed(id: &str, output: Vec<OutputItem>) -> Result<ResponseEvent, ProviderError> {
        Ok(ResponseEvent::Completed {
            response_id: id.into(),
            output,
        })
    }

    fn call_item(arguments: &str) -> OutputItem {
        OutputItem::FunctionCall {
            call_id: "call_1".into(),
            name: "get_stock_info".into(),
            arguments: arguments.into(),
        }
    }

    async fn collect(reader: &mut ResponseReader) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(delta) = reader.next_delta().await {
            out.push(delta.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn text_response_surfaces_deltas() {
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r1"),
            other("response.in_progress"),
            Ok(ResponseEvent::OutputItemAdded {
                item: OutputItem::Message { text: String::new() },
            }),
            delta("Moutai "),
            delta("looks strong."),
            Ok(ResponseEvent::Completed {
                response_id: "r1".into(),
                output: vec![OutputItem::Message {
                    text: "Moutai looks strong.".into(),
                }],
            }),
        ]));

        assert_eq!(reader.classify().await.unwrap(), ResponseKind::Text);
        assert_eq!(collect(&mut reader).await, vec!["Moutai ", "looks strong."]);
        assert_eq!(reader.response_id(), Some("r1"));
        assert_eq!(reader.into_text(), "Moutai looks strong.");
    }

    #[tokio::test]
    async fn classification_does_not_depend_on_position() {
        // The function call item arrives fifth, after unrelated events.
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r2"),
            other("response.in_progress"),
            Ok(ResponseEvent::OutputItemAdded { item: OutputItem::Reasoning }),
            Ok(ResponseEvent::OutputItemDone { item: OutputItem::Reasoning }),
            Ok(ResponseEvent::OutputItemAdded { item: call_item("") }),
            Ok(ResponseEvent::FunctionCallArgumentsDelta {
                delta: r#"{"symbol":"#.into(),
            }),
            Ok(ResponseEvent::FunctionCallArgumentsDelta {
                delta: r#""SH600519"}"#.into(),
            }),
            Ok(ResponseEvent::Completed {
                response_id: "r2".into(),
                output: vec![OutputItem::Reasoning, call_item(r#"{"symbol":"SH600519"}"#)],
            }),
        ]));

        assert_eq!(reader.classify().await.unwrap(), ResponseKind::FunctionCall);
        let batch = reader.finish_function_call().await.unwrap();
        assert_eq!(batch.response_id.as_deref(), Some("r2"));
        assert_eq!(batch.calls.len(), 1);
        assert_eq!(batch.calls[0].tool_name, "get_stock_info");
        assert_eq!(batch.calls[0].arguments, r#"{"symbol":"SH600519"}"#);
    }

    #[tokio::test]
    async fn calls_fall_back_to_streamed_arguments() {
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r3"),
            Ok(ResponseEvent::OutputItemAdded { item: call_item("") }),
            Ok(ResponseEvent::FunctionCallArgumentsDelta {
                delta: r#"{"query":"#.into(),
            }),
            Ok(ResponseEvent::FunctionCallArgumentsDelta {
                delta: r#""momentum"}"#.into(),
            }),
            completed("r3", vec![]),
        ]));

        assert_eq!(reader.classify().await.unwrap(), ResponseKind::FunctionCall);
        let batch = reader.finish_function_call().await.unwrap();
        assert_eq!(batch.calls[0].call_id, "call_1");
        assert_eq!(batch.calls[0].arguments, r#"{"query":"momentum"}"#);
    }

    #[tokio::test]
    async fn multiple_calls_from_completion() {
        let second = OutputItem::FunctionCall {
            call_id: "call_2".into(),
            name: "search_arxiv_papers".into(),
            arguments: r#"{"query":"liquor"}"#.into(),
        };
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r4"),
            Ok(ResponseEvent::Completed {
                response_id: "r4".into(),
                output: vec![call_item("{}"), second],
            }),
        ]));

        assert_eq!(reader.classify().await.unwrap(), ResponseKind::FunctionCall);
        let batch = reader.finish_function_call().await.unwrap();
        let ids: Vec<&str> = batch.calls.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["call_1", "call_2"]);
    }

    #[tokio::test]
    async fn stream_without_classifying_event_is_empty_text() {
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r5"),
            other("response.in_progress"),
        ]));

        assert_eq!(reader.classify().await.unwrap(), ResponseKind::Text);
        assert!(collect(&mut reader).await.is_empty());
        assert_eq!(reader.text(), "");
    }

    #[tokio::test]
    async fn empty_stream_is_empty_text() {
        let mut reader = ResponseReader::new(stream_of(vec![]));
        assert_eq!(reader.classify().await.unwrap(), ResponseKind::Text);
        assert!(reader.next_delta().await.is_none());
    }

    #[tokio::test]
    async fn lookahead_is_bounded() {
        let mut events: Vec<_> = (0..10).map(|_| other("response.in_progress")).collect();
        events.push(delta("late"));
        events.push(completed("r8", vec![]));
        let mut reader = ResponseReader::new(stream_of(events)).with_lookahead(4);

        assert_eq!(reader.classify().await.unwrap(), ResponseKind::Text);
        // The rest of the stream is still read as text.
        assert_eq!(collect(&mut reader).await, vec!["late"]);
    }

    #[tokio::test]
    async fn completion_text_without_deltas_is_surfaced_once() {
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r6"),
            Ok(ResponseEvent::Completed {
                response_id: "r6".into(),
                output: vec![OutputItem::Message { text: "Hi".into() }],
            }),
        ]));

        assert_eq!(reader.classify().await.unwrap(), ResponseKind::Text);
        assert_eq!(collect(&mut reader).await, vec!["Hi"]);
        assert_eq!(reader.into_text(), "Hi");
    }

    #[tokio::test]
    async fn error_before_classification_is_returned() {
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r7"),
            Err(ProviderError::StreamInterrupted("upstream reset".into())),
        ]));
        let err = reader.classify().await.unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
    }

    #[tokio::test]
    async fn error_mid_text_is_surfaced() {
        let mut reader = ResponseReader::new(stream_of(vec![
            delta("partial"),
            Err(ProviderError::Network("connection reset".into())),
            delta("never"),
        ]));
        assert_eq!(reader.classify().await.unwrap(), ResponseKind::Text);
        assert_eq!(reader.next_delta().await.unwrap().unwrap(), "partial");
        assert!(reader.next_delta().await.unwrap().is_err());
        assert!(reader.next_delta().await.is_none());
    }

    #[tokio::test]
    async fn function_call_without_call_is_interrupted() {
        let mut reader = ResponseReader::new(stream_of(vec![Ok(ResponseEvent::FunctionCallArgumentsDelta {
            delta: "{".into(),
        })]));
        assert_eq!(reader.classify().await.unwrap(), ResponseKind::FunctionCall);
        let err = reader.finish_function_call().await.unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
    }

    #[tokio::test]
    async fn text_cut_off_before_completion_is_interrupted() {
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r9"),
            delta("Moutai revenue gr"),
        ]));
        assert_eq!(reader.classify().await.unwrap(), ResponseKind::Text);
        assert_eq!(reader.next_delta().await.unwrap().unwrap(), "Moutai revenue gr");
        let err = reader.next_delta().await.unwrap().unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
        assert!(reader.next_delta().await.is_none());
    }

    #[tokio::test]
    async fn truncated_call_arguments_are_never_returned() {
        let mut reader = ResponseReader::new(stream_of(vec![
            created("r10"),
            Ok(ResponseEvent::OutputItemAdded { item: call_item("") }),
            Ok(ResponseEvent::FunctionCallArgumentsDelta {
                delta: r#"{"symbol":"SH60"#.into(),
            }),
        ]));
        assert_eq!(reader.classify().await.unwrap(), ResponseKind::FunctionCall);
        let err = reader.finish_function_call().await.unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
    }

    #[tokio::test]
    async fn missing_and_repeated_call_ids_are_replaced() {
        let unnamed = |name: &str| OutputItem::FunctionCall {
            call_id: String::new(),
            name: name.into(),
            arguments: "{}".into(),
        };
        let mut reader = ResponseReader::new(stream_of(vec![completed(
            "r11",
            vec![unnamed("get_stock_info"), unnamed("search_arxiv_papers"), call_item("{}"), call_item("{}")],
        )]));

        assert_eq!(reader.classify().await.unwrap(), ResponseKind::FunctionCall);
        let batch = reader.finish_function_call().await.unwrap();
        let ids: Vec<&str> = batch.calls.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["r11_call_0", "r11_call_1", "call_1", "r11_call_3"]);
    }
}
