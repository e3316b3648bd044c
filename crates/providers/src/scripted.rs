//! A provider that replays canned event sequences.
//!
//! Used by tests across the workspace to drive the agent loop without a
//! network: each `stream` call pops the next scripted response and records
//! the request it was given.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use stockchat_core::error::ProviderError;
use stockchat_core::provider::*;
use tokio::sync::mpsc;

/// One scripted response: the events its stream yields, in order.
pub type ScriptedResponse = Vec<Result<ResponseEvent, ProviderError>>;

pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
    continuation: bool,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            continuation: false,
        }
    }

    /// Advertise `previous_response_id` support.
    pub fn with_continuation(mut self) -> Self {
        self.continuation = true;
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// A plain-text response streamed as `deltas`.
    pub fn text_response(response_id: &str, deltas: &[&str]) -> ScriptedResponse {
        let mut events = vec![
            Ok(ResponseEvent::Created {
                response_id: response_id.into(),
            }),
            Ok(ResponseEvent::OutputItemAdded {
                item: OutputItem::Message { text: String::new() },
            }),
        ];
        events.extend(deltas.iter().map(|d| Ok(ResponseEvent::TextDelta { delta: (*d).into() })));
        events.push(Ok(ResponseEvent::Completed {
            response_id: response_id.into(),
            output: vec![OutputItem::Message {
                text: deltas.concat(),
            }],
        }));
        events
    }

    /// A response that asks for one function call.
    pub fn function_call_response(
        response_id: &str,
        call_id: &str,
        name: &str,
        arguments: &str,
    ) -> ScriptedResponse {
        let call = OutputItem::FunctionCall {
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        };
        vec![
            Ok(ResponseEvent::Created {
                response_id: response_id.into(),
            }),
            Ok(ResponseEvent::OutputItemAdded {
                item: OutputItem::FunctionCall {
                    call_id: call_id.into(),
                    name: name.into(),
                    arguments: String::new(),
                },
            }),
            Ok(ResponseEvent::FunctionCallArgumentsDelta {
                delta: arguments.into(),
            }),
            Ok(ResponseEvent::OutputItemDone { item: call.clone() }),
            Ok(ResponseEvent::Completed {
                response_id: response_id.into(),
                output: vec![call],
            }),
        ]
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_continuation(&self) -> bool {
        self.continuation
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventStream, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());
        let Some(events) = next else {
            return Err(ProviderError::NotConfigured("script exhausted".into()));
        };

        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity covers the whole script, so this never waits.
            let _ = tx.try_send(event);
        }
        Ok(rx)
    }
}
