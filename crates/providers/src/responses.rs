//! Responses-API streaming provider.
//!
//! Works with Volcengine Ark (Doubao) and any endpoint that speaks the
//! OpenAI Responses protocol: `POST {base_url}/responses` with
//! `stream: true`, answered by SSE frames whose `data:` payload carries a
//! `type` such as `response.output_text.delta`.
//!
//! Supports:
//! - Function tools
//! - `previous_response_id` continuation
//! - Disabling the reasoning phase (`thinking: {type: disabled}`)

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use stockchat_config::ProviderConfig;
use stockchat_core::error::ProviderError;
use stockchat_core::message::{Message, MessageKind, Role};
use stockchat_core::provider::*;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A streaming provider for the Responses API.
pub struct ResponsesProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ResponsesProvider {
    /// Create a new Responses-API provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Build from the `[provider]` config section. Requires an API key.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured(
                "no API key; set provider.api_key or STOCKCHAT_API_KEY / DOUBAO_API_KEY".into(),
            )
        })?;
        Self::new(
            "doubao",
            &config.base_url,
            api_key,
            std::time::Duration::from_secs(config.timeout_secs),
        )
    }

    /// Convert buffer entries to Responses-API input items.
    fn to_api_input(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| match &m.kind {
                MessageKind::Message => json!({
                    "type": "message",
                    "role": match m.role {
                        Role::System => "system",
                        Role::Assistant => "assistant",
                        Role::User | Role::ToolOutput => "user",
                    },
                    "content": m.content.clone().unwrap_or_default(),
                }),
                MessageKind::FunctionCall {
                    call_id,
                    tool_name,
                    arguments,
                } => json!({
                    "type": "function_call",
                    "call_id": call_id,
                    "name": tool_name,
                    "arguments": arguments,
                }),
                MessageKind::FunctionCallOutput { call_id, output } => json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output,
                }),
            })
            .collect()
    }

    /// Convert tool definitions to Responses-API function tools.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.json_schema(),
                })
            })
            .collect()
    }

    fn build_body(request: &ProviderRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "input": Self::to_api_input(&request.input),
            "stream": true,
        });

        if !request.tools.is_empty() {
            body["tools"] = json!(Self::to_api_tools(&request.tools));
        }
        if let Some(id) = &request.previous_response_id {
            body["previous_response_id"] = json!(id);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max) = request.max_output_tokens {
            body["max_output_tokens"] = json!(max);
        }
        if request.disable_thinking {
            body["thinking"] = json!({ "type": "disabled" });
        }
        body
    }
}

#[async_trait]
impl Provider for ResponsesProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_continuation(&self) -> bool {
        true
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventStream, ProviderError> {
        let url = format!("{}/responses", self.base_url);
        let body = Self::build_body(&request);

        debug!(
            provider = %self.name,
            model = %request.model,
            input_items = request.input.len(),
            continuation = request.previous_response_id.is_some(),
            "Sending streaming request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            forward_sse(response.bytes_stream(), tx, &provider_name).await;
        });

        Ok(rx)
    }
}

/// Turn an SSE byte stream into response events on `tx`.
///
/// Lines are split on raw bytes so multi-byte characters spanning two
/// network chunks stay intact. `response.completed` ends the stream; if the
/// body ends (or sends `[DONE]`) first, the receiver gets
/// [`ProviderError::StreamInterrupted`] as its last item.
async fn forward_sse<S, B, E>(
    byte_stream: S,
    tx: mpsc::Sender<Result<ResponseEvent, ProviderError>>,
    provider_name: &str,
) where
    S: futures::Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut byte_stream = std::pin::pin!(byte_stream);
    let mut pending: Vec<u8> = Vec::new();

    'body: while let Some(chunk_result) = byte_stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                    .await;
                return;
            }
        };
        pending.extend_from_slice(bytes.as_ref());

        while let Some(line_end) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            // Skip empty lines, comments and `event:` names; the
            // payload repeats the event type.
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break 'body;
            }

            match parse_event(data) {
                Some(Ok(event)) => {
                    let terminal = matches!(event, ResponseEvent::Completed { .. });
                    if tx.send(Ok(event)).await.is_err() {
                        return; // receiver dropped
                    }
                    if terminal {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                None => {
                    trace!(
                        provider = %provider_name,
                        data = %data,
                        "Ignoring unparseable SSE frame"
                    );
                }
            }
        }
    }

    warn!(provider = %provider_name, "Stream closed without response.completed");
    let _ = tx
        .send(Err(ProviderError::StreamInterrupted(
            "stream closed before response.completed".into(),
        )))
        .await;
}

/// Parse one SSE `data:` payload. `None` means the payload is not JSON.
fn parse_event(data: &str) -> Option<Result<ResponseEvent, ProviderError>> {
    let event: ApiStreamEvent = serde_json::from_str(data).ok()?;
    let parsed = match event.event_type.as_str() {
        "response.created" => match event.response {
            Some(r) => Ok(ResponseEvent::Created { response_id: r.id }),
            None => Ok(ResponseEvent::Other {
                event_type: event.event_type,
            }),
        },
        "response.output_item.added" => match event.item {
            Some(item) => Ok(ResponseEvent::OutputItemAdded { item: item.into() }),
            None => Ok(ResponseEvent::Other {
                event_type: event.event_type,
            }),
        },
        "response.output_item.done" => match event.item {
            Some(item) => Ok(ResponseEvent::OutputItemDone { item: item.into() }),
            None => Ok(ResponseEvent::Other {
                event_type: event.event_type,
            }),
        },
        "response.output_text.delta" => Ok(ResponseEvent::TextDelta {
            delta: event.delta.unwrap_or_default(),
        }),
        "response.function_call_arguments.delta" => Ok(ResponseEvent::FunctionCallArgumentsDelta {
            delta: event.delta.unwrap_or_default(),
        }),
        "response.completed" => match event.response {
            Some(r) => Ok(ResponseEvent::Completed {
                response_id: r.id,
                output: r.output.into_iter().map(OutputItem::from).collect(),
            }),
            None => Err(ProviderError::StreamInterrupted(
                "response.completed without a response body".into(),
            )),
        },
        "response.failed" | "response.incomplete" => {
            let reason = event
                .response
                .and_then(|r| r.error.map(|e| e.message).or(r.incomplete_details.map(|d| d.to_string())))
                .unwrap_or_else(|| event.event_type.clone());
            Err(ProviderError::StreamInterrupted(reason))
        }
        "error" => Err(ProviderError::StreamInterrupted(
            event
                .message
                .or(event.error.map(|e| e.message))
                .unwrap_or_else(|| "provider reported an error".into()),
        )),
        _ => Ok(ResponseEvent::Other {
            event_type: event.event_type,
        }),
    };
    Some(parsed)
}

// --- Responses API types (internal) ---

/// A single SSE `data: {...}` payload.
#[derive(Debug, Deserialize)]
struct ApiStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    response: Option<ApiResponseBody>,
    #[serde(default)]
    item: Option<ApiOutputItem>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseBody {
    id: String,
    #[serde(default)]
    output: Vec<ApiOutputItem>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    incomplete_details: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiOutputItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    content: Vec<Value>,
}

impl From<ApiOutputItem> for OutputItem {
    fn from(item: ApiOutputItem) -> Self {
        match item.item_type.as_str() {
            "message" => OutputItem::Message {
                text: item
                    .content
                    .iter()
                    .filter(|part| part["type"] == "output_text")
                    .filter_map(|part| part["text"].as_str())
                    .collect(),
            },
            "function_call" => OutputItem::FunctionCall {
                call_id: item.call_id.unwrap_or_default(),
                name: item.name.unwrap_or_default(),
                arguments: item.arguments.unwrap_or_default(),
            },
            "reasoning" => OutputItem::Reasoning,
            _ => OutputItem::Other {
                item_type: item.item_type,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockchat_core::schema::{ParamSpec, ParamType, ParameterSchema};

    fn provider() -> ResponsesProvider {
        ResponsesProvider::new(
            "doubao",
            "https://ark.example.com/api/v3/",
            "sk-test",
            std::time::Duration::from_secs(5),
        )
        .unwrap()
    }

    fn parse(data: &str) -> ResponseEvent {
        parse_event(data).unwrap().unwrap()
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        assert_eq!(provider().base_url, "https://ark.example.com/api/v3");
        assert!(provider().supports_continuation());
    }

    #[test]
    fn from_config_requires_key() {
        let config = ProviderConfig::default();
        let err = ResponsesProvider::from_config(&config).err().unwrap();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn input_conversion_covers_all_kinds() {
        let messages = vec![
            Message::system("You are a stock analyst"),
            Message::user("Analyze SH600519"),
            Message::function_call("call_1", "get_stock_info", r#"{"symbol":"SH600519"}"#),
            Message::tool_output("call_1", "cash flow ..."),
            Message::assistant("Moutai looks strong"),
        ];
        let input = ResponsesProvider::to_api_input(&messages);
        assert_eq!(input.len(), 5);
        assert_eq!(input[0]["role"], "system");
        assert_eq!(input[1]["content"], "Analyze SH600519");
        assert_eq!(input[2]["type"], "function_call");
        assert_eq!(input[2]["name"], "get_stock_info");
        assert_eq!(input[3]["type"], "function_call_output");
        assert_eq!(input[3]["call_id"], "call_1");
        assert_eq!(input[4]["role"], "assistant");
    }

    #[test]
    fn body_includes_optional_fields() {
        let mut request = ProviderRequest::new("doubao-seed", vec![Message::user("hi")]);
        request.tools = vec![ToolDefinition {
            name: "get_stock_info".into(),
            description: "Financial data".into(),
            parameters: ParameterSchema::new()
                .param(ParamSpec::required("symbol", ParamType::String, "Symbol")),
        }];
        request.previous_response_id = Some("resp_1".into());
        request.disable_thinking = true;
        request.temperature = Some(0.3);

        let body = ResponsesProvider::build_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["parameters"]["required"][0], "symbol");
        assert_eq!(body["previous_response_id"], "resp_1");
        assert_eq!(body["thinking"]["type"], "disabled");
        assert!(body.get("max_output_tokens").is_none());
    }

    #[test]
    fn body_omits_unset_fields() {
        let body = ResponsesProvider::build_body(&ProviderRequest::new("m", vec![]));
        assert!(body.get("tools").is_none());
        assert!(body.get("previous_response_id").is_none());
        assert!(body.get("thinking").is_none());
    }

    // --- SSE parsing tests ---

    #[test]
    fn parse_created() {
        let event = parse(r#"{"type":"response.created","response":{"id":"resp_1","output":[]}}"#);
        assert_eq!(
            event,
            ResponseEvent::Created {
                response_id: "resp_1".into()
            }
        );
    }

    #[test]
    fn parse_function_call_item_added() {
        let event = parse(
            r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","call_id":"call_9","name":"get_stock_info","arguments":""}}"#,
        );
        assert_eq!(
            event,
            ResponseEvent::OutputItemAdded {
                item: OutputItem::FunctionCall {
                    call_id: "call_9".into(),
                    name: "get_stock_info".into(),
                    arguments: String::new(),
                }
            }
        );
    }

    #[test]
    fn parse_text_delta() {
        let event = parse(r#"{"type":"response.output_text.delta","delta":"贵州"}"#);
        assert_eq!(event, ResponseEvent::TextDelta { delta: "贵州".into() });
    }

    #[test]
    fn parse_completed_with_function_call() {
        let event = parse(
            r#"{"type":"response.completed","response":{"id":"resp_2","output":[{"type":"function_call","call_id":"c1","name":"search_arxiv_papers","arguments":"{\"query\":\"llm\"}"}]}}"#,
        );
        let ResponseEvent::Completed { response_id, output } = event else {
            panic!("expected completed");
        };
        assert_eq!(response_id, "resp_2");
        assert_eq!(
            output[0],
            OutputItem::FunctionCall {
                call_id: "c1".into(),
                name: "search_arxiv_papers".into(),
                arguments: r#"{"query":"llm"}"#.into(),
            }
        );
    }

    #[test]
    fn parse_completed_message_text() {
        let event = parse(
            r#"{"type":"response.completed","response":{"id":"r","output":[{"type":"reasoning","summary":[]},{"type":"message","role":"assistant","content":[{"type":"output_text","text":"Hello"}]}]}}"#,
        );
        let ResponseEvent::Completed { output, .. } = event else {
            panic!("expected completed");
        };
        assert_eq!(output[0], OutputItem::Reasoning);
        assert_eq!(output[1], OutputItem::Message { text: "Hello".into() });
    }

    #[test]
    fn parse_failed_is_error() {
        let result = parse_event(
            r#"{"type":"response.failed","response":{"id":"r","output":[],"error":{"code":"server_error","message":"overloaded"}}}"#,
        )
        .unwrap();
        assert!(matches!(result, Err(ProviderError::StreamInterrupted(ref m)) if m == "overloaded"));
    }

    #[test]
    fn parse_error_event() {
        let result = parse_event(r#"{"type":"error","code":"bad","message":"quota exceeded"}"#).unwrap();
        assert!(matches!(result, Err(ProviderError::StreamInterrupted(ref m)) if m == "quota exceeded"));
    }

    #[test]
    fn unknown_types_are_other() {
        let event = parse(r#"{"type":"response.content_part.added","part":{}}"#);
        assert_eq!(
            event,
            ResponseEvent::Other {
                event_type: "response.content_part.added".into()
            }
        );
    }

    #[test]
    fn non_json_is_ignored() {
        assert!(parse_event("not json").is_none());
    }

    fn frame(json: &str) -> Result<Vec<u8>, String> {
        Ok(format!("data: {json}\n\n").into_bytes())
    }

    async fn forward(chunks: Vec<Result<Vec<u8>, String>>) -> Vec<Result<ResponseEvent, ProviderError>> {
        let (tx, mut rx) = mpsc::channel(16);
        forward_sse(futures::stream::iter(chunks), tx, "test").await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    const CREATED: &str = r#"{"type":"response.created","response":{"id":"r1","output":[]}}"#;
    const COMPLETED: &str = r#"{"type":"response.completed","response":{"id":"r1","output":[]}}"#;

    #[tokio::test]
    async fn sse_frames_split_across_chunks_are_joined() {
        let delta = r#"data: {"type":"response.output_text.delta","delta":"贵州"}"#.as_bytes();
        // Split inside the first multi-byte character.
        let split = delta.len() - 6;
        let mut tail = delta[split..].to_vec();
        tail.extend_from_slice(b"\n\n");
        let events = forward(vec![
            Ok(format!("event: response.created\ndata: {CREATED}\n\n").into_bytes()),
            Ok(delta[..split].to_vec()),
            Ok(tail),
            frame(COMPLETED),
            frame(r#"{"type":"response.output_text.delta","delta":"after"}"#),
        ])
        .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[1].as_ref().unwrap(), &ResponseEvent::TextDelta { delta: "贵州".into() });
        assert!(matches!(events[2], Ok(ResponseEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn body_ending_before_completion_is_interrupted() {
        let events = forward(vec![
            frame(CREATED),
            frame(r#"{"type":"response.output_text.delta","delta":"Moutai revenue gr"}"#),
        ])
        .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], Ok(ResponseEvent::TextDelta { .. })));
        assert!(matches!(events[2], Err(ProviderError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn done_marker_before_completion_is_interrupted() {
        let events = forward(vec![
            frame(r#"{"type":"response.output_text.delta","delta":"partial"}"#),
            frame("[DONE]"),
        ])
        .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(ProviderError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn transport_error_is_interrupted() {
        let events = forward(vec![Err("connection reset".to_string())]).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(ProviderError::StreamInterrupted(ref m)) if m == "connection reset"));
    }
}
