//! HTTP API v1.
//!
//! Endpoints (relative to the `/api/v1` or `/api` mount point):
//!
//! - `POST   /chat`                       Send a message, receive an SSE stream
//! - `GET    /conversations`              List or search conversations
//! - `POST   /conversations`              Create a conversation
//! - `GET    /conversations/{id}`         Conversation with its messages
//! - `PATCH  /conversations/{id}`         Update title or summary
//! - `DELETE /conversations/{id}`         Delete a conversation
//! - `POST   /conversations/{id}/reset`   Clear the live session buffer
//! - `GET    /conversations/{id}/stats`   Live session statistics
//! - `GET    /tools`                      Tool definitions
//! - `GET    /health`                     Health with dependency status
//! - `GET    /health/liveness`            Process is up
//! - `GET    /health/readiness`           Store is reachable

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use stockchat_agent::{SessionError, SessionStats, TurnEvent};
use stockchat_core::error::StoreError;
use stockchat_core::message::ConversationId;
use stockchat_core::store::{ConversationRecord, ConversationUpdate, DEFAULT_TITLE, StoredMessage};

use crate::SharedState;

/// Longest accepted chat message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 10_000;
const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;
/// Messages returned with a single conversation.
const MAX_CONVERSATION_MESSAGES: u32 = 1_000;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the API router. Nest it under a prefix in the main router.
pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/chat", post(chat_handler))
        .route(
            "/conversations",
            get(list_conversations_handler).post(create_conversation_handler),
        )
        .route(
            "/conversations/{id}",
            get(get_conversation_handler)
                .patch(update_conversation_handler)
                .delete(delete_conversation_handler),
        )
        .route("/conversations/{id}/reset", post(reset_conversation_handler))
        .route("/conversations/{id}/stats", get(conversation_stats_handler))
        .route("/tools", get(list_tools_handler))
        .route("/health", get(health_handler))
        .route("/health/liveness", get(liveness_handler))
        .route("/health/readiness", get(readiness_handler))
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn store_error(e: StoreError) -> ApiError {
    error!(error = %e, "Conversation store failure");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "Conversation store unavailable")
}

fn not_found(id: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("Conversation not found: {id}"))
}

// ── Chat ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Payload of every SSE event on the chat stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatEventData {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatEventData {
    fn from_event(event: &TurnEvent, conversation_id: &str) -> Self {
        let (content, error, conversation_id) = match event {
            TurnEvent::Chunk { content } => (Some(content.clone()), None, conversation_id.to_string()),
            TurnEvent::Done { conversation_id, .. } => (None, None, conversation_id.clone()),
            TurnEvent::Error { message } => (None, Some(message.clone()), conversation_id.to_string()),
        };
        Self {
            event_type: event.event_type().to_string(),
            content,
            conversation_id,
            error,
        }
    }
}

/// `POST /chat`: Run one turn and stream it back as SSE.
async fn chat_handler(State(state): State<SharedState>, Json(payload): Json<ChatRequest>) -> Result<Response, ApiError> {
    let length = payload.message.chars().count();
    if payload.message.trim().is_empty() || length > MAX_MESSAGE_CHARS {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("message must be between 1 and {MAX_MESSAGE_CHARS} characters"),
        ));
    }

    let requested = payload.conversation_id.as_deref().filter(|id| !id.trim().is_empty());
    let handle = state.sessions.get_or_create(requested).await.map_err(|e| {
        error!(error = %e, "Could not open session");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Could not open session: {e}"))
    })?;

    let session = handle.try_begin_turn().map_err(|e| match e {
        SessionError::Busy(id) => api_error(
            StatusCode::CONFLICT,
            format!("Conversation {id} is already processing a message"),
        ),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    })?;

    let conversation_id = handle.id().to_string();
    info!(conversation_id = %conversation_id, message_length = length, "Chat request");

    let rx = state.agent.spawn_turn(session, payload.message);
    let stream = ReceiverStream::new(rx).map(move |event| {
        let data = serde_json::to_string(&ChatEventData::from_event(&event, &conversation_id)).unwrap_or_default();
        Ok::<_, Infallible>(SseEvent::default().event(event.event_type()).data(data))
    });

    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)));
    Ok((
        [(header::CACHE_CONTROL, "no-cache"), (header::HeaderName::from_static("x-accel-buffering"), "no")],
        sse,
    )
        .into_response())
}

// ── Conversations ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub skip: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub keyword: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationRecord>,
    pub total: u64,
}

/// `GET /conversations`
async fn list_conversations_handler(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    let skip = query.skip.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("limit must be between 1 and {MAX_PAGE_SIZE}"),
        ));
    }

    let keyword = query.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty());
    let (conversations, total) = match keyword {
        Some(keyword) => (
            state
                .store
                .search_conversations(keyword, skip, limit)
                .await
                .map_err(store_error)?,
            state.store.count_conversations(Some(keyword)).await.map_err(store_error)?,
        ),
        None => (
            state.store.recent_conversations(skip, limit).await.map_err(store_error)?,
            state.store.count_conversations(None).await.map_err(store_error)?,
        ),
    };

    Ok(Json(ConversationListResponse { conversations, total }))
}

#[derive(Debug, Default, Deserialize)]
struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
}

/// `POST /conversations`: The body is optional.
async fn create_conversation_handler(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ConversationRecord>), ApiError> {
    let request: CreateConversationRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateConversationRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid request body: {e}")))?
    };

    let title = request
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TITLE);
    let id = ConversationId::generate();

    let record = state
        .store
        .create_conversation(id.as_str(), title, None)
        .await
        .map_err(store_error)?;
    info!(conversation_id = %record.id, "Conversation created");
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: ConversationRecord,
    pub messages: Vec<StoredMessage>,
}

/// `GET /conversations/{id}`
async fn get_conversation_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let conversation = state
        .store
        .get_conversation(&id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found(&id))?;
    let messages = state
        .store
        .messages(&id, 0, MAX_CONVERSATION_MESSAGES)
        .await
        .map_err(store_error)?;

    Ok(Json(ConversationDetail { conversation, messages }))
}

/// `PATCH /conversations/{id}`
async fn update_conversation_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(update): Json<ConversationUpdate>,
) -> Result<Json<ConversationRecord>, ApiError> {
    if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "title must not be empty"));
    }

    state
        .store
        .update_conversation(&id, update)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

/// `DELETE /conversations/{id}`: Also drops the live session.
async fn delete_conversation_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    // Hold the live session's turn lock so a running turn cannot save the
    // conversation again after it is gone.
    let handle = state.sessions.get(&id).await;
    let _turn = match &handle {
        Some(handle) => Some(handle.try_begin_turn().map_err(|_| {
            api_error(
                StatusCode::CONFLICT,
                format!("Conversation {id} is processing a message and cannot be deleted"),
            )
        })?),
        None => None,
    };

    let stored = state.store.delete_conversation(&id).await.map_err(store_error)?;
    let live = state.sessions.remove(&id).await;

    if !stored && !live {
        return Err(not_found(&id));
    }
    info!(conversation_id = %id, "Conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /conversations/{id}/reset`
async fn reset_conversation_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let handle = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No active session: {id}")))?;

    let mut session = handle.try_begin_turn().map_err(|_| {
        api_error(
            StatusCode::CONFLICT,
            format!("Conversation {id} is already processing a message"),
        )
    })?;
    session.reset();
    info!(conversation_id = %id, "Session reset");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /conversations/{id}/stats`
async fn conversation_stats_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStats>, ApiError> {
    let handle = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No active session: {id}")))?;
    let stats = handle.lock().await.stats();
    Ok(Json(stats))
}

// ── Tools ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolInfo>,
    pub count: usize,
}

/// `GET /tools`
async fn list_tools_handler(State(state): State<SharedState>) -> Json<ToolListResponse> {
    let tools: Vec<ToolInfo> = state
        .tool_definitions
        .iter()
        .map(|def| ToolInfo {
            name: def.name.clone(),
            description: def.description.clone(),
            parameters: def.json_schema(),
        })
        .collect();
    let count = tools.len();
    Json(ToolListResponse { tools, count })
}

// ── Health ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub uptime_secs: i64,
    pub dependencies: Dependencies,
    pub sessions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Dependencies {
    pub database: String,
}

async fn store_is_healthy(state: &SharedState) -> bool {
    match state.store.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!(error = %e, "Store health check failed");
            false
        }
    }
}

/// `GET /health`
async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let database_ok = store_is_healthy(&state).await;
    Json(HealthResponse {
        status: if database_ok { "healthy" } else { "degraded" }.into(),
        version: env!("CARGO_PKG_VERSION").into(),
        environment: state.config.environment.clone(),
        uptime_secs: (chrono::Utc::now() - state.start_time).num_seconds(),
        dependencies: Dependencies {
            database: if database_ok { "healthy" } else { "unhealthy" }.into(),
        },
        sessions: state.sessions.len().await,
    })
}

/// `GET /health/liveness`
async fn liveness_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "alive" }))
}

/// `GET /health/readiness`
async fn readiness_handler(State(state): State<SharedState>) -> (StatusCode, Json<serde_json::Value>) {
    if store_is_healthy(&state).await {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready" })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_router;
    use crate::test_support::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use stockchat_providers::ScriptedProvider;
    use tower::ServiceExt;

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        serde_json::from_str(&body_string(response).await).unwrap()
    }

    /// Parse the `data:` lines of an SSE body.
    fn sse_events(body: &str) -> Vec<ChatEventData> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .filter(|data| !data.is_empty())
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn chat_streams_chunks_then_done() {
        let state = test_state(vec![ScriptedProvider::text_response("resp_1", &["Moutai ", "looks solid."])]);
        let app = build_router(state);

        let response = app
            .oneshot(json_request("POST", "/api/v1/chat", serde_json::json!({"message": "Hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(response.headers()["cache-control"], "no-cache");

        let body = body_string(response).await;
        assert!(body.contains("event: chunk"));
        assert!(body.contains("event: done"));

        let events = sse_events(&body);
        let text: String = events
            .iter()
            .filter(|e| e.event_type == "chunk")
            .filter_map(|e| e.content.clone())
            .collect();
        assert_eq!(text, "Moutai looks solid.");

        let last = events.last().unwrap();
        assert_eq!(last.event_type, "done");
        assert!(!last.conversation_id.is_empty());
        assert!(events.iter().all(|e| e.conversation_id == last.conversation_id));
    }

    #[tokio::test]
    async fn chat_with_tool_round_persists_conversation() {
        let state = test_state(vec![
            ScriptedProvider::function_call_response(
                "resp_1",
                "call_1",
                "get_stock_info",
                r#"{"symbol":"SH600519"}"#,
            ),
            ScriptedProvider::text_response("resp_2", &["Revenue grew."]),
        ]);
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/chat",
                serde_json::json!({"message": "Analyze SH600519", "conversation_id": "conv-tool"}),
            ))
            .await
            .unwrap();
        let events = sse_events(&body_string(response).await);
        assert_eq!(events.last().unwrap().event_type, "done");
        assert_eq!(events.last().unwrap().conversation_id, "conv-tool");

        let response = app
            .oneshot(empty_request("GET", "/api/v1/conversations/conv-tool"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: ConversationDetail = body_json(response).await;
        assert_eq!(detail.conversation.title, "Analyze SH600519");
        let types: Vec<&str> = detail.messages.iter().map(|m| m.message_type.as_str()).collect();
        assert_eq!(types, ["message", "function_call", "function_call_output", "message"]);
        assert_eq!(detail.messages[0].role, "user");
        assert_eq!(detail.messages[3].content.as_deref(), Some("Revenue grew."));
    }

    #[tokio::test]
    async fn chat_provider_failure_streams_error_event() {
        // An empty script makes the provider fail on first use.
        let app = build_router(test_state(vec![]));
        let response = app
            .oneshot(json_request("POST", "/api/chat", serde_json::json!({"message": "Hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = sse_events(&body_string(response).await);
        let last = events.last().unwrap();
        assert_eq!(last.event_type, "error");
        assert!(last.error.is_some());
        assert!(last.content.is_none());
    }

    #[tokio::test]
    async fn chat_rejects_empty_and_oversized_messages() {
        let app = build_router(test_state(vec![]));
        for message in [String::new(), "   ".to_string(), "x".repeat(MAX_MESSAGE_CHARS + 1)] {
            let response = app
                .clone()
                .oneshot(json_request("POST", "/api/v1/chat", serde_json::json!({"message": message})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
            let err: ErrorResponse = body_json(response).await;
            assert!(err.error.contains("message"));
        }
    }

    #[tokio::test]
    async fn chat_on_busy_session_conflicts() {
        let state = test_state(vec![ScriptedProvider::text_response("resp_1", &["unused"])]);
        let handle = state.sessions.get_or_create(Some("busy-conv")).await.unwrap();
        let _turn = handle.try_begin_turn().unwrap();

        let app = build_router(state.clone());
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/chat",
                serde_json::json!({"message": "Hi", "conversation_id": "busy-conv"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn create_list_and_search_conversations() {
        let app = build_router(test_state(vec![]));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/conversations",
                serde_json::json!({"title": "Moutai deep dive"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: ConversationRecord = body_json(response).await;
        assert_eq!(created.title, "Moutai deep dive");

        let response = app
            .clone()
            .oneshot(empty_request("POST", "/api/v1/conversations"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let untitled: ConversationRecord = body_json(response).await;
        assert_eq!(untitled.title, DEFAULT_TITLE);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/v1/conversations"))
            .await
            .unwrap();
        let list: ConversationListResponse = body_json(response).await;
        assert_eq!(list.total, 2);
        assert_eq!(list.conversations.len(), 2);

        let response = app
            .oneshot(empty_request("GET", "/api/v1/conversations?keyword=moutai&limit=5"))
            .await
            .unwrap();
        let list: ConversationListResponse = body_json(response).await;
        assert_eq!(list.total, 1);
        assert_eq!(list.conversations[0].id, created.id);
    }

    #[tokio::test]
    async fn list_rejects_out_of_range_limit() {
        let app = build_router(test_state(vec![]));
        for uri in ["/api/v1/conversations?limit=0", "/api/v1/conversations?limit=101"] {
            let response = app.clone().oneshot(empty_request("GET", uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{uri}");
        }
    }

    #[tokio::test]
    async fn create_rejects_malformed_body() {
        let app = build_router(test_state(vec![]));
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/conversations")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_and_delete_conversation() {
        let state = test_state(vec![]);
        state.store.create_conversation("c-1", "Old", None).await.unwrap();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/api/v1/conversations/c-1",
                serde_json::json!({"title": "New", "summary": "Liquor stocks"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated: ConversationRecord = body_json(response).await;
        assert_eq!(updated.title, "New");
        assert_eq!(updated.summary.as_deref(), Some("Liquor stocks"));

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/v1/conversations/c-1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", "/api/v1/conversations/c-1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_conversation_is_404() {
        let app = build_router(test_state(vec![]));
        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/api/v1/conversations/ghost",
                serde_json::json!({"title": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(empty_request("DELETE", "/api/v1/conversations/ghost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let err: ErrorResponse = body_json(response).await;
        assert!(err.error.contains("ghost"));
    }

    #[tokio::test]
    async fn reset_and_stats_need_live_session() {
        let state = test_state(vec![]);
        let app = build_router(state.clone());

        for (method, uri) in [
            ("POST", "/api/v1/conversations/none/reset"),
            ("GET", "/api/v1/conversations/none/stats"),
        ] {
            let response = app.clone().oneshot(empty_request(method, uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }

        state.sessions.get_or_create(Some("live")).await.unwrap();

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/v1/conversations/live/stats"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats: serde_json::Value = body_json(response).await;
        assert_eq!(stats["conversation_id"], "live");
        assert_eq!(stats["conversation_length"], 1);
        assert_eq!(stats["tools"].as_array().unwrap().len(), 2);

        let response = app
            .oneshot(empty_request("POST", "/api/v1/conversations/live/reset"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn reset_while_busy_conflicts() {
        let state = test_state(vec![]);
        let handle = state.sessions.get_or_create(Some("busy")).await.unwrap();
        let _turn = handle.try_begin_turn().unwrap();

        let response = build_router(state.clone())
            .oneshot(empty_request("POST", "/api/v1/conversations/busy/reset"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_while_busy_conflicts_and_keeps_conversation() {
        let state = test_state(vec![]);
        state.store.create_conversation("busy", "Moutai", None).await.unwrap();
        let handle = state.sessions.get_or_create(Some("busy")).await.unwrap();
        let turn = handle.try_begin_turn().unwrap();
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/v1/conversations/busy"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(state.store.get_conversation("busy").await.unwrap().is_some());
        assert_eq!(state.sessions.ids().await, vec!["busy"]);

        drop(turn);
        let response = app
            .oneshot(empty_request("DELETE", "/api/v1/conversations/busy"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.store.get_conversation("busy").await.unwrap().is_none());
        assert!(state.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn tools_lists_both_definitions() {
        let app = build_router(test_state(vec![]));
        let response = app.oneshot(empty_request("GET", "/api/v1/tools")).await.unwrap();
        let list: ToolListResponse = body_json(response).await;
        assert_eq!(list.count, 2);
        let names: Vec<&str> = list.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["get_stock_info", "search_arxiv_papers"]);
        assert_eq!(list.tools[0].parameters["required"][0], "symbol");
    }

    #[tokio::test]
    async fn health_reports_dependencies() {
        let app = build_router(test_state(vec![]));
        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/v1/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.dependencies.database, "healthy");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(health.sessions, 0);

        let response = app
            .oneshot(empty_request("GET", "/api/health/readiness"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
