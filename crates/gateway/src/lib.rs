//! HTTP API gateway for stockchat.
//!
//! Exposes the streaming chat endpoint, conversation management, tool
//! listing and health probes. The API is mounted under both `/api/v1` and
//! `/api`.
//!
//! Built on Axum.

pub mod api_v1;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, DefaultBodyLimit, Request};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use stockchat_agent::{AgentLoop, RegistryFactory, SessionManager, system_prompt};
use stockchat_config::{AppConfig, GatewayConfig};
use stockchat_core::error::ToolError;
use stockchat_core::provider::{Provider, ToolDefinition};
use stockchat_core::store::ConversationStore;
use stockchat_providers::ResponsesProvider;
use stockchat_tools::ToolClients;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub agent: Arc<AgentLoop>,
    pub sessions: Arc<SessionManager>,
    pub store: Arc<dyn ConversationStore>,
    /// Advertised tools, identical for every session.
    pub tool_definitions: Vec<ToolDefinition>,
    pub start_time: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

/// Wire the agent, sessions and store together.
pub fn build_state(
    config: AppConfig,
    provider: Arc<dyn Provider>,
    clients: ToolClients,
    store: Arc<dyn ConversationStore>,
) -> Result<SharedState, ToolError> {
    let tool_timeout = (config.agent.tool_timeout_secs > 0).then(|| Duration::from_secs(config.agent.tool_timeout_secs));
    let registry_factory: RegistryFactory = Arc::new(move || clients.registry(tool_timeout));
    let tool_definitions = registry_factory()?.definitions();

    let prompt = system_prompt(config.agent.system_prompt.as_deref()).to_string();
    let sessions = SessionManager::new(
        config.agent.max_sessions,
        prompt,
        config.provider.model.clone(),
        registry_factory,
    )
    .with_store(Arc::clone(&store));

    let agent = AgentLoop::from_config(provider, &config.provider, &config.agent).with_store(Arc::clone(&store));

    Ok(Arc::new(AppState {
        config,
        agent: Arc::new(agent),
        sessions: Arc::new(sessions),
        store,
        tool_definitions,
        start_time: Utc::now(),
    }))
}

/// Build the full router with its middleware stack:
/// - CORS from `gateway.cors_origins`
/// - request body size limit
/// - per-client sliding-window rate limiting (health probes exempt)
/// - request id stamping and HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let gateway = state.config.gateway.clone();

    let mut router = Router::new()
        .nest("/api/v1", api_v1::api_router())
        .nest("/api", api_v1::api_router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(gateway.max_body_bytes));

    if gateway.rate_limit_per_minute > 0 {
        let limiter = Arc::new(RateLimiter::new(
            gateway.rate_limit_per_minute as usize,
            Duration::from_secs(60),
        ));
        router = router.layer(middleware::from_fn(move |req, next| {
            let limiter = limiter.clone();
            rate_limit_middleware(limiter, req, next)
        }));
    }

    router
        .layer(cors_layer(&gateway))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn cors_layer(gateway: &GatewayConfig) -> CorsLayer {
    let origin = if gateway.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            gateway
                .cors_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([REQUEST_ID])
        .max_age(Duration::from_secs(3600))
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let store = stockchat_store::connect(&config.database.url, config.database.max_connections).await?;
    let provider: Arc<dyn Provider> = Arc::new(ResponsesProvider::from_config(&config.provider)?);
    let clients = ToolClients::from_config(&config.tools)?;
    let idle_secs = config.agent.session_idle_secs;

    let state = build_state(config, provider, clients, store)?;
    if idle_secs > 0 {
        state.sessions.spawn_idle_sweeper(Duration::from_secs(idle_secs));
    }

    let app = build_router(state);
    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// --- Rate Limiter ---

/// Simple in-memory sliding-window rate limiter.
///
/// Tracks request timestamps per client key (IP address).
/// Thread-safe via `std::sync::Mutex` (non-async, held briefly).
struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: std::sync::Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Check if the client is within rate limits. Returns `true` if allowed.
    fn check(&self, client_key: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        if clients.len() > 10_000 {
            clients.retain(|_, timestamps| {
                timestamps
                    .last()
                    .is_some_and(|t| now.duration_since(*t) < self.window)
            });
        }

        let timestamps = clients.entry(client_key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.max_requests {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// The client a request is attributed to: the first `x-forwarded-for`
/// hop, else the peer address, else "anonymous".
fn client_key(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn rate_limit_middleware(limiter: Arc<RateLimiter>, req: Request, next: Next) -> Response {
    // Health probes are polled by orchestrators and stay unlimited.
    if req.uri().path().contains("/health") {
        return next.run(req).await;
    }

    let client = client_key(&req);
    if !limiter.check(&client) {
        warn!(client = %client, "Rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(api_v1::ErrorResponse {
                error: "Too many requests, please slow down".into(),
            }),
        )
            .into_response();
    }
    next.run(req).await
}

/// Stamp every response with `x-request-id` and log the request.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "Request handled"
    );
    response
}
