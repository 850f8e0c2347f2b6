use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::error::ChatError;
use crate::functions::FunctionRegistry;
use crate::functions::hacker_news::HackerNewsClient;
use crate::llm::{ChatCompletionsDriver, ChatMessage, LlmSettings, Orchestrator};
use crate::rate_limit::{RateLimiter, rate_limit_middleware};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the application state from configuration.
pub fn build_state(config: &AppConfig, settings: LlmSettings) -> anyhow::Result<AppState> {
    let driver = Arc::new(ChatCompletionsDriver::new(settings));
    let hacker_news = HackerNewsClient::new(&config.hacker_news.base_url);
    let functions = FunctionRegistry::hacker_news(&hacker_news);

    for name in functions.names() {
        info!(name: "function.registered", function = %name, "Function registered");
    }

    let orchestrator = Orchestrator::new(driver, functions, config.chat.clone());
    let rate_limiter = RateLimiter::from_config(config)?;

    Ok(AppState {
        orchestrator: Arc::new(orchestrator),
        rate_limiter: Arc::new(rate_limiter),
    })
}

/// Routes with their middleware, ready to serve.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/chat",
            post(api_chat).route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                rate_limit_middleware,
            )),
        )
        .route("/healthz", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<()> {
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        "LLM configuration loaded"
    );

    let state = build_state(&config, settings)?;
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        environment = ?config.environment,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for chat API.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Conversation so far, oldest first.
    pub messages: Vec<ChatMessage>,
}

/// POST /api/chat - Answer the conversation as streamed plain text.
async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ChatError> {
    info!(
        name: "chat.request.received",
        message_count = req.messages.len(),
        "Received chat request"
    );

    let stream = state.orchestrator.respond(req.messages).await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}
