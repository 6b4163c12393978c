//! OpenAI-compatible HTTP API and webhook ingress for Oxibot.
//!
//! Both surfaces are thin adapters onto the same `MessageBus` every other
//! channel publishes to and reads from — the OpenAI-compatible endpoint
//! additionally blocks on a [`pending::PendingResponses`] slot so a
//! synchronous HTTP caller gets back the agent's reply instead of a bare
//! "accepted".

pub mod openai;
pub mod pending;
pub mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::{OutboundMessage, StreamEventKind};
use oxibot_core::config::Config;

use pending::{PendingResponses, SlotResult};

/// Shared state for every handler mounted by [`build_router`].
pub struct ApiState {
    pub bus: Arc<MessageBus>,
    pub pending: Arc<PendingResponses>,
    /// Bearer token required on `/v1/*` requests. Empty disables the check.
    pub api_key: String,
    /// HMAC signing secret required on webhook requests. Empty disables
    /// signature verification.
    pub webhook_secret: String,
}

/// Build the combined router: the OpenAI-compatible surface under `/v1`
/// plus the webhook ingress at `webhook_path`.
pub fn build_router(state: Arc<ApiState>, webhook_path: &str) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::list_models))
        .route(webhook_path, post(webhook::ingest))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Subscribe an outbound-bus handler for the `"api"` channel that resolves
/// pending `/v1/chat/completions` slots as the agent loop's stream events
/// come back in. Only `done` and `error` events complete a slot; everything
/// else (thinking, tool events) is ignored since the HTTP caller only wants
/// the final answer.
pub async fn install_completion_bridge(bus: &MessageBus, pending: Arc<PendingResponses>) {
    bus.on_outbound(
        "api",
        Arc::new(move |msg: OutboundMessage| {
            let pending = pending.clone();
            Box::pin(async move {
                let Some(event) = msg.stream_event else {
                    return Ok(());
                };
                match event.kind {
                    StreamEventKind::Done => {
                        pending.complete(&msg.chat_id, SlotResult::Done(msg.content));
                    }
                    StreamEventKind::Error => {
                        pending.complete(&msg.chat_id, SlotResult::Error(msg.content));
                    }
                    _ => {}
                }
                Ok(())
            })
        }),
    )
    .await;
}

/// Run the HTTP server until the process is asked to shut down. Binds to
/// `config.gateway.host`/`config.gateway.port` — the single listen address
/// shared by both the OpenAI-compatible API and the webhook ingress.
pub async fn serve(config: &Config, bus: Arc<MessageBus>) -> anyhow::Result<()> {
    let pending = Arc::new(PendingResponses::new());
    install_completion_bridge(&bus, pending.clone()).await;

    let state = Arc::new(ApiState {
        bus,
        pending,
        api_key: config.api.api_key.clone(),
        webhook_secret: config.webhook.signing_secret.clone(),
    });

    let webhook_path = if config.webhook.path.is_empty() { "/webhook" } else { &config.webhook.path };
    let router = build_router(state, webhook_path);

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    info!(%addr, webhook_path, "starting HTTP API server");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
