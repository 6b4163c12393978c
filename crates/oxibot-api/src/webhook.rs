//! Webhook ingress: `POST <configured path>`, optionally HMAC-signed.
//!
//! Accepts `{channel?, chat_id?, user_id?, content}`, fills in channel
//! defaults, and publishes an inbound message. Unlike the OpenAI-compatible
//! surface, this is fire-and-forget: the handler replies `202 Accepted` as
//! soon as the message is enqueued rather than waiting for a reply.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::warn;

use oxibot_core::bus::types::InboundMessage;

use crate::ApiState;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_CHANNEL: &str = "webhook";
const DEFAULT_CHAT_ID: &str = "webhook-default";

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub content: String,
}

/// `POST <webhook.path>`.
pub async fn ingest(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if !state.webhook_secret.is_empty() {
        match headers.get("X-Signature-256").and_then(|v| v.to_str().ok()) {
            None => return (StatusCode::UNAUTHORIZED, "missing X-Signature-256 header").into_response(),
            Some(sig) => {
                if !verify_signature(&state.webhook_secret, &body, sig) {
                    return (StatusCode::FORBIDDEN, "invalid signature").into_response();
                }
            }
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")).into_response();
        }
    };

    let channel = payload.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
    let chat_id = payload.chat_id.unwrap_or_else(|| DEFAULT_CHAT_ID.to_string());
    let sender_id = payload.user_id.unwrap_or_else(|| DEFAULT_CHAT_ID.to_string());

    let inbound = InboundMessage::new(channel, sender_id, chat_id, payload.content);
    if let Err(e) = state.bus.publish_inbound(inbound).await {
        warn!(error = %e, "failed to publish webhook inbound");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue message").into_response();
    }

    StatusCode::ACCEPTED.into_response()
}

/// Verify `sig` (formatted `sha256=<hex>`) is the HMAC-SHA256 of `body`
/// under `secret`.
fn verify_signature(secret: &str, body: &[u8], sig: &str) -> bool {
    let Some(hex_part) = sig.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected_bytes) = hex::decode(hex_part) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected_bytes).is_ok()
}
