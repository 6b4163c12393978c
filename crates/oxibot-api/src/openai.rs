//! OpenAI-compatible HTTP surface: `POST /v1/chat/completions`, `GET /v1/models`.
//!
//! Lets any OpenAI SDK or tool talk to Oxibot as if it were talking to the
//! real API: the handler pulls the last `user` message out of the request,
//! publishes it to the bus as an ordinary inbound message on the `"api"`
//! channel, and blocks until the agent loop's matching `done` event arrives
//! (or the request's deadline expires).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use oxibot_core::bus::types::InboundMessage;

use crate::pending::SlotResult;
use crate::ApiState;

/// How long a `/v1/chat/completions` call waits for the matching `done`
/// event before giving up.
const COMPLETION_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    #[allow(dead_code)]
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub object: &'static str,
    pub owned_by: &'static str,
}

/// `GET /v1/models`.
pub async fn list_models() -> Json<ModelList> {
    Json(ModelList {
        object: "list",
        data: vec![ModelInfo {
            id: "openbot",
            object: "model",
            owned_by: "openbot",
        }],
    })
}

/// `POST /v1/chat/completions`.
pub async fn chat_completions(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    if let Some(resp) = check_bearer_auth(&state, &headers) {
        return resp;
    }

    let Some(user_text) = req.messages.iter().rev().find(|m| m.role == "user").map(|m| m.content.clone())
    else {
        return (StatusCode::BAD_REQUEST, "no user message in request").into_response();
    };

    let request_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    let rx = state.pending.register(&request_id);

    let mut inbound = InboundMessage::new("api", "api", request_id.clone(), user_text);
    if !req.model.is_empty() {
        inbound.provider = Some(req.model.clone());
    }

    if let Err(e) = state.bus.publish_inbound(inbound).await {
        warn!(error = %e, "failed to publish inbound from openai-compatible API");
        state.pending.cancel(&request_id);
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue request").into_response();
    }

    let content = match tokio::time::timeout(COMPLETION_DEADLINE, rx).await {
        Ok(Ok(SlotResult::Done(c))) => c,
        Ok(Ok(SlotResult::Error(c))) => c,
        Ok(Ok(SlotResult::Superseded)) => {
            return (StatusCode::CONFLICT, "superseded by a newer request").into_response();
        }
        Ok(Err(_)) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "response channel closed").into_response();
        }
        Err(_) => {
            state.pending.cancel(&request_id);
            return (StatusCode::GATEWAY_TIMEOUT, "timed out waiting for a response").into_response();
        }
    };

    let body = ChatCompletionResponse {
        id: request_id,
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model: req.model,
        choices: vec![Choice {
            index: 0,
            message: ChatMessage { role: "assistant".to_string(), content },
            finish_reason: "stop",
        }],
    };

    Json(body).into_response()
}

/// Validate `Authorization: Bearer <key>` against the configured API key.
/// Returns `None` (pass) when no key is configured or the header matches.
fn check_bearer_auth(state: &ApiState, headers: &HeaderMap) -> Option<Response> {
    if state.api_key.is_empty() {
        return None;
    }
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if key == state.api_key => None,
        _ => Some((StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingResponses;
    use oxibot_core::bus::queue::MessageBus;

    fn test_state(api_key: &str) -> Arc<ApiState> {
        Arc::new(ApiState {
            bus: Arc::new(MessageBus::new(16)),
            pending: Arc::new(PendingResponses::new()),
            api_key: api_key.to_string(),
            webhook_secret: String::new(),
        })
    }

    #[test]
    fn bearer_auth_passes_with_no_key_configured() {
        let state = test_state("");
        assert!(check_bearer_auth(&state, &HeaderMap::new()).is_none());
    }

    #[test]
    fn bearer_auth_rejects_missing_header_when_key_set() {
        let state = test_state("secret");
        let resp = check_bearer_auth(&state, &HeaderMap::new());
        assert!(resp.is_some());
    }

    #[test]
    fn bearer_auth_accepts_matching_token() {
        let state = test_state("secret");
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(check_bearer_auth(&state, &headers).is_none());
    }

    #[test]
    fn bearer_auth_rejects_wrong_token() {
        let state = test_state("secret");
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(check_bearer_auth(&state, &headers).is_some());
    }

    #[tokio::test]
    async fn list_models_returns_single_model() {
        let Json(list) = list_models().await;
        assert_eq!(list.data.len(), 1);
        assert_eq!(list.data[0].id, "openbot");
    }
}
