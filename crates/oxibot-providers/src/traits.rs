//! LLM Provider trait — the core abstraction replacing LiteLLM.
//!
//! Every LLM backend (OpenAI, Anthropic, DeepSeek, Groq, …) implements this trait.
//! The `HttpProvider` in `http_provider.rs` covers all OpenAI-compatible APIs.

use async_trait::async_trait;
use oxibot_core::types::{LlmResponse, Message, ToolDefinition};

/// Configuration passed to each LLM call.
///
#[derive(Clone, Debug)]
pub struct LlmRequestConfig {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 – 2.0).
    pub temperature: f64,
}

impl Default for LlmRequestConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Trait that all LLM providers must implement.
///
/// The main implementation is `HttpProvider` which handles any OpenAI-compatible API.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request.
    ///
    /// # Arguments
    /// * `messages` — Conversation history in OpenAI format.
    /// * `tools`    — Optional list of tool definitions the LLM can call.
    /// * `model`    — Model identifier (e.g. `"claude-sonnet-4-20250514"`, `"gpt-4o"`).
    /// * `config`   — Temperature, max_tokens, etc.
    ///
    /// # Returns
    /// An `LlmResponse` with content and/or tool calls.
    /// On API errors, returns `LlmResponse::error(...)` instead of propagating.
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> LlmResponse;

    /// The default model for this provider instance.
    fn default_model(&self) -> &str;

    /// Display name for logging.
    fn display_name(&self) -> &str;

    /// Stable identity used by the fail-over chain for cooldown bookkeeping
    /// and in `served_by`. Defaults to [`LlmProvider::display_name`]; a
    /// fail-over wrapper overrides it to `"failover:<chain>"`.
    fn name(&self) -> &str {
        self.display_name()
    }

    /// Liveness probe run at fail-over startup and periodically while idle.
    /// The default assumes a stateless HTTP provider is healthy until a real
    /// call proves otherwise — concrete providers override this with a
    /// cheap request (e.g. `GET /models`) where the backend supports one.
    async fn healthy(&self) -> Result<(), String> {
        Ok(())
    }
}
