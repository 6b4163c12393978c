//! Fail-over provider — wraps an ordered list of [`LlmProvider`]s as a
//! single fronting provider.
//!
//! For each call, providers are tried in order, skipping any whose cooldown
//! hasn't expired. A failure extends that provider's cooldown exponentially
//! (10s, 20s, 40s, … capped at 5 minutes); a success resets it. If every
//! provider fails, the last error is surfaced to the caller.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{info, warn};

use oxibot_core::types::{LlmResponse, Message, ToolDefinition};

use crate::traits::{LlmProvider, LlmRequestConfig};

const INITIAL_COOLDOWN_SECS: u64 = 10;
const MAX_COOLDOWN_SECS: u64 = 300;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-provider health bookkeeping: a cooldown expiry timestamp and the
/// current backoff exponent, so consecutive failures extend the cooldown
/// instead of resetting it to the initial value every time.
struct ProviderHealth {
    provider: Arc<dyn LlmProvider>,
    /// Unix timestamp (seconds) after which this provider may be retried.
    /// `0` means "no active cooldown".
    cooldown_until: AtomicI64,
    /// Number of consecutive failures, used to compute the next cooldown.
    failure_streak: AtomicU32,
}

impl ProviderHealth {
    fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            cooldown_until: AtomicI64::new(0),
            failure_streak: AtomicU32::new(0),
        }
    }

    fn is_available(&self) -> bool {
        self.cooldown_until.load(Ordering::SeqCst) <= now_secs()
    }

    fn record_failure(&self) {
        let streak = self.failure_streak.fetch_add(1, Ordering::SeqCst) + 1;
        let backoff = INITIAL_COOLDOWN_SECS.saturating_mul(1u64 << streak.min(6).saturating_sub(1));
        let backoff = backoff.min(MAX_COOLDOWN_SECS).max(INITIAL_COOLDOWN_SECS);
        self.cooldown_until.store(now_secs() + backoff as i64, Ordering::SeqCst);
        warn!(
            provider = self.provider.name(),
            cooldown_secs = backoff,
            failure_streak = streak,
            "provider marked unhealthy"
        );
    }

    fn record_success(&self) {
        self.failure_streak.store(0, Ordering::SeqCst);
        self.cooldown_until.store(0, Ordering::SeqCst);
    }
}

/// Wraps an ordered list of providers as one fronting provider.
///
/// `Name()` returns `"failover:<chain>"`, e.g. `"failover:anthropic,openai"`,
/// built from each wrapped provider's [`LlmProvider::name`].
pub struct FailoverProvider {
    chain: Vec<ProviderHealth>,
    name: String,
    default_model: String,
}

impl FailoverProvider {
    /// Build a fail-over chain. `providers` must be non-empty; the first
    /// entry's default model becomes the chain's default model.
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        assert!(!providers.is_empty(), "fail-over chain must have at least one provider");
        let names: Vec<String> = providers.iter().map(|p| p.name().to_string()).collect();
        let default_model = providers[0].default_model().to_string();
        Self {
            name: format!("failover:{}", names.join(",")),
            default_model,
            chain: providers.into_iter().map(ProviderHealth::new).collect(),
        }
    }

    /// Run the startup/idle health probe against every provider in the
    /// chain, resetting cooldowns for those that come back healthy.
    pub async fn probe_health(&self) {
        for entry in &self.chain {
            match entry.provider.healthy().await {
                Ok(()) => entry.record_success(),
                Err(e) => {
                    warn!(provider = entry.provider.name(), error = %e, "health probe failed");
                    entry.record_failure();
                }
            }
        }
    }

    /// Number of providers currently past their cooldown.
    pub fn available_count(&self) -> usize {
        self.chain.iter().filter(|e| e.is_available()).count()
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> LlmResponse {
        let mut last_error: Option<LlmResponse> = None;

        for entry in &self.chain {
            if !entry.is_available() {
                continue;
            }

            let response = entry.provider.chat(messages, tools, model, config).await;
            if response.error {
                entry.record_failure();
                last_error = Some(response);
                continue;
            }

            entry.record_success();
            info!(provider = entry.provider.name(), "fail-over served request");
            return LlmResponse {
                served_by: Some(entry.provider.name().to_string()),
                ..response
            };
        }

        last_error.unwrap_or_else(|| {
            LlmResponse::error("all providers in the fail-over chain are unavailable (cooldown)")
        })
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn healthy(&self) -> Result<(), String> {
        if self.available_count() > 0 {
            Ok(())
        } else {
            Err("no provider in the fail-over chain is currently healthy".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MockProvider {
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                LlmResponse::error(format!("{} is down", self.name))
            } else {
                LlmResponse {
                    content: Some(format!("ok from {}", self.name)),
                    ..Default::default()
                }
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            self.name
        }
    }

    fn mock(name: &'static str, fail: bool) -> Arc<dyn LlmProvider> {
        Arc::new(MockProvider {
            name,
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn first_healthy_provider_serves_the_call() {
        let chain = FailoverProvider::new(vec![mock("a", false), mock("b", false)]);
        let resp = chain
            .chat(&[], None, "model", &LlmRequestConfig::default())
            .await;
        assert_eq!(resp.served_by.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn failing_provider_advances_to_next() {
        let chain = FailoverProvider::new(vec![mock("a", true), mock("b", false)]);
        let resp = chain
            .chat(&[], None, "model", &LlmRequestConfig::default())
            .await;
        assert_eq!(resp.served_by.as_deref(), Some("b"));
        assert!(!resp.error);
    }

    #[tokio::test]
    async fn all_failing_surfaces_last_error() {
        let chain = FailoverProvider::new(vec![mock("a", true), mock("b", true)]);
        let resp = chain
            .chat(&[], None, "model", &LlmRequestConfig::default())
            .await;
        assert!(resp.error);
    }

    #[tokio::test]
    async fn failed_provider_enters_cooldown_and_is_skipped_next_call() {
        let a = mock("a", true);
        let b = mock("b", false);
        let chain = FailoverProvider::new(vec![a, b]);

        chain.chat(&[], None, "model", &LlmRequestConfig::default()).await;
        // "a" is now in cooldown; second call should go straight to "b"
        // without re-attempting "a".
        assert_eq!(chain.chain[0].is_available(), false);
        let resp = chain
            .chat(&[], None, "model", &LlmRequestConfig::default())
            .await;
        assert_eq!(resp.served_by.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn display_name_is_failover_chain() {
        let chain = FailoverProvider::new(vec![mock("anthropic", false), mock("openai", false)]);
        assert_eq!(chain.display_name(), "failover:anthropic,openai");
        assert_eq!(chain.name(), "failover:anthropic,openai");
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let a = mock("a", false);
        let chain = FailoverProvider::new(vec![a]);
        chain.chat(&[], None, "model", &LlmRequestConfig::default()).await;
        assert!(chain.chain[0].is_available());
    }
}
