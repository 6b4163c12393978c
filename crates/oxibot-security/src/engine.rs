//! The Security Engine: blacklist/whitelist/confirm-pattern classification
//! for every tool call the agent loop wants to make, plus the user
//! confirmation handshake.

use std::sync::Arc;

use async_trait::async_trait;
use oxibot_core::records::{AuditResult, NewAuditEntry};
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::patterns::PatternList;

/// The outcome of [`SecurityEngine::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Confirm,
    Block,
}

/// What to do when a command matches none of the three pattern lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DefaultPolicy {
    Allow,
    Deny,
    #[default]
    Ask,
}

impl DefaultPolicy {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "allow" => Ok(DefaultPolicy::Allow),
            "deny" => Ok(DefaultPolicy::Deny),
            "ask" => Ok(DefaultPolicy::Ask),
            other => anyhow::bail!("unknown security default policy: {other}"),
        }
    }

    fn as_decision(self) -> Decision {
        match self {
            DefaultPolicy::Allow => Decision::Allow,
            DefaultPolicy::Deny => Decision::Block,
            DefaultPolicy::Ask => Decision::Confirm,
        }
    }
}

/// Static configuration for a [`SecurityEngine`], mirroring the `security`
/// config section.
#[derive(Clone, Debug)]
pub struct SecurityEngineConfig {
    pub default_policy: DefaultPolicy,
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
    pub confirm_patterns: Vec<String>,
    pub confirm_timeout_seconds: u64,
    pub pairing_required: bool,
    pub pairing_ttl_days: i64,
}

impl Default for SecurityEngineConfig {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::Ask,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            confirm_patterns: Vec::new(),
            confirm_timeout_seconds: 60,
            pairing_required: false,
            pairing_ttl_days: 30,
        }
    }
}

/// Callback a transport registers to route an interactive yes/no question
/// back through the originating channel. Returns `false` on denial or
/// timeout; the transport owns timeout enforcement.
#[async_trait]
pub trait ConfirmCallback: Send + Sync {
    async fn confirm(&self, question: &str) -> bool;
}

/// Compiled blacklist/whitelist/confirm-pattern classifier plus the
/// confirmation handshake. One instance is shared (via `Arc`) across the
/// agent loop and every transport.
pub struct SecurityEngine {
    default_policy: DefaultPolicy,
    blacklist: PatternList,
    whitelist: PatternList,
    confirm_patterns: PatternList,
    pub confirm_timeout_seconds: u64,
    audit: Arc<dyn AuditSink>,
}

impl SecurityEngine {
    pub fn new(config: &SecurityEngineConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            default_policy: config.default_policy,
            blacklist: PatternList::compile(&config.blacklist),
            whitelist: PatternList::compile(&config.whitelist),
            confirm_patterns: PatternList::compile(&config.confirm_patterns),
            confirm_timeout_seconds: config.confirm_timeout_seconds,
            audit,
        }
    }

    /// Classify a proposed tool invocation.
    ///
    /// Priority is strict: blacklist overrides whitelist overrides
    /// confirm-patterns overrides the default policy.
    pub async fn check(&self, tool: &str, command: &str) -> Decision {
        let trimmed = command.trim();

        if let Some(pattern) = self.blacklist.first_match(trimmed) {
            warn!(tool, command = trimmed, pattern, "command blocked by security blacklist");
            self.audit
                .log_audit(
                    NewAuditEntry::new("command_blocked", AuditResult::Blocked)
                        .with_tool(tool)
                        .with_command(trimmed)
                        .with_details(format!("matched blacklist pattern: {pattern}")),
                )
                .await;
            return Decision::Block;
        }

        if self.whitelist.first_match(trimmed).is_some() {
            info!(tool, command = trimmed, "command allowed by security whitelist");
            self.audit
                .log_audit(
                    NewAuditEntry::new("tool_exec", AuditResult::Allowed)
                        .with_tool(tool)
                        .with_command(trimmed),
                )
                .await;
            return Decision::Allow;
        }

        if self.confirm_patterns.first_match(trimmed).is_some() {
            return Decision::Confirm;
        }

        let decision = self.default_policy.as_decision();
        if decision == Decision::Allow {
            self.audit
                .log_audit(
                    NewAuditEntry::new("tool_exec", AuditResult::Allowed)
                        .with_tool(tool)
                        .with_command(trimmed),
                )
                .await;
        }
        decision
    }

    /// Ask the transport-supplied callback for confirmation. Returns `false`
    /// (deny) when no callback is registered — an engine with pairing/
    /// confirmation requirements but no interactive transport must fail
    /// closed, never open.
    pub async fn request_confirmation(
        &self,
        tool: &str,
        command: &str,
        callback: Option<&(dyn ConfirmCallback)>,
    ) -> bool {
        let trimmed = command.trim();
        let question = format!("Allow {tool} to run: `{trimmed}`?");

        let approved = match callback {
            Some(cb) => cb.confirm(&question).await,
            None => false,
        };

        let (action, result) = if approved {
            ("confirm_yes", AuditResult::Confirmed)
        } else {
            ("confirm_no", AuditResult::Denied)
        };
        self.audit
            .log_audit(
                NewAuditEntry::new(action, result)
                    .with_tool(tool)
                    .with_command(trimmed),
            )
            .await;

        approved
    }
}
