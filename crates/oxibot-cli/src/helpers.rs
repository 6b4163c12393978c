//! Shared CLI helpers — path expansion, response printing, version banner.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;

use oxibot_agent::AgentLoopOptions;
use oxibot_core::bus::events::EventBus;
use oxibot_core::config::Config;
use oxibot_security::{DefaultPolicy, SecurityEngine, SecurityEngineConfig};
use oxibot_security::pairing::PairingStore;
use oxibot_store::Store;

/// Expand `~` at the start of a path to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs_next::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Print an agent response to stdout.
pub fn print_response(response: &str, _render_markdown: bool) {
    // TODO: add termimad or similar markdown renderer when render_markdown=true
    println!();
    println!("{}", "🦀 Oxibot".cyan().bold());
    if response.is_empty() {
        println!("{}", "(no response)".dimmed());
    } else {
        println!("{response}");
    }
    println!();
}

/// Print the banner shown at REPL start.
pub fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!(
        "{}  v{}",
        "🦀 Oxibot".cyan().bold(),
        version.dimmed()
    );
    println!(
        "{}",
        "Type a message, or \"exit\" to quit.".dimmed()
    );
    println!();
}

/// Print a "thinking" spinner placeholder (for non-log mode).
pub fn print_thinking() {
    eprint!("{}", "⠿ thinking...".dimmed());
}

/// Clear the "thinking" placeholder.
pub fn clear_thinking() {
    eprint!("\r{}\r", " ".repeat(40));
}

/// Open the conversation store and assemble the security engine, event bus,
/// and pairing gate every entry point (gateway, REPL, cron job runner)
/// shares. The store backs both the audit log and the pairing handshake.
pub async fn build_agent_options(config: &Config) -> Result<AgentLoopOptions> {
    let db_path = expand_tilde(&config.memory.db_path);
    let store = Arc::new(
        Store::open(&db_path)
            .await
            .with_context(|| format!("failed to open conversation store at {}", db_path.display()))?,
    );

    let sec = &config.security;
    let security_config = SecurityEngineConfig {
        default_policy: DefaultPolicy::parse(&sec.default_policy)?,
        blacklist: sec.blacklist.clone(),
        whitelist: sec.whitelist.clone(),
        confirm_patterns: sec.confirm_patterns.clone(),
        confirm_timeout_seconds: sec.confirm_timeout_seconds,
        pairing_required: sec.pairing_required,
        pairing_ttl_days: sec.pairing_ttl_days,
    };
    let security = Arc::new(SecurityEngine::new(&security_config, store.clone()));

    let pairing = if sec.pairing_required {
        Some(Arc::new(PairingStore::new(store.clone(), sec.pairing_ttl_days)))
    } else {
        None
    };

    let defaults = &config.agents.defaults;
    Ok(AgentLoopOptions {
        security: Some(security),
        events: Some(Arc::new(EventBus::new())),
        conversation_store: Some(store),
        pairing,
        thinking_level: defaults.thinking_level.clone(),
        system_prompt_extra: defaults.system_prompt_extra.clone(),
        max_context_tokens: defaults.max_context_tokens,
        max_tokens_per_session: defaults.max_tokens_per_session,
        token_budget_alert: defaults.token_budget_alert,
    })
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────


