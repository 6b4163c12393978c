//! Config loader — reads `~/.oxibot/config.json`, merges env vars, and
//! applies legacy migrations.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `~/.oxibot/config.json`
//! 3. Environment variables `OXIBOT_<SECTION>__<FIELD>` (override JSON)

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::schema::Config;

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    crate::utils::get_data_path().join("config.json")
}

/// Load configuration from the default path + env vars.
///
/// Falls back to `Config::default()` if the file doesn't exist or can't be parsed.
pub fn load_config(path: Option<&Path>) -> Config {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    load_config_from_path(&config_path)
}

/// Load config from a specific file path.
fn load_config_from_path(path: &Path) -> Config {
    if !path.exists() {
        info!("No config file found at {}, using defaults", path.display());
        return apply_env_overrides(Config::default());
    }

    debug!("Loading config from {}", path.display());

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            return apply_env_overrides(Config::default());
        }
    };

    let content = expand_env_placeholders(&content);

    // Parse JSON → Value first for migration
    let mut raw: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to parse config JSON: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    // Apply legacy migrations
    migrate_config(&mut raw);

    // Deserialize into typed Config
    let config: Config = match serde_json::from_value(raw) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to deserialize config: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    clamp_config(apply_env_overrides(config))
}

/// Clamp fields documented with a hard range so a malformed config file
/// can't push the agent loop past values the spec treats as a ceiling
/// rather than a suggestion.
fn clamp_config(mut config: Config) -> Config {
    config.agents.defaults.max_tool_iterations =
        config.agents.defaults.max_tool_iterations.clamp(1, 200);
    config.agents.defaults.max_concurrent_messages =
        config.agents.defaults.max_concurrent_messages.clamp(1, 100);
    config
}

/// Save configuration to disk (pretty-printed JSON with camelCase keys).
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<()> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    // Ensure parent directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    std::fs::write(&config_path, json)?;
    debug!("Config saved to {}", config_path.display());
    Ok(())
}

/// Apply legacy config migrations.
///
/// Moves `tools.exec.restrictToWorkspace` → `tools.restrictToWorkspace`.
fn migrate_config(raw: &mut serde_json::Value) {
    // Migration: tools.exec.restrictToWorkspace → tools.restrictToWorkspace
    if let Some(tools) = raw.get_mut("tools") {
        if let Some(exec) = tools.get("exec") {
            if let Some(restrict) = exec.get("restrictToWorkspace") {
                if tools.get("restrictToWorkspace").is_none() {
                    let val = restrict.clone();
                    tools["restrictToWorkspace"] = val;
                    debug!("Migrated tools.exec.restrictToWorkspace → tools.restrictToWorkspace");
                }
            }
        }
    }
}

/// Expand `${VAR}` and `${VAR:-default}` placeholders in raw JSON text
/// against the process environment, before the document is parsed.
///
/// - `${VAR}` → `getenv(VAR)` if set and non-empty, else the empty string.
/// - `${VAR:-default}` → `getenv(VAR)` if set and non-empty, else `default`.
/// - A bare `$VAR` (no braces) is left untouched — only the braced form is
///   a placeholder.
fn expand_env_placeholders(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        rest = &rest[dollar..];

        if !rest.starts_with("${") {
            // Bare `$VAR` (no braces) is left untouched.
            out.push('$');
            rest = &rest[1..];
            continue;
        }

        match rest[2..].find('}') {
            Some(end) => {
                let inner = &rest[2..2 + end];
                let (var_name, default) = match inner.split_once(":-") {
                    Some((name, default)) => (name, Some(default)),
                    None => (inner, None),
                };
                let value = std::env::var(var_name).unwrap_or_default();
                if !value.is_empty() {
                    out.push_str(&value);
                } else if let Some(default) = default {
                    out.push_str(default);
                }
                rest = &rest[2 + end + 1..];
            }
            None => {
                // Unterminated `${` — emit verbatim.
                out.push_str(rest);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `OXIBOT_<SECTION>__<FIELD>` (double underscore as delimiter).
///
/// Supported overrides:
/// - `OXIBOT_AGENTS__DEFAULTS__MODEL` → `agents.defaults.model`
/// - `OXIBOT_AGENTS__DEFAULTS__MAX_TOKENS` → `agents.defaults.max_tokens`
/// - `OXIBOT_AGENTS__DEFAULTS__TEMPERATURE` → `agents.defaults.temperature`
/// - `OXIBOT_PROVIDERS__<NAME>__API_KEY` → `providers.<name>.api_key`
/// - `OXIBOT_PROVIDERS__<NAME>__API_BASE` → `providers.<name>.api_base`
/// - `OXIBOT_GATEWAY__HOST` → `gateway.host`
/// - `OXIBOT_GATEWAY__PORT` → `gateway.port`
/// - `OXIBOT_TOOLS__RESTRICT_TO_WORKSPACE` → `tools.restrict_to_workspace`
fn apply_env_overrides(mut config: Config) -> Config {
    // Agent defaults
    if let Ok(val) = std::env::var("OXIBOT_AGENTS__DEFAULTS__MODEL") {
        config.agents.defaults.model = val;
    }
    if let Ok(val) = std::env::var("OXIBOT_AGENTS__DEFAULTS__MAX_TOKENS") {
        if let Ok(n) = val.parse::<u32>() {
            config.agents.defaults.max_tokens = n;
        }
    }
    if let Ok(val) = std::env::var("OXIBOT_AGENTS__DEFAULTS__TEMPERATURE") {
        if let Ok(t) = val.parse::<f64>() {
            config.agents.defaults.temperature = t;
        }
    }
    if let Ok(val) = std::env::var("OXIBOT_AGENTS__DEFAULTS__MAX_TOOL_ITERATIONS") {
        if let Ok(n) = val.parse::<u32>() {
            config.agents.defaults.max_tool_iterations = n;
        }
    }
    if let Ok(val) = std::env::var("OXIBOT_AGENTS__DEFAULTS__WORKSPACE") {
        config.agents.defaults.workspace = val;
    }

    // Provider API keys (by provider name)
    apply_provider_env(&mut config.providers.anthropic, "ANTHROPIC");
    apply_provider_env(&mut config.providers.openai, "OPENAI");
    apply_provider_env(&mut config.providers.openrouter, "OPENROUTER");
    apply_provider_env(&mut config.providers.deepseek, "DEEPSEEK");
    apply_provider_env(&mut config.providers.groq, "GROQ");
    apply_provider_env(&mut config.providers.zhipu, "ZHIPU");
    apply_provider_env(&mut config.providers.dashscope, "DASHSCOPE");
    apply_provider_env(&mut config.providers.vllm, "VLLM");
    apply_provider_env(&mut config.providers.gemini, "GEMINI");
    apply_provider_env(&mut config.providers.moonshot, "MOONSHOT");
    apply_provider_env(&mut config.providers.minimax, "MINIMAX");
    apply_provider_env(&mut config.providers.aihubmix, "AIHUBMIX");

    // Gateway
    if let Ok(val) = std::env::var("OXIBOT_GATEWAY__HOST") {
        config.gateway.host = val;
    }
    if let Ok(val) = std::env::var("OXIBOT_GATEWAY__PORT") {
        if let Ok(p) = val.parse::<u16>() {
            config.gateway.port = p;
        }
    }

    // Tools
    if let Ok(val) = std::env::var("OXIBOT_TOOLS__RESTRICT_TO_WORKSPACE") {
        config.tools.restrict_to_workspace = val == "true" || val == "1";
    }

    config
}

/// Apply env var overrides for a single provider.
fn apply_provider_env(provider: &mut super::schema::ProviderConfig, name: &str) {
    if let Ok(val) = std::env::var(format!("OXIBOT_PROVIDERS__{name}__API_KEY")) {
        provider.api_key = val;
    }
    if let Ok(val) = std::env::var(format!("OXIBOT_PROVIDERS__{name}__API_BASE")) {
        provider.api_base = Some(val);
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
