//! Tool Registry — thread-safe named store of available tools.
//!
//! The agent loop registers tools here and dispatches LLM tool-call requests
//! by name.

use std::collections::HashMap;
use std::sync::Arc;

use oxibot_core::types::ToolDefinition;
use tracing::{info, warn};

use super::base::Tool;

// ─────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────

/// Stores tools keyed by name and dispatches calls.
///
/// Owns `Arc<dyn Tool>` so tools can be shared across threads.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        info!(tool = tool.name(), "registered tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name. Returns the removed tool, if any.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        let removed = self.tools.remove(name);
        if removed.is_some() {
            info!(tool = name, "unregistered tool");
        }
        removed
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the LLM-facing definitions for all registered tools.
    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool by name with the given parameters.
    ///
    /// Convention: the LLM always gets a
    /// `String` back, even on failure.
    pub async fn execute(&self, name: &str, params: HashMap<String, serde_json::Value>) -> String {
        let tool = match self.tools.get(name) {
            Some(t) => t,
            None => {
                warn!(tool = name, "tool not found");
                return format!("Error: Tool '{name}' not found");
            }
        };

        match tool.execute(params).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                format!("Error executing {name}: {e}")
            }
        }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
