//! Agent loop — the LLM ↔ tool-calling main loop.
//!
//! Receives inbound messages, builds context, calls the LLM, dispatches
//! tool calls (gated by the security engine when one is configured),
//! persists the turn, and publishes outbound responses with stream events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use oxibot_core::bus::events::{AppEvent, EventBus};
use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::{InboundMessage, OutboundMessage, StreamEvent, StreamEventKind};
use oxibot_core::records::NewMessage;
use oxibot_core::session::manager::SessionManager;
use oxibot_core::types::{ContentPart, Message, MessageContent, ToolCall};
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};
use oxibot_security::pairing::PairingStore;
use oxibot_security::{Decision, SecurityEngine};
use oxibot_store::Store;

use crate::context::ContextBuilder;
use crate::subagent::SubagentManager;
use crate::tools::message::MessageTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// Default maximum LLM ↔ tool iterations per user message.
const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Configuration for the exec tool.
#[derive(Clone, Debug)]
pub struct ExecToolConfig {
    /// Timeout in seconds (default 60).
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

/// Extra agent-loop knobs layered on top of the original constructor
/// arguments — kept in their own struct so `AgentLoop::new` doesn't grow an
/// eighteenth positional parameter every time a config field is added.
#[derive(Clone)]
pub struct AgentLoopOptions {
    /// Security engine gating every tool call. `None` runs every tool
    /// unchecked, matching a deployment with `security.defaultPolicy: allow`.
    pub security: Option<Arc<SecurityEngine>>,
    /// Internal observability event bus.
    pub events: Option<Arc<EventBus>>,
    /// Durable conversation store. `None` keeps history in the
    /// `SessionManager`'s JSONL files only.
    pub conversation_store: Option<Arc<Store>>,
    /// First-contact pairing gate. `None` disables pairing — every sender
    /// is treated as already authorized, matching `security.pairingRequired: false`.
    pub pairing: Option<Arc<PairingStore>>,
    pub thinking_level: String,
    pub system_prompt_extra: String,
    /// Token budget for the assembled prompt. `0` disables trimming.
    pub max_context_tokens: u32,
    /// Hard per-session token cap. `0` disables the cap.
    pub max_tokens_per_session: u32,
    /// Threshold for a one-time budget warning. `0` disables the alert.
    pub token_budget_alert: u32,
}

impl Default for AgentLoopOptions {
    fn default() -> Self {
        Self {
            security: None,
            events: None,
            conversation_store: None,
            pairing: None,
            thinking_level: "normal".to_string(),
            system_prompt_extra: String::new(),
            max_context_tokens: 100_000,
            max_tokens_per_session: 1_000_000,
            token_budget_alert: 800_000,
        }
    }
}

/// Outcome of a single conversational turn: either the model's final answer
/// or an error that should be surfaced as a terminal `Error` stream event.
enum TurnOutcome {
    Done(String),
    Error(String),
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The main agent loop: polls the message bus, calls the LLM, dispatches tools.
pub struct AgentLoop {
    /// Message bus for inbound/outbound messages.
    bus: Arc<MessageBus>,
    /// LLM provider.
    provider: Arc<dyn LlmProvider>,
    /// Workspace root.
    workspace: PathBuf,
    /// Model to use (overrides provider default if set).
    model: String,
    /// Max LLM ↔ tool iterations per message.
    max_iterations: usize,
    /// LLM request config (temperature, max_tokens).
    request_config: LlmRequestConfig,
    /// Tool registry.
    tools: ToolRegistry,
    /// Context builder.
    context: ContextBuilder,
    /// Session manager.
    sessions: SessionManager,
    /// Reference to the message tool (for set_context).
    message_tool: Arc<MessageTool>,
    /// Spawn tool reference (for set_context).
    spawn_tool: Arc<SpawnTool>,
    /// Subagent manager (also held by SpawnTool; kept for direct access).
    #[allow(dead_code)]
    subagent_manager: Arc<SubagentManager>,
    /// Security engine gating tool execution, if configured.
    security: Option<Arc<SecurityEngine>>,
    /// Durable conversation store, if configured.
    store: Option<Arc<Store>>,
    /// First-contact pairing gate, if configured.
    pairing: Option<Arc<PairingStore>>,
    /// Internal observability event bus, if configured.
    events: Option<Arc<EventBus>>,
    thinking_level: String,
    system_prompt_extra: String,
    max_context_tokens: u32,
    max_tokens_per_session: u32,
    token_budget_alert: u32,
    /// Cumulative tokens spent per session key this process lifetime, for
    /// `max_tokens_per_session`/`token_budget_alert` enforcement.
    session_tokens: Mutex<HashMap<String, u64>>,
}

impl AgentLoop {
    /// Create a new agent loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        model: Option<String>,
        max_iterations: Option<usize>,
        request_config: Option<LlmRequestConfig>,
        brave_api_key: Option<String>,
        exec_config: Option<ExecToolConfig>,
        restrict_to_workspace: bool,
        session_manager: Option<SessionManager>,
        agent_name: Option<String>,
        options: Option<AgentLoopOptions>,
    ) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        let max_iterations = max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        let request_config = request_config.unwrap_or_default();
        let exec_config = exec_config.unwrap_or_default();
        let agent_name = agent_name.unwrap_or_else(|| "Oxibot".into());
        let sessions =
            session_manager.unwrap_or_else(|| SessionManager::new(None).expect("failed to create session manager"));
        let options = options.unwrap_or_default();

        let context = ContextBuilder::new(&workspace, &agent_name);

        // Build tool registry
        let mut tools = ToolRegistry::new();
        let allowed_dir = if restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(ExecTool::new(
            workspace.clone(),
            Some(exec_config.timeout),
            restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(brave_api_key.clone())));
        tools.register(Arc::new(WebFetchTool::new()));

        let message_tool = Arc::new(MessageTool::new(None));
        tools.register(message_tool.clone());

        // Subagent manager + spawn tool
        let subagent_manager = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model.clone(),
            brave_api_key,
            exec_config,
            restrict_to_workspace,
            request_config.clone(),
        ));

        let spawn_tool = Arc::new(SpawnTool::new(subagent_manager.clone()));
        tools.register(spawn_tool.clone());

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = max_iterations,
            security_enabled = options.security.is_some(),
            store_enabled = options.conversation_store.is_some(),
            "agent loop initialized"
        );

        Self {
            bus,
            provider,
            workspace,
            model,
            max_iterations,
            request_config,
            tools,
            context,
            sessions,
            message_tool,
            spawn_tool,
            subagent_manager,
            security: options.security,
            store: options.conversation_store,
            pairing: options.pairing,
            events: options.events,
            thinking_level: options.thinking_level,
            system_prompt_extra: options.system_prompt_extra,
            max_context_tokens: options.max_context_tokens,
            max_tokens_per_session: options.max_tokens_per_session,
            token_budget_alert: options.token_budget_alert,
            session_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Run the event loop: poll inbound messages and process them.
    ///
    /// This runs indefinitely until the inbound channel is closed.
    pub async fn run(&self) {
        info!("agent loop started, waiting for messages");
        loop {
            match self.bus.consume_inbound().await {
                Some(msg) => {
                    let session_key = msg.session_key();
                    debug!(session_key = %session_key, "received message");

                    // Route system messages (from subagents) vs regular messages
                    let result = if msg.channel == "system" && msg.sender_id == "subagent" {
                        self.process_system_message(&msg).await
                    } else {
                        self.process_message(&msg).await
                    };

                    match result {
                        Ok(response) => {
                            if let Err(e) = self.bus.publish_outbound(response).await {
                                error!(error = %e, "failed to publish outbound message");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, session_key = %session_key, "message processing error");
                            let err_msg = OutboundMessage::new(
                                &msg.channel,
                                &msg.chat_id,
                                &format!("I encountered an error: {e}"),
                            )
                            .with_stream_event(StreamEvent::with_content(
                                StreamEventKind::Error,
                                format!("{e}"),
                            ));
                            let _ = self.bus.publish_outbound(err_msg).await;
                        }
                    }
                }
                None => {
                    info!("inbound channel closed, agent loop exiting");
                    break;
                }
            }
        }
    }

    /// Process a single inbound message → outbound response.
    ///
    /// This is the core agent logic:
    /// 1. Get/create session, load history
    /// 2. Build context messages
    /// 3. LLM ↔ tool loop (tool calls gated by the security engine)
    /// 4. Save session + store, return response
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        if let Some(gate) = self.check_pairing(msg).await {
            return Ok(gate);
        }

        let session_key = msg.session_key();

        self.message_tool
            .set_context(&msg.channel, &msg.chat_id)
            .await;
        self.spawn_tool
            .set_context(&msg.channel, &msg.chat_id)
            .await;

        let media_paths: Vec<String> = msg.media.iter().map(|m| m.path.clone()).collect();

        let outcome = self
            .converse(&session_key, &msg.channel, &msg.chat_id, &msg.content, &media_paths)
            .await;

        Ok(self.finish(&msg.channel, &msg.chat_id, outcome))
    }

    /// Process a system message (from a subagent or cron).
    ///
    /// Parses the original `channel:chat_id` from `msg.chat_id`,
    /// loads the original session, runs a full LLM call to summarize
    /// the result, and routes the response back to the correct channel.
    async fn process_system_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        info!(
            sender = %msg.sender_id,
            chat_id = %msg.chat_id,
            "processing system message"
        );

        // Parse origin from chat_id format "channel:chat_id"
        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => {
                return Err(anyhow::anyhow!(
                    "Invalid system message chat_id format: {}",
                    msg.chat_id
                ));
            }
        };

        let session_key = format!("{origin_channel}:{origin_chat_id}");

        self.message_tool
            .set_context(&origin_channel, &origin_chat_id)
            .await;
        self.spawn_tool
            .set_context(&origin_channel, &origin_chat_id)
            .await;

        let outcome = self
            .converse(&session_key, &origin_channel, &origin_chat_id, &msg.content, &[])
            .await;

        Ok(self.finish(&origin_channel, &origin_chat_id, outcome))
    }

    /// Run the history-load → prompt-build → LLM-tool loop → persistence
    /// sequence shared by `process_message` and `process_system_message`.
    async fn converse(
        &self,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        user_text: &str,
        media_paths: &[String],
    ) -> TurnOutcome {
        if let Some(store) = &self.store {
            if let Err(e) = store.create_conversation(session_key, channel).await {
                warn!(error = %e, "failed to create conversation row");
            }
            if let Err(e) = store.add_message(session_key, NewMessage::user(user_text)).await {
                warn!(error = %e, "failed to persist user message");
            }
        }

        self.publish_stream(channel, chat_id, StreamEvent::new(StreamEventKind::Thinking))
            .await;

        let history = self.sessions.get_history(session_key, 50);
        let memories = self.surface_memories(user_text).await;

        let mut messages = self.context.build_messages(
            &history,
            user_text,
            media_paths,
            channel,
            chat_id,
            &self.thinking_level,
            &self.system_prompt_extra,
            &memories,
        );
        self.trim_to_context_budget(&mut messages);

        let tool_defs = self.tools.get_definitions();
        let mut session_total = self.session_tokens_used(session_key);
        let mut outcome: Option<TurnOutcome> = None;

        for iteration in 0..self.max_iterations {
            if self.max_tokens_per_session > 0 && session_total >= self.max_tokens_per_session as u64 {
                outcome = Some(TurnOutcome::Error(format!(
                    "session token budget of {} tokens exhausted",
                    self.max_tokens_per_session
                )));
                break;
            }

            debug!(iteration = iteration, "LLM call");

            let response = self
                .provider
                .chat(&messages, Some(&tool_defs), &self.model, &self.request_config)
                .await;

            if let Some(usage) = &response.usage {
                let before = session_total;
                session_total = self.add_session_tokens(session_key, usage.total_tokens as u64);
                if self.token_budget_alert > 0
                    && before < self.token_budget_alert as u64
                    && session_total >= self.token_budget_alert as u64
                {
                    self.publish_stream(
                        channel,
                        chat_id,
                        StreamEvent::with_content(
                            StreamEventKind::Message,
                            format!(
                                "warning: session has used {session_total} tokens, approaching the \
                                 {}-token session budget",
                                self.max_tokens_per_session
                            ),
                        ),
                    )
                    .await;
                }
            }

            if response.error {
                outcome = Some(TurnOutcome::Error(
                    response
                        .content
                        .clone()
                        .unwrap_or_else(|| "the model provider returned an error".to_string()),
                ));
                break;
            }

            if response.has_tool_calls() {
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(&mut messages, response.content.clone(), tool_calls.clone());

                if let Some(store) = &self.store {
                    if let Err(e) = store
                        .add_message(session_key, NewMessage::assistant(response.content.clone().unwrap_or_default()))
                        .await
                    {
                        warn!(error = %e, "failed to persist assistant tool-call message");
                    }
                }

                for tc in &tool_calls {
                    let params: HashMap<String, serde_json::Value> =
                        serde_json::from_str(&tc.function.arguments).unwrap_or_default();

                    self.publish_stream(
                        channel,
                        chat_id,
                        StreamEvent::tool_start(&tc.function.name, &tc.id),
                    )
                    .await;

                    let result = self.execute_tool_gated(&tc.function.name, &tc.id, params).await;

                    debug!(tool = %tc.function.name, result_len = result.len(), "tool result");

                    self.publish_stream(
                        channel,
                        chat_id,
                        StreamEvent::tool_end(&tc.function.name, &tc.id, &result),
                    )
                    .await;

                    if let Some(store) = &self.store {
                        if let Err(e) = store
                            .add_message(session_key, NewMessage::tool(&tc.id, &tc.function.name, &result))
                            .await
                        {
                            warn!(error = %e, "failed to persist tool-result message");
                        }
                    }

                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }

                self.trim_to_context_budget(&mut messages);
            } else {
                outcome = Some(TurnOutcome::Done(response.content.unwrap_or_default()));
                break;
            }
        }

        let outcome = outcome.unwrap_or_else(|| {
            TurnOutcome::Error(format!(
                "reached the {}-iteration tool-calling limit without a final answer",
                self.max_iterations
            ))
        });

        let content = match &outcome {
            TurnOutcome::Done(c) | TurnOutcome::Error(c) => c.clone(),
        };

        match &outcome {
            TurnOutcome::Done(c) => {
                self.publish_stream(
                    channel,
                    chat_id,
                    StreamEvent::with_content(StreamEventKind::Message, c.clone()),
                )
                .await;
            }
            TurnOutcome::Error(c) => {
                self.publish_stream(
                    channel,
                    chat_id,
                    StreamEvent::with_content(StreamEventKind::Error, c.clone()),
                )
                .await;
            }
        }

        self.sessions.add_message(session_key, Message::user(user_text));
        self.sessions.add_message(session_key, Message::assistant(&content));

        if let Some(store) = &self.store {
            if let Err(e) = store.add_message(session_key, NewMessage::assistant(&content)).await {
                warn!(error = %e, "failed to persist final assistant message");
            }
        }

        outcome
    }

    /// Classify a tool call through the security engine (if configured) and
    /// execute it, or return a synthetic result describing why it didn't run.
    async fn execute_tool_gated(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> String {
        let Some(security) = &self.security else {
            return self.tools.execute(tool_name, params).await;
        };

        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| serde_json::to_string(&params).unwrap_or_default());

        match security.check(tool_name, &command).await {
            Decision::Allow => self.tools.execute(tool_name, params).await,
            Decision::Block => {
                warn!(tool = tool_name, tool_call_id, "tool call blocked by security policy");
                self.emit_event(
                    "security.blocked",
                    serde_json::json!({"tool": tool_name, "command": command}),
                );
                format!("Blocked by security policy: `{command}` was not executed.")
            }
            Decision::Confirm => {
                // No interactive callback is wired into the agent loop itself —
                // transports that support confirmation register their own
                // `ConfirmCallback` with the security engine directly. Absent
                // one, this fails closed rather than silently running.
                let approved = security.request_confirmation(tool_name, &command, None).await;
                if approved {
                    self.tools.execute(tool_name, params).await
                } else {
                    format!("Blocked: confirmation required for `{command}` but none was given.")
                }
            }
        }
    }

    /// Enforce the first-contact pairing handshake, if pairing is configured.
    ///
    /// Returns `Some(reply)` when the message should short-circuit normal
    /// processing (unpaired sender issued a code, submitted a code, or
    /// failed verification); `None` when the sender is already paired and
    /// the turn should proceed as usual.
    async fn check_pairing(&self, msg: &InboundMessage) -> Option<OutboundMessage> {
        let pairing = self.pairing.as_ref()?;

        if pairing.is_paired(&msg.channel, &msg.sender_id).await {
            return None;
        }

        let trimmed = msg.content.trim();
        let looks_like_code = trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit());

        let reply = if looks_like_code {
            if pairing.verify_code(&msg.channel, &msg.sender_id, trimmed).await {
                "✅ paired — you can now talk to the assistant.".to_string()
            } else {
                "⛔ unauthorized: that code is invalid or has expired.".to_string()
            }
        } else {
            match pairing.request_pairing(&msg.channel, &msg.sender_id) {
                oxibot_security::pairing::PairingOutcome::AlreadyPaired => {
                    return None;
                }
                oxibot_security::pairing::PairingOutcome::CodeIssued(code) => {
                    format!(
                        "⛔ unauthorized: pairing is required before I can respond. \
                         Reply with this 6-digit code within 10 minutes: {code}"
                    )
                }
            }
        };

        Some(
            OutboundMessage::new(&msg.channel, &msg.chat_id, &reply)
                .with_stream_event(StreamEvent::with_content(StreamEventKind::Done, reply)),
        )
    }

    /// Look up memories relevant to the current user turn, if a store is configured.
    async fn surface_memories(&self, user_text: &str) -> Vec<String> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match store.search_memories(user_text, 5).await {
            Ok(entries) => entries
                .into_iter()
                .map(|m| format!("[{}] {}", m.category, m.content))
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to search memories");
                Vec::new()
            }
        }
    }

    /// Trim history (oldest non-system messages first) to fit the configured
    /// context-token budget. The system prompt and the final (current-turn)
    /// message are never dropped.
    fn trim_to_context_budget(&self, messages: &mut Vec<Message>) {
        if self.max_context_tokens == 0 {
            return;
        }
        while estimate_tokens(messages) > self.max_context_tokens && messages.len() > 2 {
            messages.remove(1);
        }
    }

    fn session_tokens_used(&self, key: &str) -> u64 {
        *self.session_tokens.lock().unwrap().get(key).unwrap_or(&0)
    }

    fn add_session_tokens(&self, key: &str, amount: u64) -> u64 {
        let mut map = self.session_tokens.lock().unwrap();
        let entry = map.entry(key.to_string()).or_insert(0);
        *entry += amount;
        *entry
    }

    fn emit_event(&self, topic: &str, payload: serde_json::Value) {
        if let Some(events) = &self.events {
            events.emit(AppEvent::new(topic, payload));
        }
    }

    /// Publish an intermediate (non-terminal) stream event over the bus.
    /// Terminal `Done`/`Error` events are attached directly to the
    /// `OutboundMessage` returned from `process_message`/`process_system_message`.
    async fn publish_stream(&self, channel: &str, chat_id: &str, event: StreamEvent) {
        let content = event.content.clone().unwrap_or_default();
        let out = OutboundMessage::new(channel, chat_id, &content).with_stream_event(event);
        if let Err(e) = self.bus.publish_outbound(out).await {
            error!(error = %e, "failed to publish stream event");
        }
    }

    /// Build the terminal `OutboundMessage` for a turn. Per the protocol, the
    /// final `done` event is always the last thing emitted for a turn — a
    /// `Message`/`Error` event has already gone out via `publish_stream`
    /// above, so `done` is the only event this call attaches.
    fn finish(&self, channel: &str, chat_id: &str, outcome: TurnOutcome) -> OutboundMessage {
        let content = match outcome {
            TurnOutcome::Done(c) | TurnOutcome::Error(c) => c,
        };
        OutboundMessage::new(channel, chat_id, &content)
            .with_stream_event(StreamEvent::with_content(StreamEventKind::Done, content.clone()))
    }

    /// Direct processing mode (CLI entry point).
    ///
    /// Wraps text into an `InboundMessage` on the "cli" channel and processes.
    pub async fn process_direct(&self, text: &str) -> Result<String> {
        let msg = InboundMessage::new("cli", "user", "direct", text);
        let response = self.process_message(&msg).await?;
        Ok(response.content)
    }

    /// Get a reference to the tool registry (for testing/extension).
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Heuristic token estimate (chars / 4, rounded up) — the corpus carries no
/// tokenizer dependency, and budget enforcement only needs an approximation.
fn estimate_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum()
}

fn estimate_message_tokens(message: &Message) -> u32 {
    let char_count = match message {
        Message::System { content } => content.len(),
        Message::User { content } => match content {
            MessageContent::Text(text) => text.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        },
        Message::Assistant {
            content,
            tool_calls,
            reasoning_content,
        } => {
            content.as_deref().map(str::len).unwrap_or(0)
                + reasoning_content.as_deref().map(str::len).unwrap_or(0)
                + tool_calls
                    .as_ref()
                    .map(|tcs| {
                        tcs.iter()
                            .map(|tc| tc.function.name.len() + tc.function.arguments.len())
                            .sum()
                    })
                    .unwrap_or(0)
        }
        Message::Tool { content, .. } => content.len(),
    };
    (char_count as u32 / 4) + 1
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oxibot_core::types::{LlmResponse, ToolDefinition};

    /// A mock LLM provider that returns canned responses.
    struct MockProvider {
        /// Responses to return in sequence.
        responses: std::sync::Mutex<Vec<LlmResponse>>,
    }

    impl MockProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses),
            }
        }

        fn simple(text: &str) -> Self {
            Self::new(vec![LlmResponse {
                content: Some(text.into()),
                ..Default::default()
            }])
        }
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
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                LlmResponse {
                    content: Some("(no more responses)".into()),
                    ..Default::default()
                }
            } else {
                responses.remove(0)
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            "MockProvider"
        }
    }

    fn create_test_loop(provider: Arc<dyn LlmProvider>) -> AgentLoop {
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("oxibot_test_agent");
        let _ = std::fs::create_dir_all(&workspace);

        AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_agent_simple_response() {
        let provider = Arc::new(MockProvider::simple("Hello from Oxibot!"));
        let agent = create_test_loop(provider);

        let result = agent.process_direct("Hi").await.unwrap();
        assert_eq!(result, "Hello from Oxibot!");
    }

    #[tokio::test]
    async fn test_stream_event_sequence_is_thinking_message_done() {
        let provider = Arc::new(MockProvider::simple("hello"));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("oxibot_test_stream_seq");
        let _ = std::fs::create_dir_all(&workspace);

        let kinds = Arc::new(tokio::sync::Mutex::new(Vec::<StreamEventKind>::new()));
        let recorder = kinds.clone();
        bus.on_outbound(
            "cli",
            Arc::new(move |msg: OutboundMessage| {
                let recorder = recorder.clone();
                Box::pin(async move {
                    if let Some(ev) = msg.stream_event {
                        recorder.lock().await.push(ev.kind);
                    }
                    Ok(())
                })
            }),
        )
        .await;

        let agent = AgentLoop::new(
            bus, provider, workspace, None, Some(5), None, None, None, false, None, None, None,
        );

        let msg = InboundMessage::new("cli", "user", "direct", "hi");
        let response = agent.process_message(&msg).await.unwrap();
        agent.bus.publish_outbound(response).await.unwrap();

        let seen = kinds.lock().await;
        assert_eq!(
            seen.as_slice(),
            [StreamEventKind::Thinking, StreamEventKind::Message, StreamEventKind::Done]
        );
    }

    #[tokio::test]
    async fn test_agent_tool_calling() {
        // First response: LLM requests read_file tool call
        // Second response: LLM gives final answer
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test.txt");
        std::fs::write(&test_file, "file content here").unwrap();

        let tool_call = ToolCall::new(
            "call_1",
            "read_file",
            serde_json::json!({"path": test_file.to_str().unwrap()}).to_string(),
        );

        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("The file contains: file content here".into()),
                ..Default::default()
            },
        ];

        let provider = Arc::new(MockProvider::new(responses));
        let bus = Arc::new(MessageBus::new(32));

        let agent = AgentLoop::new(
            bus,
            provider,
            dir.path().to_path_buf(),
            None,
            Some(10),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
        );

        let result = agent.process_direct("Read test.txt").await.unwrap();
        assert_eq!(result, "The file contains: file content here");
    }

    #[tokio::test]
    async fn test_agent_max_iterations() {
        // All responses are tool calls → should exhaust max_iterations
        let tool_call = ToolCall::new("call_loop", "list_dir", r#"{"path": "/tmp"}"#);
        let responses: Vec<LlmResponse> = (0..10)
            .map(|_| LlmResponse {
                content: None,
                tool_calls: vec![tool_call.clone()],
                ..Default::default()
            })
            .collect();

        let provider = Arc::new(MockProvider::new(responses));
        let agent = create_test_loop(provider);

        let result = agent.process_direct("loop forever").await.unwrap();
        assert!(result.contains("iteration"));
    }

    #[tokio::test]
    async fn test_agent_reports_provider_error() {
        let provider = Arc::new(MockProvider::new(vec![LlmResponse::error("upstream exploded")]));
        let agent = create_test_loop(provider);

        let result = agent.process_direct("hi").await.unwrap();
        assert_eq!(result, "upstream exploded");
    }

    #[test]
    fn test_default_tools_registered() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);

        let names = agent.tools().tool_names();
        assert!(names.contains(&"read_file".into()));
        assert!(names.contains(&"write_file".into()));
        assert!(names.contains(&"edit_file".into()));
        assert!(names.contains(&"list_dir".into()));
        assert!(names.contains(&"exec".into()));
        assert!(names.contains(&"web_search".into()));
        assert!(names.contains(&"web_fetch".into()));
        assert!(names.contains(&"message".into()));
        assert!(names.contains(&"spawn".into()));
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn test_model_defaults_to_provider() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);
        assert_eq!(agent.model(), "mock-model");
    }

    #[test]
    fn test_exec_tool_config_default() {
        let config = ExecToolConfig::default();
        assert_eq!(config.timeout, 60);
    }

    #[tokio::test]
    async fn test_process_system_message() {
        let provider = Arc::new(MockProvider::simple("Here's a summary of the result."));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("oxibot_test_system_msg");
        let _ = std::fs::create_dir_all(&workspace);

        let agent = AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
        );

        // Simulate a subagent result message
        let msg = InboundMessage::new(
            "system",
            "subagent",
            "telegram:chat_42",
            "## Subagent Result\n**Task**: test\n\nDone!",
        );

        let response = agent.process_system_message(&msg).await.unwrap();

        // Response should be routed to the original channel/chat
        assert_eq!(response.channel, "telegram");
        assert_eq!(response.chat_id, "chat_42");
        assert_eq!(response.content, "Here's a summary of the result.");
    }

    #[tokio::test]
    async fn test_process_system_message_invalid_format() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);

        // Missing colon separator
        let msg = InboundMessage::new("system", "subagent", "invalid_chat_id", "test");

        let result = agent.process_system_message(&msg).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_routes_system_messages() {
        // Verify that the run loop correctly routes system messages
        let provider = Arc::new(MockProvider::simple("Summary of result"));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("oxibot_test_run_route");
        let _ = std::fs::create_dir_all(&workspace);

        let agent = AgentLoop::new(
            bus.clone(),
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
        );

        // Publish a system message
        let msg = InboundMessage::new(
            "system",
            "subagent",
            "discord:guild_1",
            "Subagent result content",
        );
        bus.publish_inbound(msg).await.unwrap();

        // We already test process_system_message above; here just verify
        // the agent has the spawn tool wired up.
        assert!(agent.tools().has("spawn"));
    }

    #[tokio::test]
    async fn test_subagent_manager_accessible() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);

        // Subagent manager should start with 0 tasks
        assert_eq!(agent.subagent_manager.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_security_engine_blocks_tool_call() {
        use oxibot_security::{DefaultPolicy, SecurityEngineConfig};
        use oxibot_store::Store;

        let dir = tempfile::tempdir().unwrap();
        let tool_call = ToolCall::new("call_1", "exec", serde_json::json!({"command": "rm -rf /"}).to_string());

        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("I couldn't run that command.".into()),
                ..Default::default()
            },
        ];
        let provider = Arc::new(MockProvider::new(responses));
        let bus = Arc::new(MessageBus::new(32));

        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let security = Arc::new(SecurityEngine::new(
            &SecurityEngineConfig {
                default_policy: DefaultPolicy::Allow,
                blacklist: vec!["rm -rf".to_string()],
                ..Default::default()
            },
            store.clone(),
        ));

        let options = AgentLoopOptions {
            security: Some(security),
            conversation_store: Some(store),
            ..Default::default()
        };

        let agent = AgentLoop::new(
            bus,
            provider,
            dir.path().to_path_buf(),
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            Some(options),
        );

        let result = agent.process_direct("delete everything").await.unwrap();
        assert_eq!(result, "I couldn't run that command.");
    }

    #[tokio::test]
    async fn test_tool_call_turn_persists_user_message_before_assistant_and_tool_rows() {
        use oxibot_core::records::MessageRole;
        use oxibot_store::Store;

        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test.txt");
        std::fs::write(&test_file, "file content here").unwrap();

        let tool_call = ToolCall::new(
            "call_1",
            "read_file",
            serde_json::json!({"path": test_file.to_str().unwrap()}).to_string(),
        );
        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("The file contains: file content here".into()),
                ..Default::default()
            },
        ];
        let provider = Arc::new(MockProvider::new(responses));
        let bus = Arc::new(MessageBus::new(32));

        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let options = AgentLoopOptions {
            conversation_store: Some(store.clone()),
            ..Default::default()
        };

        let agent = AgentLoop::new(
            bus,
            provider,
            dir.path().to_path_buf(),
            None,
            Some(10),
            None,
            None,
            None,
            false,
            None,
            None,
            Some(options),
        );

        let msg = InboundMessage::new("cli", "user", "direct", "Read test.txt");
        agent.process_message(&msg).await.unwrap();

        let rows = store.get_messages("cli:direct", 10).await.unwrap();
        let roles: Vec<MessageRole> = rows.iter().map(|r| r.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant,
            ]
        );
        assert_eq!(rows[0].content, "Read test.txt");

        let mut prev = rows[0].created_at;
        for row in &rows[1..] {
            assert!(row.created_at >= prev, "messages must be in non-decreasing created_at order");
            prev = row.created_at;
        }
    }

    #[tokio::test]
    async fn test_pairing_gate_blocks_until_code_verified() {
        use oxibot_security::pairing::PairingStore;
        use oxibot_store::Store;

        let provider = Arc::new(MockProvider::simple("hello"));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("oxibot_test_pairing");
        let _ = std::fs::create_dir_all(&workspace);

        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let pairing = Arc::new(PairingStore::new(store.clone(), 30));

        let options = AgentLoopOptions {
            pairing: Some(pairing.clone()),
            ..Default::default()
        };

        let agent = AgentLoop::new(
            bus, provider, workspace, None, Some(5), None, None, None, false, None, None, Some(options),
        );

        // First contact: blocked, a 6-digit code is issued in the reply.
        let msg = InboundMessage::new("telegram", "u1", "chat1", "hi there");
        let reply = agent.process_message(&msg).await.unwrap();
        assert!(reply.content.contains("unauthorized"));

        // The same code stays pending until verified or it expires.
        let code = match pairing.request_pairing("telegram", "u1") {
            oxibot_security::pairing::PairingOutcome::CodeIssued(c) => c,
            other => panic!("expected a still-pending code, got {other:?}"),
        };

        // Submitting the code pairs the sender.
        let verify_msg = InboundMessage::new("telegram", "u1", "chat1", code.clone());
        let reply = agent.process_message(&verify_msg).await.unwrap();
        assert!(reply.content.contains("paired"));
        assert!(pairing.is_paired("telegram", "u1").await);

        // Subsequent messages pass straight through to the model.
        let msg2 = InboundMessage::new("telegram", "u1", "chat1", "now answer me");
        let reply2 = agent.process_message(&msg2).await.unwrap();
        assert_eq!(reply2.content, "hello");
    }

    #[test]
    fn test_estimate_tokens_nonzero_for_nonempty_messages() {
        let messages = vec![Message::system("hello world"), Message::user("hi")];
        assert!(estimate_tokens(&messages) > 0);
    }

    #[test]
    fn test_trim_to_context_budget_keeps_system_and_last() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let options = AgentLoopOptions {
            max_context_tokens: 1,
            ..Default::default()
        };
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("oxibot_test_trim");
        let _ = std::fs::create_dir_all(&workspace);
        let agent = AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            Some(options),
        );

        let mut messages = vec![
            Message::system("system prompt"),
            Message::user("first"),
            Message::assistant("second"),
            Message::user("third"),
        ];
        agent.trim_to_context_budget(&mut messages);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::System { .. }));
    }
}
