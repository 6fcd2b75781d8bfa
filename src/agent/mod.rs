//! The Brain: conversation-owning façade over the agentic loop
//!
//! The Brain owns the conversation store and per-room bookkeeping, decides
//! when to compact, resolves model tiers, and drives the configured inference
//! backend. All collaborators are injected at construction; nothing here is
//! looked up from ambient state.

pub mod cache;
pub mod compaction;
pub mod r#loop;

pub use r#loop::{build_reply, execute_tools, run_rounds, MAX_TOOL_ROUNDS};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use chrono::Local;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::backend::{InferenceBackend, InferenceModel, Interrupt, ProcessCallbacks};
use crate::config::{Config, COMPACT_THRESHOLD, CONTEXT_BUDGET};
use crate::conversation::{
    ChatMessage, ContentBlock, ConversationStore, ImageSource, MessageBody, MessageContent,
    RoomInfo, RoomMessage,
};
use crate::error::Result;
use crate::prompt::{build_dynamic_context, build_system_blocks, ensure_persona, SystemBlock};
use crate::tools::{ToolContext, ToolDefinition, ToolRegistry};

use compaction::compact_history;

/// Sent to the user when the backend fails in a recoverable way.
pub const APOLOGY: &str = "I'm sorry, I ran into a temporary problem and couldn't finish \
processing that. Could you try again in a moment?";

/// Response from a processed message.
#[derive(Debug, Clone)]
pub struct BrainResponse {
    /// The reply text; empty for tool-only turns with nothing to say
    pub text: String,
}

/// The reasoning façade: owns conversations, invokes compaction and the
/// agentic loop, and records usage.
pub struct Brain {
    config: Config,
    backend: Arc<dyn InferenceBackend>,
    registry: Arc<ToolRegistry>,
    store: ConversationStore,
    workspace: PathBuf,
    audit_dir: PathBuf,
    usage_dir: PathBuf,
    room_token_counts: RwLock<HashMap<String, i64>>,
    cycle_failures: Mutex<HashMap<String, u32>>,
    agent_username: RwLock<String>,
}

impl Brain {
    /// Create a Brain around an injected backend and tool registry.
    pub fn new(
        config: Config,
        backend: Arc<dyn InferenceBackend>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let workspace = config.workspace_path();
        ensure_persona(&workspace);
        Self {
            audit_dir: config.audit_path(),
            usage_dir: config.usage_path(),
            workspace,
            config,
            backend,
            registry,
            store: ConversationStore::new(),
            room_token_counts: RwLock::new(HashMap::new()),
            cycle_failures: Mutex::new(HashMap::new()),
            agent_username: RwLock::new(String::new()),
        }
    }

    /// Record the agent's own username once the chat transport knows it.
    pub async fn set_agent_username(&self, username: &str) {
        *self.agent_username.write().await = username.to_string();
    }

    /// Store metadata about a room for use in the system prompt.
    pub async fn set_room_info(&self, info: RoomInfo) {
        self.store.set_room_info(info).await;
    }

    /// Check if we have history for a room.
    pub async fn has_history(&self, room_id: &str) -> bool {
        self.store.has_room(room_id).await
    }

    /// Load conversation history for a room. Returns the count loaded.
    pub async fn load_history(&self, room_id: &str, messages: &[RoomMessage]) -> usize {
        let agent = self.agent_username.read().await.clone();
        self.store.load_history(room_id, &agent, messages).await
    }

    /// Process a message and return a response.
    ///
    /// Degradable backend failures become an apology text; authentication
    /// failures propagate so the supervisor can halt the process.
    pub async fn process(
        &self,
        room_id: &str,
        content: MessageContent,
        callbacks: &dyn ProcessCallbacks,
        interrupt: &Interrupt,
        tier: Option<&str>,
        thinking: bool,
    ) -> Result<BrainResponse> {
        let tier = tier.unwrap_or(&self.config.chat_tier);
        let model = self.config.resolve_tier(tier)?;

        let current_time = Local::now().format("%Y-%m-%d %H:%M %:z").to_string();
        let room_info = self.store.room_info(room_id).await;
        let system = build_system_blocks(&self.workspace);
        let dynamic_context = build_dynamic_context(&current_time, &content.username, room_info.as_ref());

        let mut tools = self.registry.definitions();
        if let Some(last) = tools.last_mut() {
            last.cache_control = Some(crate::conversation::CacheControl::ephemeral());
        }

        let tool_ctx = ToolContext {
            workspace: self.workspace.clone(),
            username: content.username.clone(),
            // Internal rooms (cycles, scheduled prompts) carry no chat room
            room_id: if room_id.starts_with("__") {
                String::new()
            } else {
                room_id.to_string()
            },
            thread_id: content.thread_id.clone(),
            agent_username: self.agent_username.read().await.clone(),
        };

        let measured = self
            .room_token_counts
            .read()
            .await
            .get(room_id)
            .copied()
            .unwrap_or(0);
        if measured > COMPACT_THRESHOLD as i64 {
            self.compact_room(room_id, &system, &tools, &model).await;
        }

        let user_content = build_content(&content, &dynamic_context);
        self.store
            .append(
                room_id,
                ChatMessage {
                    role: crate::conversation::Role::User,
                    content: user_content,
                },
            )
            .await;

        let history_len = self.store.len(room_id).await;
        debug!(
            room = room_id,
            history = history_len,
            "Processing message"
        );

        let reply = match self
            .run_loop(room_id, &model, &system, &tools, &tool_ctx, callbacks, interrupt, thinking)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.is_context_too_large() => {
                warn!(room = room_id, "Request too large, compacting and retrying");
                self.compact_room(room_id, &system, &tools, &model).await;
                match self
                    .run_loop(
                        room_id, &model, &system, &tools, &tool_ctx, callbacks, interrupt, thinking,
                    )
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) if e.is_context_too_large() => {
                        error!(room = room_id, "Still too large after compaction");
                        return Ok(BrainResponse {
                            text: APOLOGY.to_string(),
                        });
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        error!(error = %e, "API error during processing");
                        return Ok(BrainResponse {
                            text: APOLOGY.to_string(),
                        });
                    }
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                error!(error = %e, "API error during processing");
                return Ok(BrainResponse {
                    text: APOLOGY.to_string(),
                });
            }
        };

        if !reply.is_empty() {
            self.store
                .append(room_id, ChatMessage::assistant(&reply))
                .await;
        }

        let tokens = self.measure_context(room_id, &system, &tools, &model).await;
        info!(
            room = room_id,
            tokens,
            budget = CONTEXT_BUDGET,
            "Context measured"
        );

        debug!(reply = %reply.chars().take(100).collect::<String>(), "Response");
        Ok(BrainResponse { text: reply })
    }

    /// Check the conversation out, run the backend loop over it, and check
    /// the result back in. The store lock is never held across the call.
    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        room_id: &str,
        model: &InferenceModel,
        system: &[SystemBlock],
        tools: &[ToolDefinition],
        tool_ctx: &ToolContext,
        callbacks: &dyn ProcessCallbacks,
        interrupt: &Interrupt,
        thinking: bool,
    ) -> std::result::Result<String, crate::error::BackendError> {
        let mut messages = self.store.checkout(room_id).await;
        let result = self
            .backend
            .run_agentic_loop(
                model,
                system,
                &mut messages,
                tools,
                &self.registry,
                tool_ctx,
                &self.audit_dir,
                &self.usage_dir,
                callbacks,
                interrupt,
                thinking,
            )
            .await;
        // Tool rounds completed so far stay in history even when the loop
        // failed part-way through.
        self.store.commit(room_id, messages).await;
        result
    }

    /// Compact a room and log the change when anything happened.
    async fn compact_room(
        &self,
        room_id: &str,
        system: &[SystemBlock],
        tools: &[ToolDefinition],
        model: &InferenceModel,
    ) {
        let before = self.store.len(room_id).await;
        compact_history(self.backend.as_ref(), &self.store, room_id).await;
        let after = self.store.len(room_id).await;
        if after < before {
            let tokens = self.measure_context(room_id, system, tools, model).await;
            info!(
                room = room_id,
                before, after, tokens, "Compacted conversation"
            );
        }
    }

    /// Count tokens for the current conversation state.
    ///
    /// A negative count means the backend couldn't measure; the previously
    /// cached value is kept so compaction only triggers on real numbers.
    async fn measure_context(
        &self,
        room_id: &str,
        system: &[SystemBlock],
        tools: &[ToolDefinition],
        model: &InferenceModel,
    ) -> i64 {
        let messages = self.store.checkout(room_id).await;
        let count = match self
            .backend
            .count_tokens(&model.model_id, system, tools, &messages)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Token counting failed");
                -1
            }
        };
        let mut counts = self.room_token_counts.write().await;
        if count < 0 {
            return counts.get(room_id).copied().unwrap_or(0);
        }
        counts.insert(room_id.to_string(), count);
        count
    }

    /// Record a failed background cycle; returns the consecutive count.
    pub async fn cycle_failed(&self, name: &str) -> u32 {
        let mut failures = self.cycle_failures.lock().await;
        let count = failures.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset the consecutive-failure counter for a background cycle.
    pub async fn cycle_succeeded(&self, name: &str) {
        self.cycle_failures.lock().await.remove(name);
    }

    /// Access the conversation store (mainly for tests and diagnostics).
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }
}

/// Build the user-message body for one incoming message.
///
/// Dynamic context and images force a block body; a bare text message stays a
/// plain string for simpler history.
fn build_content(content: &MessageContent, dynamic_context: &str) -> MessageBody {
    let mut blocks: Vec<ContentBlock> = Vec::new();

    if !dynamic_context.is_empty() {
        blocks.push(ContentBlock::text(dynamic_context));
    }

    let id_tag = if content.message_id.is_empty() {
        String::new()
    } else {
        format!("[{}] ", content.message_id)
    };
    let ts_tag = if content.timestamp.is_empty() {
        String::new()
    } else {
        format!("[{}] ", content.timestamp)
    };
    let thread_tag = if content.thread_id.is_empty() {
        String::new()
    } else {
        format!("[thread:{}] ", content.thread_id)
    };
    let prefix = format!("{}{}{}", id_tag, ts_tag, thread_tag);
    let empty = format!("{}@{}: (empty message)", prefix, content.username);

    for (media_type, data) in &content.images {
        blocks.push(ContentBlock::Image {
            source: ImageSource::base64(
                media_type,
                base64::engine::general_purpose::STANDARD.encode(data),
            ),
        });
    }

    let text = if content.text.is_empty() {
        String::new()
    } else {
        format!("{}@{}: {}", prefix, content.username, content.text)
    };

    if !text.is_empty() {
        blocks.push(ContentBlock::text(&text));
    } else if blocks.is_empty() {
        blocks.push(ContentBlock::text(&empty));
    }

    if blocks.len() == 1 {
        if let ContentBlock::Text { text } = &blocks[0] {
            return MessageBody::Text(text.clone());
        }
    }

    MessageBody::Blocks(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    /// Backend stub: scripted loop results, fixed token count.
    struct StubBackend {
        replies: StdMutex<Vec<std::result::Result<String, BackendError>>>,
        token_count: i64,
    }

    impl StubBackend {
        fn with_replies(replies: Vec<std::result::Result<String, BackendError>>) -> Self {
            Self {
                replies: StdMutex::new(replies),
                token_count: -1,
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for StubBackend {
        async fn run_agentic_loop(
            &self,
            _model: &InferenceModel,
            _system: &[SystemBlock],
            _messages: &mut Vec<ChatMessage>,
            _tools: &[ToolDefinition],
            _registry: &ToolRegistry,
            _tool_ctx: &ToolContext,
            _audit_dir: &Path,
            _usage_dir: &Path,
            _callbacks: &dyn ProcessCallbacks,
            _interrupt: &Interrupt,
            _thinking: bool,
        ) -> std::result::Result<String, BackendError> {
            self.replies.lock().unwrap().remove(0)
        }

        async fn count_tokens(
            &self,
            _model_id: &str,
            _system: &[SystemBlock],
            _tools: &[ToolDefinition],
            _messages: &[ChatMessage],
        ) -> std::result::Result<i64, BackendError> {
            Ok(self.token_count)
        }

        async fn utility_complete(
            &self,
            _prompt: &str,
            _max_tokens: u32,
        ) -> std::result::Result<String, BackendError> {
            Ok("summary".to_string())
        }
    }

    fn test_brain(backend: StubBackend) -> Brain {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        // Leak the tempdir so the workspace outlives the test body
        std::mem::forget(dir);
        Brain::new(config, Arc::new(backend), Arc::new(ToolRegistry::new()))
    }

    #[tokio::test]
    async fn test_process_appends_user_and_assistant() {
        let brain = test_brain(StubBackend::with_replies(vec![Ok("hello ada".into())]));

        let response = brain
            .process(
                "r1",
                MessageContent::text("ada", "hi"),
                &crate::backend::NoCallbacks,
                &Interrupt::new(),
                None,
                false,
            )
            .await
            .unwrap();

        assert_eq!(response.text, "hello ada");
        // user + assistant
        assert_eq!(brain.store().len("r1").await, 2);
    }

    #[tokio::test]
    async fn test_process_skips_empty_assistant_append() {
        let brain = test_brain(StubBackend::with_replies(vec![Ok(String::new())]));

        let response = brain
            .process(
                "r1",
                MessageContent::text("ada", "do it silently"),
                &crate::backend::NoCallbacks,
                &Interrupt::new(),
                None,
                false,
            )
            .await
            .unwrap();

        assert_eq!(response.text, "");
        // Only the user message; a tool-only turn appends no assistant text
        assert_eq!(brain.store().len("r1").await, 1);
    }

    #[tokio::test]
    async fn test_process_degrades_api_error_to_apology() {
        let brain = test_brain(StubBackend::with_replies(vec![Err(BackendError::Api(
            "overloaded".into(),
        ))]));

        let response = brain
            .process(
                "r1",
                MessageContent::text("ada", "hi"),
                &crate::backend::NoCallbacks,
                &Interrupt::new(),
                None,
                false,
            )
            .await
            .unwrap();

        assert_eq!(response.text, APOLOGY);
    }

    #[tokio::test]
    async fn test_process_propagates_auth_error() {
        let brain = test_brain(StubBackend::with_replies(vec![Err(BackendError::Auth(
            "bad key".into(),
        ))]));

        let err = brain
            .process(
                "r1",
                MessageContent::text("ada", "hi"),
                &crate::backend::NoCallbacks,
                &Interrupt::new(),
                None,
                false,
            )
            .await
            .unwrap_err();

        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_process_retries_once_after_context_too_large() {
        let brain = test_brain(StubBackend::with_replies(vec![
            Err(BackendError::ContextTooLarge("too big".into())),
            Ok("fits now".into()),
        ]));

        let response = brain
            .process(
                "r1",
                MessageContent::text("ada", "hi"),
                &crate::backend::NoCallbacks,
                &Interrupt::new(),
                None,
                false,
            )
            .await
            .unwrap();

        assert_eq!(response.text, "fits now");
    }

    #[tokio::test]
    async fn test_process_unknown_tier_errors() {
        let brain = test_brain(StubBackend::with_replies(vec![Ok("unused".into())]));
        let err = brain
            .process(
                "r1",
                MessageContent::text("ada", "hi"),
                &crate::backend::NoCallbacks,
                &Interrupt::new(),
                Some("galactic"),
                false,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown model tier"));
    }

    #[tokio::test]
    async fn test_cycle_failure_counters() {
        let brain = test_brain(StubBackend::with_replies(vec![]));

        assert_eq!(brain.cycle_failed("reverie").await, 1);
        assert_eq!(brain.cycle_failed("reverie").await, 2);
        assert_eq!(brain.cycle_failed("consolidation").await, 1);

        brain.cycle_succeeded("reverie").await;
        assert_eq!(brain.cycle_failed("reverie").await, 1);
    }

    // ── build_content ──────────────────────────────────────────────────

    #[test]
    fn test_build_content_plain_text() {
        let content = MessageContent::text("ada", "hello");
        let body = build_content(&content, "");
        match body {
            MessageBody::Text(text) => assert_eq!(text, "@ada: hello"),
            _ => panic!("expected plain text body"),
        }
    }

    #[test]
    fn test_build_content_with_dynamic_context() {
        let content = MessageContent::text("ada", "hello");
        let body = build_content(&content, "Current time: now");
        match body {
            MessageBody::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[0], ContentBlock::Text { text } if text.contains("Current time")));
            }
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn test_build_content_tags() {
        let content = MessageContent {
            username: "ada".into(),
            message_id: "m42".into(),
            timestamp: "2026-08-06 10:00".into(),
            thread_id: "t7".into(),
            text: "hi".into(),
            images: vec![],
        };
        let body = build_content(&content, "");
        match body {
            MessageBody::Text(text) => {
                assert_eq!(text, "[m42] [2026-08-06 10:00] [thread:t7] @ada: hi");
            }
            _ => panic!("expected plain text body"),
        }
    }

    #[test]
    fn test_build_content_empty_message_placeholder() {
        let content = MessageContent::text("ada", "");
        let body = build_content(&content, "");
        match body {
            MessageBody::Text(text) => assert_eq!(text, "@ada: (empty message)"),
            _ => panic!("expected plain text body"),
        }
    }

    #[test]
    fn test_build_content_images_force_blocks() {
        let content = MessageContent {
            username: "ada".into(),
            text: "look".into(),
            images: vec![("image/png".into(), vec![1, 2, 3])],
            ..MessageContent::default()
        };
        let body = build_content(&content, "");
        match body {
            MessageBody::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(blocks[0], ContentBlock::Image { .. }));
            }
            _ => panic!("expected blocks"),
        }
    }
}
