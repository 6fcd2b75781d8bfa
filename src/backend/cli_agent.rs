//! CLI-driven agent backend
//!
//! Shells out to an external agent binary (`claude -p` style) in JSON output
//! mode instead of speaking a provider wire format. The external agent runs
//! its own tool loop, so the in-crate round engine is bypassed by design and
//! the registry is not consulted. Conversation continuity uses the binary's
//! session resumption: one session per room, discarded when the local history
//! shrinks (compaction).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::{log_usage, record_usage};
use crate::backend::{
    InferenceBackend, InferenceModel, Interrupt, ProcessCallbacks, Usage,
};
use crate::conversation::{extract_text, ChatMessage};
use crate::error::BackendError;
use crate::prompt::SystemBlock;
use crate::tools::{ToolContext, ToolDefinition, ToolRegistry};

#[derive(Debug, Clone)]
struct CliSession {
    session_id: String,
    message_count: usize,
}

/// What to do with a room's stored session for the next invocation.
#[derive(Debug, PartialEq, Eq)]
enum SessionAction {
    /// No session stored; start fresh
    Fresh,
    /// Resume the stored session id
    Resume(String),
    /// Local history shrank (compaction); drop the session and start fresh
    Discard,
}

fn session_action(stored: Option<&CliSession>, message_count: usize) -> SessionAction {
    match stored {
        None => SessionAction::Fresh,
        Some(session) if message_count >= session.message_count => {
            SessionAction::Resume(session.session_id.clone())
        }
        Some(_) => SessionAction::Discard,
    }
}

/// Parsed output of one CLI invocation.
#[derive(Debug)]
struct CliOutput {
    result: String,
    session_id: String,
    usage: Usage,
}

fn parse_output(stdout: &str) -> Result<CliOutput, BackendError> {
    let parsed: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| BackendError::Api(format!("unparseable agent output: {}", e)))?;

    if parsed.get("is_error").and_then(Value::as_bool) == Some(true) {
        let result = parsed
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("agent reported an error");
        return Err(BackendError::Api(result.to_string()));
    }

    let usage = parsed.get("usage").cloned().unwrap_or_default();
    Ok(CliOutput {
        result: parsed
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        session_id: parsed
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        usage: Usage {
            input_tokens: usage
                .get("input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_read_input_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_creation_input_tokens: usage
                .get("cache_creation_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        },
    })
}

fn classify_failure(stderr: &str) -> BackendError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("auth") || lowered.contains("login") || lowered.contains("api key") {
        BackendError::Auth(stderr.trim().to_string())
    } else {
        BackendError::Api(stderr.trim().to_string())
    }
}

/// Backend that delegates inference to an external CLI agent.
pub struct CliAgentBackend {
    binary: String,
    state_dir: PathBuf,
    sessions: Mutex<HashMap<String, CliSession>>,
}

impl CliAgentBackend {
    /// Create a backend around an agent binary.
    pub fn new(binary: String, state_dir: PathBuf) -> Self {
        Self {
            binary,
            state_dir,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn invoke(&self, args: &[String]) -> Result<CliOutput, BackendError> {
        if let Err(e) = std::fs::create_dir_all(&self.state_dir) {
            warn!(error = %e, "Failed to create CLI agent state dir");
        }

        debug!(binary = %self.binary, "Invoking CLI agent");
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.state_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackendError::Api(format!("failed to spawn {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl InferenceBackend for CliAgentBackend {
    async fn run_agentic_loop(
        &self,
        model: &InferenceModel,
        system: &[SystemBlock],
        messages: &mut Vec<ChatMessage>,
        _tools: &[ToolDefinition],
        _registry: &ToolRegistry,
        tool_ctx: &ToolContext,
        _audit_dir: &Path,
        usage_dir: &Path,
        callbacks: &dyn ProcessCallbacks,
        interrupt: &Interrupt,
        _thinking: bool,
    ) -> Result<String, BackendError> {
        if interrupt.is_set() {
            info!("CLI agent invocation skipped: interrupted");
            return Ok(String::new());
        }

        let prompt = messages
            .last()
            .map(|msg| extract_text(&msg.content))
            .unwrap_or_default();
        let system_text = system
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let room_id = tool_ctx.room_id.clone();
        let action = {
            let mut sessions = self.sessions.lock().await;
            let action = session_action(sessions.get(&room_id), messages.len());
            if action == SessionAction::Discard {
                info!(room = %room_id, "History shrank, discarding stored agent session");
                sessions.remove(&room_id);
            }
            action
        };

        let mut args = vec![
            "-p".to_string(),
            prompt,
            "--output-format".to_string(),
            "json".to_string(),
            "--model".to_string(),
            model.model_id.clone(),
        ];
        if !system_text.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(system_text);
        }
        if let SessionAction::Resume(session_id) = &action {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }

        let output = self.invoke(&args).await?;

        log_usage(&model.model_id, &output.usage);
        record_usage(usage_dir, &model.model_id, &output.usage);

        if !room_id.is_empty() && !output.session_id.is_empty() {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                room_id,
                CliSession {
                    session_id: output.session_id,
                    // The reply the Brain appends counts toward the history
                    // the session already covers
                    message_count: messages.len() + 1,
                },
            );
        }

        if !output.result.is_empty() {
            callbacks.on_first_text().await;
        }
        Ok(output.result)
    }

    async fn count_tokens(
        &self,
        _model_id: &str,
        _system: &[SystemBlock],
        _tools: &[ToolDefinition],
        _messages: &[ChatMessage],
    ) -> Result<i64, BackendError> {
        // The CLI agent manages its own context window
        Ok(-1)
    }

    async fn utility_complete(
        &self,
        prompt: &str,
        _max_tokens: u32,
    ) -> Result<String, BackendError> {
        let args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        Ok(self.invoke(&args).await?.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, count: usize) -> CliSession {
        CliSession {
            session_id: id.to_string(),
            message_count: count,
        }
    }

    #[test]
    fn test_session_action_fresh_without_state() {
        assert_eq!(session_action(None, 3), SessionAction::Fresh);
    }

    #[test]
    fn test_session_action_resumes_growing_history() {
        let stored = session("s1", 4);
        assert_eq!(
            session_action(Some(&stored), 4),
            SessionAction::Resume("s1".into())
        );
        assert_eq!(
            session_action(Some(&stored), 9),
            SessionAction::Resume("s1".into())
        );
    }

    #[test]
    fn test_session_action_discards_after_compaction() {
        // Compaction replaced history with a shorter one; the stored session
        // no longer matches what the agent remembers
        let stored = session("s1", 12);
        assert_eq!(session_action(Some(&stored), 8), SessionAction::Discard);
    }

    #[test]
    fn test_parse_output_full() {
        let out = parse_output(
            r#"{"result": "done", "session_id": "abc123",
                "usage": {"input_tokens": 12, "output_tokens": 7,
                          "cache_read_input_tokens": 3, "cache_creation_input_tokens": 1}}"#,
        )
        .unwrap();
        assert_eq!(out.result, "done");
        assert_eq!(out.session_id, "abc123");
        assert_eq!(out.usage.input_tokens, 12);
        assert_eq!(out.usage.cache_read_input_tokens, 3);
    }

    #[test]
    fn test_parse_output_minimal() {
        let out = parse_output(r#"{"result": "hi"}"#).unwrap();
        assert_eq!(out.result, "hi");
        assert!(out.session_id.is_empty());
        assert_eq!(out.usage.output_tokens, 0);
    }

    #[test]
    fn test_parse_output_error_flag() {
        let err = parse_output(r#"{"is_error": true, "result": "rate limited"}"#).unwrap_err();
        assert!(matches!(err, BackendError::Api(_)));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn test_parse_output_garbage() {
        assert!(parse_output("segfault").is_err());
    }

    #[test]
    fn test_classify_failure_auth() {
        assert!(classify_failure("Invalid API key · please run login").is_fatal());
        assert!(!classify_failure("network unreachable").is_fatal());
    }
}
