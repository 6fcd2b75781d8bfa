//! Tool types for Famulus
//!
//! This module defines the `Tool` trait that workspace tools implement, the
//! `ToolContext` passed to every execution, and the `ToolDefinition` shape
//! sent to inference backends. The concrete tool catalogue lives outside the
//! orchestration core; this crate only drives the call cycle.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::conversation::CacheControl;
use crate::error::Result;

/// Execution context handed to every tool call.
///
/// Built fresh by the Brain for each processed message, so tools always see
/// the room and sender of the message that triggered them. Background cycles
/// run with an empty room id.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The agent's workspace directory
    pub workspace: PathBuf,
    /// Username of the message sender, empty for internal cycles
    pub username: String,
    /// Room the triggering message arrived in, empty for internal cycles
    pub room_id: String,
    /// Thread of the triggering message, empty if none
    pub thread_id: String,
    /// The agent's own username on the chat transport
    pub agent_username: String,
}

impl ToolContext {
    /// Create a context rooted at a workspace directory.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }

    /// Set the sender username (builder pattern).
    pub fn with_username(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    /// Set the room id (builder pattern).
    pub fn with_room(mut self, room_id: &str) -> Self {
        self.room_id = room_id.to_string();
        self
    }
}

/// Definition of a tool as advertised to inference backends.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// The name of the tool (must be unique)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's input
    pub input_schema: Value,
    /// Prompt-cache marker; the Brain sets this on the last definition so
    /// tools + system form a stable cacheable prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            cache_control: None,
        }
    }
}

/// Trait implemented by every workspace tool.
///
/// Tool failures are reported through `Err`, which the registry flattens into
/// `"Error: ..."` result text; errors never cross the execution bridge.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use famulus::tools::{Tool, ToolContext};
/// use famulus::error::Result;
///
/// struct PingTool;
///
/// #[async_trait]
/// impl Tool for PingTool {
///     fn name(&self) -> &str { "ping" }
///     fn description(&self) -> &str { "Reply with pong" }
///     fn input_schema(&self) -> Value {
///         serde_json::json!({"type": "object", "properties": {}})
///     }
///     async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
///         Ok("pong".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique tool name the model calls it by.
    fn name(&self) -> &str;

    /// Description sent to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's input.
    fn input_schema(&self) -> Value;

    /// Run the tool. The returned string is fed back to the model verbatim.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_context_builder() {
        let ctx = ToolContext::new("/tmp/ws")
            .with_username("ada")
            .with_room("r1");
        assert_eq!(ctx.workspace, PathBuf::from("/tmp/ws"));
        assert_eq!(ctx.username, "ada");
        assert_eq!(ctx.room_id, "r1");
        assert!(ctx.thread_id.is_empty());
    }

    #[test]
    fn test_tool_definition_serialization() {
        let def = ToolDefinition::new(
            "list_files",
            "List files in the workspace",
            serde_json::json!({"type": "object", "properties": {}}),
        );
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["name"], "list_files");
        assert!(json.get("cache_control").is_none());
    }

    #[test]
    fn test_tool_definition_cache_marker_serialized_when_set() {
        let mut def = ToolDefinition::new("t", "d", serde_json::json!({}));
        def.cache_control = Some(CacheControl::ephemeral());
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["cache_control"]["type"], "ephemeral");
    }
}
