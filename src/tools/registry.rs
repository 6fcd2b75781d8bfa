//! Tool registry
//!
//! Holds the registered tools and dispatches calls by name. The registry's
//! `execute` never returns an error: unknown tools and tool failures both
//! surface as result text so the model can read them and self-correct.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::types::{Tool, ToolContext, ToolDefinition};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a tool. A tool registered under an existing name replaces it.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check whether a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions of all registered tools, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition::new(tool.name(), tool.description(), tool.input_schema()))
            .collect()
    }

    /// Execute a tool by name.
    ///
    /// Never fails outward: an unknown tool yields `"Unknown tool: ..."`,
    /// a tool error yields `"Error: ..."`, and non-object arguments degrade
    /// to an empty map rather than aborting the round.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("Unknown tool: {}", name);
        };

        let args = if args.is_object() {
            args
        } else {
            warn!(tool = name, "Non-object tool arguments, using empty map");
            Value::Object(serde_json::Map::new())
        };

        match tool.execute(args, ctx).await {
            Ok(result) => result,
            Err(e) => format!("Error: {}", e),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A trivial tool that echoes its input back. Used in tests and smoke runs.
pub struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> crate::error::Result<String> {
        Ok(args
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FamulusError;

    struct FailTool;

    #[async_trait::async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> crate::error::Result<String> {
            Err(FamulusError::Tool("deliberate failure".into()))
        }
    }

    #[tokio::test]
    async fn test_register_and_definitions() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(FailTool));

        assert_eq!(registry.len(), 2);
        assert!(registry.has("echo"));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[1].name, "fail");
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let ctx = ToolContext::default();
        let result = registry
            .execute("echo", serde_json::json!({"text": "hi"}), &ctx)
            .await;
        assert_eq!(result, "hi");
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let ctx = ToolContext::default();
        let result = registry
            .execute("missing", serde_json::json!({}), &ctx)
            .await;
        assert_eq!(result, "Unknown tool: missing");
    }

    #[tokio::test]
    async fn test_execute_tool_error_becomes_text() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailTool));

        let ctx = ToolContext::default();
        let result = registry.execute("fail", serde_json::json!({}), &ctx).await;
        assert!(result.starts_with("Error:"));
        assert!(result.contains("deliberate failure"));
    }

    #[tokio::test]
    async fn test_execute_non_object_args_degrade() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let ctx = ToolContext::default();
        // A bare string is not a valid argument mapping; the registry
        // substitutes an empty map and the tool sees no "text" key.
        let result = registry
            .execute("echo", Value::String("not a map".into()), &ctx)
            .await;
        assert_eq!(result, "");
    }

    #[tokio::test]
    async fn test_reregister_replaces() {
        struct Echo2;
        #[async_trait::async_trait]
        impl Tool for Echo2 {
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "v2"
            }
            fn input_schema(&self) -> Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(
                &self,
                _args: Value,
                _ctx: &ToolContext,
            ) -> crate::error::Result<String> {
                Ok("v2".into())
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(Echo2));

        assert_eq!(registry.len(), 1);
        let ctx = ToolContext::default();
        let result = registry.execute("echo", serde_json::json!({}), &ctx).await;
        assert_eq!(result, "v2");
    }
}
