use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::tool::Tool;
use crate::error::{PilotError, Result};
use crate::llm::{ToolCall, ToolDefinition, ToolHandler};

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(PilotError::config(format!("tool `{name}` registered twice")));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn validate_input(tool: &dyn Tool, input: &Value) -> std::result::Result<(), String> {
        let required = tool.manifest().required_inputs();
        if required.is_empty() {
            return Ok(());
        }
        let object = input
            .as_object()
            .ok_or_else(|| format!("tool `{}` expects an object input", tool.name()))?;
        let missing: Vec<&str> = required
            .into_iter()
            .filter(|field| !object.contains_key(*field))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "tool `{}` missing required input: {}",
                tool.name(),
                missing.join(", ")
            ))
        }
    }
}

#[async_trait]
impl ToolHandler for ToolRegistry {
    /// 按名称排序的工具定义，保证请求体稳定
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self
            .tools
            .values()
            .map(|tool| tool.manifest().definition())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    async fn handle(&self, call: &ToolCall) -> std::result::Result<String, String> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| format!("unknown tool `{}`", call.name))?;
        Self::validate_input(tool.as_ref(), &call.input)?;
        debug!(tool = %call.name, "invoking tool");
        match tool.call(call.input.clone()).await {
            Ok(Value::String(text)) => Ok(text),
            Ok(value) => Ok(value.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }
}
