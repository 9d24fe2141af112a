pub mod manifest;
pub mod registry;
pub mod tool;

pub use manifest::{ToolManifest, ToolManifestBuilder};
pub use registry::ToolRegistry;
pub use tool::{FnTool, Tool};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::error::PilotError;
    use crate::llm::{ToolCall, ToolHandler};

    fn echo_tool() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            ToolManifest::builder("echo")
                .description("echo the input text")
                .input("text", "string", true)
                .build(),
            |input| async move { Ok(input["text"].clone()) },
        ))
    }

    fn failing_tool() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            ToolManifest::builder("explode").build(),
            |_| async move { Err(PilotError::Other(anyhow::anyhow!("intentional failure"))) },
        ))
    }

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            input,
        }
    }

    #[tokio::test]
    async fn registry_dispatches_and_stringifies() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        let output = registry
            .handle(&call("echo", json!({"text": "hello"})))
            .await
            .unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn registry_reports_errors_as_strings() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        registry.register(failing_tool()).unwrap();

        let unknown = registry.handle(&call("nope", json!({}))).await.unwrap_err();
        assert!(unknown.contains("unknown tool"));

        let missing = registry.handle(&call("echo", json!({}))).await.unwrap_err();
        assert!(missing.contains("text"));

        let failed = registry.handle(&call("explode", json!({}))).await.unwrap_err();
        assert!(failed.contains("intentional failure"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        assert!(registry.register(echo_tool()).is_err());
    }
}
