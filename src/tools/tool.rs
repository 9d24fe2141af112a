use async_trait::async_trait;
use serde_json::Value;

use super::manifest::ToolManifest;
use crate::error::Result;

/// 可被模型调用的工具
#[async_trait]
pub trait Tool: Send + Sync {
    fn manifest(&self) -> &ToolManifest;

    fn name(&self) -> &str {
        &self.manifest().name
    }

    async fn call(&self, input: Value) -> Result<Value>;
}

type ToolFn = dyn Fn(Value) -> futures::future::BoxFuture<'static, Result<Value>> + Send + Sync;

/// 由闭包构造的工具
pub struct FnTool {
    manifest: ToolManifest,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(manifest: ToolManifest, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            manifest,
            func: Box::new(move |input| Box::pin(func(input))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    async fn call(&self, input: Value) -> Result<Value> {
        (self.func)(input).await
    }
}
