use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::request::AgentRunRequest;
use super::AgentRunResult;
use crate::config::AgentConfig;
use crate::error::{ExecutionError, Result};

/// 钩子可见的运行信息
#[derive(Clone, Copy, Debug)]
pub struct HookContext<'a> {
    pub agent: &'a AgentConfig,
    pub request: &'a AgentRunRequest,
    pub run_id: &'a str,
}

/// 生命周期钩子，三个阶段均可选实现
#[async_trait]
pub trait AgentHook: Send + Sync {
    fn name(&self) -> &str;

    async fn before(&self, _ctx: HookContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn after(&self, _ctx: HookContext<'_>, _result: &AgentRunResult) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _ctx: HookContext<'_>, _error: &ExecutionError) -> Result<()> {
        Ok(())
    }
}

/// 钩子失败的处理方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailurePolicy {
    /// 第一个失败的钩子终止后续钩子并把错误交给调用方
    #[default]
    Propagate,
    /// 记录日志后继续执行其余钩子
    Isolate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HookPhase {
    Before,
    After,
    Error,
}

impl HookPhase {
    fn as_str(self) -> &'static str {
        match self {
            HookPhase::Before => "before",
            HookPhase::After => "after",
            HookPhase::Error => "on_error",
        }
    }
}

/// 按注册顺序调用的钩子表
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn AgentHook>>,
    policy: HookFailurePolicy,
}

/// 钩子失败的描述
#[derive(Clone, Debug, PartialEq)]
pub struct HookFailure {
    pub hook: String,
    pub phase: &'static str,
    pub message: String,
}

impl std::fmt::Display for HookFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} hook `{}` failed: {}", self.phase, self.hook, self.message)
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: HookFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn register(&mut self, hook: Arc<dyn AgentHook>) {
        self.hooks.push(hook);
    }

    pub fn with(mut self, hook: Arc<dyn AgentHook>) -> Self {
        self.register(hook);
        self
    }

    pub fn policy(&self) -> HookFailurePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) async fn run(
        &self,
        phase: HookPhase,
        ctx: HookContext<'_>,
        result: Option<&AgentRunResult>,
        error: Option<&ExecutionError>,
    ) -> std::result::Result<(), HookFailure> {
        for hook in &self.hooks {
            let outcome = match phase {
                HookPhase::Before => hook.before(ctx).await,
                HookPhase::After => match result {
                    Some(result) => hook.after(ctx, result).await,
                    None => Ok(()),
                },
                HookPhase::Error => match error {
                    Some(error) => hook.on_error(ctx, error).await,
                    None => Ok(()),
                },
            };
            if let Err(err) = outcome {
                let failure = HookFailure {
                    hook: hook.name().to_string(),
                    phase: phase.as_str(),
                    message: err.to_string(),
                };
                match self.policy {
                    HookFailurePolicy::Propagate => return Err(failure),
                    HookFailurePolicy::Isolate => {
                        warn!(run_id = ctx.run_id, error = %failure, "hook failed; continuing");
                    }
                }
            }
        }
        Ok(())
    }
}
