use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::tracer::AgentTrace;
use crate::error::Result;

/// 运行记录的持久化出口
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn save(&self, trace: &AgentTrace) -> Result<()>;
}

/// 内存实现
#[derive(Clone, Default)]
pub struct MemoryTraceSink {
    inner: Arc<RwLock<Vec<AgentTrace>>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<AgentTrace> {
        self.inner.read().clone()
    }

    pub fn find(&self, run_id: &str) -> Option<AgentTrace> {
        self.inner
            .read()
            .iter()
            .find(|trace| trace.run_id == run_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn save(&self, trace: &AgentTrace) -> Result<()> {
        self.inner.write().push(trace.clone());
        Ok(())
    }
}

/// 丢弃所有记录
pub struct NullTraceSink;

#[async_trait]
impl TraceSink for NullTraceSink {
    async fn save(&self, _trace: &AgentTrace) -> Result<()> {
        Ok(())
    }
}
