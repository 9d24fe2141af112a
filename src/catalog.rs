use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{PilotError, Result};
use crate::workflow::WorkflowGraph;

/// 按 id 查找的只读配置目录
pub struct Catalog<T> {
    kind: &'static str,
    inner: RwLock<HashMap<String, Arc<T>>>,
}

pub type AgentCatalog = Catalog<AgentConfig>;
pub type WorkflowCatalog = Catalog<WorkflowGraph>;

impl<T> Catalog<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: impl Into<String>, item: T) {
        self.inner.write().insert(id.into(), Arc::new(item));
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.inner.read().get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<T>> {
        self.get(id)
            .ok_or_else(|| PilotError::config(format!("unknown {} `{id}`", self.kind)))
    }
}

impl AgentCatalog {
    pub fn agents() -> Self {
        Self::new("agent")
    }

    pub fn add(&self, config: AgentConfig) {
        self.insert(config.id.clone(), config);
    }

    /// 读取目录下所有 `*.json` agent 配置
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let mut loaded = 0;
        for path in json_files(dir.as_ref())? {
            let config = AgentConfig::from_path(&path)?;
            debug!(agent_id = %config.id, path = %path.display(), "agent config loaded");
            self.add(config);
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl WorkflowCatalog {
    pub fn workflows() -> Self {
        Self::new("workflow")
    }

    /// 读取目录下所有 `*.json` 工作流；没有 id 时用文件名
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let mut loaded = 0;
        for path in json_files(dir.as_ref())? {
            let graph = WorkflowGraph::from_path(&path)?;
            let id = match graph.id.clone() {
                Some(id) => id,
                None => path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        PilotError::config(format!("invalid workflow file name {}", path.display()))
                    })?,
            };
            debug!(workflow = %id, path = %path.display(), "workflow loaded");
            self.insert(id, graph);
            loaded += 1;
        }
        Ok(loaded)
    }
}

fn json_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|err| PilotError::config(format!("failed to read {}: {err}", dir.display())))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| PilotError::config(format!("failed to read {}: {err}", dir.display())))?
            .path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_names_missing_entry() {
        let catalog = AgentCatalog::agents();
        catalog.add(AgentConfig::new("a1", "Writer", "Write."));
        assert!(catalog.require("a1").is_ok());
        let err = catalog.require("nope").unwrap_err();
        assert!(err.to_string().contains("unknown agent `nope`"));
    }

    #[test]
    fn loads_workflows_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("welcome.json"),
            r#"{"nodes": [{"id": "a", "type": "set"}]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = WorkflowCatalog::workflows();
        assert_eq!(catalog.load_dir(dir.path()).unwrap(), 1);
        assert!(catalog.require("welcome").is_ok());
        assert!(catalog.get("notes").is_none());
    }
}
