use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::{EnvConfig, FetchSource};

/// 抓取时使用的凭据，每次调用前重新解析
#[derive(Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// 外部数据源接口
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &FetchSource,
        credentials: &Credentials,
    ) -> std::result::Result<Value, String>;
}

/// 单个数据源的抓取结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceData {
    pub source: String,
    pub kind: String,
    pub result: std::result::Result<Value, String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl SourceData {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// 并发抓取所有数据源；单个数据源失败不影响其他数据源
pub async fn fetch_all(fetcher: &dyn DataFetcher, sources: &[FetchSource]) -> Vec<SourceData> {
    let tasks = sources.iter().map(|source| async move {
        let started = Instant::now();
        let result = match resolve_credentials(source) {
            Ok(credentials) => fetcher.fetch(source, &credentials).await,
            Err(message) => Err(message),
        };
        if let Err(reason) = &result {
            warn!(source = %source.name, kind = %source.kind, error = %reason, "data source unavailable");
        }
        SourceData {
            source: source.name.clone(),
            kind: source.kind.clone(),
            result,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    });
    join_all(tasks).await
}

fn resolve_credentials(source: &FetchSource) -> std::result::Result<Credentials, String> {
    match source.credential.as_deref() {
        None => Ok(Credentials::default()),
        Some(reference) => EnvConfig::resolve(reference)
            .map(|token| Credentials { token: Some(token) })
            .map_err(|err| format!("credential for `{}` unavailable: {err}", source.name)),
    }
}

/// 没有外部数据源时使用
pub struct NoopFetcher;

#[async_trait]
impl DataFetcher for NoopFetcher {
    async fn fetch(
        &self,
        source: &FetchSource,
        _credentials: &Credentials,
    ) -> std::result::Result<Value, String> {
        Err(format!("no fetcher configured for source kind `{}`", source.kind))
    }
}

/// 静态数据，主要用于测试与本地演示
#[derive(Clone, Default)]
pub struct StaticFetcher {
    data: HashMap<String, std::result::Result<Value, String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, source: impl Into<String>, value: Value) -> Self {
        self.data.insert(source.into(), Ok(value));
        self
    }

    pub fn with_failure(mut self, source: impl Into<String>, reason: impl Into<String>) -> Self {
        self.data.insert(source.into(), Err(reason.into()));
        self
    }
}

#[async_trait]
impl DataFetcher for StaticFetcher {
    async fn fetch(
        &self,
        source: &FetchSource,
        _credentials: &Credentials,
    ) -> std::result::Result<Value, String> {
        self.data
            .get(&source.name)
            .cloned()
            .unwrap_or_else(|| Err(format!("no data for `{}`", source.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn failing_source_does_not_abort_others() {
        let fetcher = StaticFetcher::new()
            .with_data("deals", json!([{"name": "Acme renewal"}]))
            .with_failure("inbox", "token expired");
        let sources = vec![
            FetchSource::new("deals", "crm"),
            FetchSource::new("inbox", "gmail"),
        ];
        let results = fetch_all(&fetcher, &sources).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(results[1].result, Err("token expired".to_string()));
    }

    #[tokio::test]
    async fn unresolvable_credential_is_per_source_error() {
        let mut source = FetchSource::new("calendar", "calendar");
        source.credential = Some("${AGENTPILOT_TEST_MISSING_TOKEN}".into());
        let fetcher = StaticFetcher::new().with_data("calendar", json!({}));
        let results = fetch_all(&fetcher, &[source]).await;
        assert!(results[0].result.as_ref().unwrap_err().contains("credential"));
    }
}
