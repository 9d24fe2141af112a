use thiserror::Error;

pub type Result<T> = std::result::Result<T, PilotError>;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("unknown node type `{0}`: no executor registered")]
    UnknownNodeType(String),
    #[error("node `{node}` is missing required field `{field}`")]
    MissingField { node: String, field: String },
    #[error("workflow contains a cycle involving nodes: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("node `{node}` failed: {message}")]
    Node { node: String, message: String },
    #[error("job error: {0}")]
    Job(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PilotError {
    /// 队列据此决定是否还值得重试
    pub fn is_retryable(&self) -> bool {
        match self {
            PilotError::UnknownNodeType(_)
            | PilotError::MissingField { .. }
            | PilotError::Cycle(_)
            | PilotError::Config(_)
            | PilotError::Serialization(_) => false,
            PilotError::Llm(err) => err.is_retryable(),
            PilotError::Execution(err) => err.retryable,
            _ => true,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PilotError::Config(message.into())
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(err: serde_json::Error) -> Self {
        PilotError::Serialization(err.to_string())
    }
}

/// LLM 调用错误，区分可重试与不可重试
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("invalid credential (status {status}): {message}")]
    InvalidCredential { status: u16, message: String },
    #[error("provider server error (status {status}): {message}")]
    Server { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("provider rejected request (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => LlmError::InvalidCredential { status, message },
            429 => LlmError::RateLimited(message),
            500..=599 => LlmError::Server { status, message },
            _ => LlmError::Api { status, message },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::Server { .. } | LlmError::Network(_)
        )
    }
}

/// 单次 agent 运行失败
#[derive(Debug, Clone, Error)]
#[error("agent `{agent_id}` run `{run_id}` failed: {message}")]
pub struct ExecutionError {
    pub agent_id: String,
    pub run_id: String,
    pub message: String,
    pub retryable: bool,
}
