use std::fmt;

use serde::{Deserialize, Serialize};

/// 触发来源；入队之后统一处理
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Manual,
    #[serde(alias = "schedule")]
    Cron,
    Webhook,
    #[serde(alias = "calendar_event")]
    Calendar,
    #[serde(alias = "form_submission")]
    Form,
    Workflow,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Cron => "cron",
            TriggerSource::Webhook => "webhook",
            TriggerSource::Calendar => "calendar",
            TriggerSource::Form => "form",
            TriggerSource::Workflow => "workflow",
        };
        f.write_str(text)
    }
}

/// 一次 agent 运行的输入
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunRequest {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub triggered_by: TriggerSource,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub additional_context: Option<String>,
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<String>,
}

impl AgentRunRequest {
    pub fn new(triggered_by: TriggerSource) -> Self {
        Self {
            triggered_by,
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.additional_context = Some(context.into());
        self
    }

    pub fn with_recipient(mut self, name: impl Into<String>) -> Self {
        self.recipient_name = Some(name.into());
        self
    }
}
