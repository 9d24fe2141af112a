use serde_json::Value;

use super::fetch::SourceData;
use super::request::AgentRunRequest;
use crate::config::AgentConfig;

/// 组装后的 prompt
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltPrompt {
    pub system: String,
    pub user: String,
}

/// 系统提示 + 数据块 + 附加上下文 + 用户消息
pub fn build_prompt(agent: &AgentConfig, data: &[SourceData], request: &AgentRunRequest) -> BuiltPrompt {
    let mut system = agent.system_prompt.trim().to_string();
    if !agent.allowed_actions.is_empty() {
        system.push_str("\n\nYou may only propose these actions: ");
        system.push_str(&agent.allowed_actions.join(", "));
        system.push('.');
    }

    let mut sections = Vec::new();
    for item in data {
        sections.push(format_block(item));
    }
    if let Some(context) = request.additional_context.as_deref().filter(|c| !c.trim().is_empty()) {
        sections.push(format!("## Additional context\n{}", context.trim()));
    }
    if let Some(name) = request.recipient_name.as_deref() {
        sections.push(format!("## Recipient\n{name}"));
    }
    if !request.conversation_history.is_empty() {
        let history = request
            .conversation_history
            .iter()
            .map(|line| format!("- {line}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Prior conversation\n{history}"));
    }
    match request.user_message.as_deref().filter(|m| !m.trim().is_empty()) {
        Some(message) => sections.push(format!("## Request\n{}", message.trim())),
        None => sections.push("## Request\nProduce the next action for this agent.".to_string()),
    }

    BuiltPrompt {
        system,
        user: sections.join("\n\n"),
    }
}

fn format_block(item: &SourceData) -> String {
    match &item.result {
        Ok(value) => format!(
            "## Data: {} ({})\n```json\n{}\n```",
            item.source,
            item.kind,
            pretty(value)
        ),
        Err(reason) => format!(
            "## Data: {} ({})\n[unavailable: {reason}]",
            item.source, item.kind
        ),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_contains_blocks_in_order() {
        let mut agent = AgentConfig::new("a", "Writer", "Be brief.");
        agent.allowed_actions = vec!["send_email".into()];
        let data = vec![
            SourceData {
                source: "deals".into(),
                kind: "crm".into(),
                result: Ok(json!({"stage": "proposal"})),
                duration_ms: 3,
            },
            SourceData {
                source: "inbox".into(),
                kind: "gmail".into(),
                result: Err("token expired".into()),
                duration_ms: 1,
            },
        ];
        let request = AgentRunRequest::default()
            .with_context("Quarter ends Friday")
            .with_message("Draft a follow-up");
        let prompt = build_prompt(&agent, &data, &request);

        assert!(prompt.system.starts_with("Be brief."));
        assert!(prompt.system.contains("send_email"));
        let deals = prompt.user.find("## Data: deals").unwrap();
        let inbox = prompt.user.find("[unavailable: token expired]").unwrap();
        let context = prompt.user.find("Quarter ends Friday").unwrap();
        let ask = prompt.user.find("Draft a follow-up").unwrap();
        assert!(deals < inbox && inbox < context && context < ask);
    }

    #[test]
    fn default_request_when_message_missing() {
        let agent = AgentConfig::new("a", "Writer", "Be brief.");
        let prompt = build_prompt(&agent, &[], &AgentRunRequest::default());
        assert!(prompt.user.contains("Produce the next action"));
    }
}
