use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PilotError, Result};
use crate::llm::{LlmClient, LlmRequest, ModelTier};

/// L3 评审输入
#[derive(Clone, Debug)]
pub struct JudgeRequest<'a> {
    pub content: &'a str,
    /// 触发 L3 的原因
    pub triggers: &'a [String],
    /// 规则里配置的额外审查条件
    pub conditions: &'a [String],
    pub tier: ModelTier,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub blocked: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

#[async_trait]
pub trait SafetyJudge: Send + Sync {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict>;
}

const JUDGE_SYSTEM_PROMPT: &str = "You are a safety reviewer for an autonomous business agent. \
Decide whether the candidate message may be sent to a real recipient. \
Block it if it is harmful, deceptive, leaks private data, contains unfilled template tokens, \
makes unauthorized commitments, or matches any listed condition. \
Respond with a single JSON object: {\"blocked\": bool, \"confidence\": number between 0 and 1, \"reason\": string}.";

/// 用 LLM 做评审
pub struct LlmJudge {
    client: LlmClient,
}

impl LlmJudge {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    pub fn build_prompt(request: &JudgeRequest<'_>) -> String {
        let mut prompt = String::from("## Why this message needs review\n");
        for trigger in request.triggers {
            prompt.push_str(&format!("- {trigger}\n"));
        }
        if !request.conditions.is_empty() {
            prompt.push_str("\n## Block if any of these conditions hold\n");
            for condition in request.conditions {
                prompt.push_str(&format!("- {condition}\n"));
            }
        }
        prompt.push_str("\n## Candidate message\n<message>\n");
        prompt.push_str(request.content);
        prompt.push_str("\n</message>\n\nReturn only the JSON verdict.");
        prompt
    }
}

/// 从模型输出中取出 JSON 判决，容忍 ```json 代码块与前后说明文字
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => {
            return Err(PilotError::Serialization(format!(
                "judge response contains no JSON object: {raw}"
            )))
        }
    };
    let mut verdict: JudgeVerdict = serde_json::from_str(json)?;
    if !verdict.confidence.is_finite() {
        return Err(PilotError::Serialization(
            "judge confidence is not a number".to_string(),
        ));
    }
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}

#[async_trait]
impl SafetyJudge for LlmJudge {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict> {
        let llm_request = LlmRequest::prompt(Self::build_prompt(request))
            .with_system(JUDGE_SYSTEM_PROMPT)
            .with_tier(request.tier)
            .with_temperature(0.0)
            .with_max_tokens(512);
        let run = self.client.complete_once(llm_request).await?;
        parse_verdict(&run.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let verdict = parse_verdict(
            "Here you go:\n```json\n{\"blocked\": false, \"confidence\": 0.8, \"reason\": \"fine\"}\n```",
        )
        .unwrap();
        assert!(!verdict.blocked);
        assert_eq!(verdict.confidence, 0.8);
    }

    #[test]
    fn clamps_confidence() {
        let verdict = parse_verdict("{\"blocked\": true, \"confidence\": 3}").unwrap();
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.reason, "");
    }

    #[test]
    fn rejects_prose() {
        assert!(parse_verdict("looks fine to me").is_err());
        assert!(parse_verdict("{\"confidence\": 0.4}").is_err());
    }

    #[test]
    fn prompt_lists_triggers_and_conditions() {
        let triggers = vec!["L2 score 0.40 below minimum 0.70".to_string()];
        let conditions = vec!["Mentions pricing".to_string()];
        let prompt = LlmJudge::build_prompt(&JudgeRequest {
            content: "Hello",
            triggers: &triggers,
            conditions: &conditions,
            tier: ModelTier::Fast,
        });
        assert!(prompt.contains("L2 score 0.40"));
        assert!(prompt.contains("Mentions pricing"));
        assert!(prompt.contains("<message>\nHello\n</message>"));
    }
}
