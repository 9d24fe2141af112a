use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use agentpilot::eval::{
    AutonomyTier, Decision, EvalContext, EvalEngine, EvalRules, LlmJudge,
};
use agentpilot::llm::{ChatModel, LlmClient, ModelRequest, ModelResponse};
use agentpilot::LlmError;

/// 固定回复的评审模型，记录使用的模型 id
struct VerdictModel {
    reply: std::result::Result<String, LlmError>,
    models: Mutex<Vec<String>>,
}

impl VerdictModel {
    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.to_string()),
            models: Mutex::new(Vec::new()),
        })
    }

    fn failing(err: LlmError) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(err),
            models: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChatModel for VerdictModel {
    fn name(&self) -> &str {
        "verdict"
    }

    async fn respond(&self, request: ModelRequest) -> Result<ModelResponse, LlmError> {
        self.models.lock().push(request.model);
        self.reply.clone().map(ModelResponse::text)
    }
}

fn auto_ctx(recipient: &str) -> EvalContext {
    EvalContext {
        recipient_name: Some(recipient.to_string()),
        conversation_history: Vec::new(),
        autonomy: AutonomyTier::Auto,
    }
}

const GOOD_EMAIL: &str = "Hi Dana, thank you for your time on Tuesday. \
I have attached the proposal we discussed. Could we schedule a short call next week to review it? \
Best regards, Sam";

#[test]
fn rules_load_from_json() {
    let rules: EvalRules = serde_json::from_value(json!({
        "assertions": [
            {"kind": "no_placeholders", "severity": "block"},
            {"kind": "length_bounds", "severity": "block", "min_words": 5, "max_words": 50},
            {"kind": "no_competitor_mention", "severity": "warn", "competitors": ["Globex"]}
        ],
        "criteria": ["professional_tone", "clarity"],
        "auto_send_threshold": 0.6
    }))
    .unwrap();
    assert_eq!(rules.assertions.len(), 3);
    assert_eq!(rules.min_confidence, 0.7);
    assert!(rules.l3_enabled);
}

#[tokio::test]
async fn outbound_rules_pass_a_clean_email_without_judge_call() {
    let model = VerdictModel::replying("{\"blocked\": true, \"confidence\": 1}");
    let engine = EvalEngine::new(Arc::new(LlmJudge::new(LlmClient::new(model.clone()))));
    let rules = EvalRules {
        auto_send_threshold: 0.5,
        ..EvalRules::outbound_email()
    };

    let result = engine.evaluate(GOOD_EMAIL, &auto_ctx("Dana Lee"), &rules).await;

    assert!(result.l1_passed());
    assert!(!result.l3.triggered);
    assert_eq!(result.decision, Decision::AutoSend);
    assert!(model.models.lock().is_empty());
}

#[tokio::test]
async fn judge_verdict_in_code_fence_blocks_mandated_send() {
    let model = VerdictModel::replying(
        "```json\n{\"blocked\": true, \"confidence\": 0.92, \"reason\": \"promises a discount\"}\n```",
    );
    let engine = EvalEngine::new(Arc::new(LlmJudge::new(LlmClient::new(model.clone()))));
    let rules = EvalRules {
        require_approval: true,
        ..EvalRules::outbound_email()
    };

    let result = engine.evaluate(GOOD_EMAIL, &auto_ctx("Dana"), &rules).await;

    assert!(result.l3.triggered);
    assert!(result.l3.blocked);
    assert_eq!(result.l3.reason, "promises a discount");
    assert_eq!(result.decision, Decision::Blocked);
    // 评审默认走 fast 档
    assert_eq!(model.models.lock().as_slice(), ["claude-3-5-haiku-latest"]);
}

#[tokio::test]
async fn judge_transport_error_fails_closed() {
    let model = VerdictModel::failing(LlmError::Network("connection refused".into()));
    let engine = EvalEngine::new(Arc::new(LlmJudge::new(LlmClient::new(model))));
    let ctx = EvalContext {
        autonomy: AutonomyTier::Readonly,
        ..auto_ctx("Dana")
    };

    let result = engine
        .evaluate(GOOD_EMAIL, &ctx, &EvalRules::outbound_email())
        .await;

    assert!(result.l3.blocked);
    assert_eq!(result.l3.confidence, 0.0);
    assert!(result.l3.reason.contains("evaluation error"));
    assert_eq!(result.decision, Decision::Blocked);
}

#[tokio::test]
async fn unparseable_verdict_fails_closed() {
    let model = VerdictModel::replying("I think this is fine.");
    let engine = EvalEngine::new(Arc::new(LlmJudge::new(LlmClient::new(model))));
    let rules = EvalRules {
        require_approval: true,
        ..EvalRules::default()
    };

    let result = engine.evaluate(GOOD_EMAIL, &auto_ctx("Dana"), &rules).await;
    assert_eq!(result.decision, Decision::Blocked);
}

#[tokio::test]
async fn approved_review_stays_in_review() {
    let model = VerdictModel::replying("{\"blocked\": false, \"confidence\": 0.95, \"reason\": \"ok\"}");
    let engine = EvalEngine::new(Arc::new(LlmJudge::new(LlmClient::new(model))));
    let ctx = EvalContext {
        autonomy: AutonomyTier::Review,
        ..auto_ctx("Dana")
    };

    let result = engine
        .evaluate(GOOD_EMAIL, &ctx, &EvalRules::outbound_email())
        .await;
    assert!(!result.l3.blocked);
    assert_eq!(result.decision, Decision::NeedsReview);
}
