//! 三级输出评估闸门
//!
//! L1 确定性断言 → L2 启发式打分 → （按条件）L3 LLM 评审 → 最终决定。
//! L3 任何异常都按拦截处理，不会放行未经评估的动作。

pub mod assertions;
pub mod judge;
pub mod rules;
pub mod scoring;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use assertions::{run_l1, AssertionOutcome, L1Result};
pub use judge::{JudgeRequest, JudgeVerdict, LlmJudge, SafetyJudge};
pub use rules::{
    AssertionKind, AssertionRule, AutonomyTier, Criterion, Decision, EvalRules, Severity,
};
pub use scoring::{run_l2, CriterionScore, L2Result};

/// 评估时可用的上下文
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvalContext {
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<String>,
    #[serde(default)]
    pub autonomy: AutonomyTier,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct L3Result {
    pub triggered: bool,
    pub blocked: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl L3Result {
    pub fn skipped() -> Self {
        Self::default()
    }

    fn fail_closed(triggers: Vec<String>, reason: String) -> Self {
        Self {
            triggered: true,
            blocked: true,
            confidence: 0.0,
            reason,
            triggers,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub l1: L1Result,
    /// L1 未通过时不执行
    pub l2: Option<L2Result>,
    pub l3: L3Result,
    pub decision: Decision,
}

impl EvalResult {
    pub fn l1_passed(&self) -> bool {
        self.l1.passed
    }

    pub fn l2_score(&self) -> Option<f64> {
        self.l2.as_ref().map(|l2| l2.score)
    }

    /// 人类可读的结论摘要
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("decision={}", self.decision)];
        let blocking: Vec<&str> = self
            .l1
            .blocking_failures()
            .map(|a| a.name.as_str())
            .collect();
        if !blocking.is_empty() {
            parts.push(format!("l1 failed: {}", blocking.join(", ")));
        }
        if let Some(score) = self.l2_score() {
            parts.push(format!("l2={score:.2}"));
        }
        if self.l3.triggered {
            parts.push(format!(
                "l3 blocked={} confidence={:.2} reason={}",
                self.l3.blocked, self.l3.confidence, self.l3.reason
            ));
        }
        parts.join("; ")
    }
}

/// 是否强制人工审批
pub fn approval_mandated(rules: &EvalRules, autonomy: AutonomyTier) -> bool {
    rules.require_approval || autonomy != AutonomyTier::Auto
}

/// 返回触发 L3 的原因列表；为空表示不触发
pub fn l3_triggers(
    l1_passed: bool,
    l2_score: Option<f64>,
    rules: &EvalRules,
    mandated: bool,
) -> Vec<String> {
    let mut triggers = Vec::new();
    if !l1_passed {
        triggers.push("L1 blocking assertion failed".to_string());
    }
    if let Some(score) = l2_score {
        if score < rules.min_confidence {
            triggers.push(format!(
                "L2 score {score:.2} below minimum confidence {:.2}",
                rules.min_confidence
            ));
        }
    }
    if mandated {
        triggers.push("approval is mandated for this agent".to_string());
    }
    triggers
}

/// 严格优先级：L3 拦截或 L1 失败 → blocked；达到阈值且无需审批 → auto_send；否则 needs_review
pub fn decide(l1_passed: bool, l2_score: Option<f64>, l3: &L3Result, rules: &EvalRules, mandated: bool) -> Decision {
    if l3.blocked || !l1_passed {
        return Decision::Blocked;
    }
    match l2_score {
        Some(score) if score >= rules.auto_send_threshold && !mandated => Decision::AutoSend,
        _ => Decision::NeedsReview,
    }
}

#[derive(Clone, Default)]
pub struct EvalEngine {
    judge: Option<Arc<dyn SafetyJudge>>,
}

impl EvalEngine {
    pub fn new(judge: Arc<dyn SafetyJudge>) -> Self {
        Self { judge: Some(judge) }
    }

    /// 不带评审者；一旦需要 L3 即按拦截处理
    pub fn without_judge() -> Self {
        Self { judge: None }
    }

    pub fn has_judge(&self) -> bool {
        self.judge.is_some()
    }

    pub async fn evaluate(&self, content: &str, ctx: &EvalContext, rules: &EvalRules) -> EvalResult {
        let l1 = run_l1(&rules.assertions, content, ctx);
        let l2 = l1
            .passed
            .then(|| run_l2(&rules.criteria, content, ctx));
        let l2_score = l2.as_ref().map(|r| r.score);
        let mandated = approval_mandated(rules, ctx.autonomy);

        let triggers = l3_triggers(l1.passed, l2_score, rules, mandated);
        let l3 = if triggers.is_empty() || !rules.l3_enabled {
            L3Result::skipped()
        } else {
            self.run_l3(content, triggers, rules).await
        };

        let decision = decide(l1.passed, l2_score, &l3, rules, mandated);
        let result = EvalResult {
            l1,
            l2,
            l3,
            decision,
        };
        info!(decision = %result.decision, summary = %result.summary(), "eval finished");
        result
    }

    async fn run_l3(&self, content: &str, triggers: Vec<String>, rules: &EvalRules) -> L3Result {
        let Some(judge) = &self.judge else {
            warn!("L3 required but no judge configured; blocking");
            return L3Result::fail_closed(triggers, "no safety judge configured".to_string());
        };
        let request = JudgeRequest {
            content,
            triggers: &triggers,
            conditions: &rules.l3_conditions,
            tier: rules.judge_tier,
        };
        match judge.judge(&request).await {
            Ok(verdict) => L3Result {
                triggered: true,
                blocked: verdict.blocked,
                confidence: verdict.confidence,
                reason: verdict.reason,
                triggers,
            },
            Err(err) => {
                warn!(error = %err, "L3 evaluation failed; blocking");
                L3Result::fail_closed(triggers, format!("evaluation error: {err}"))
            }
        }
    }
}
