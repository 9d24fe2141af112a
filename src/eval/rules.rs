use std::fmt;

use serde::{Deserialize, Serialize};

use crate::llm::ModelTier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Block,
    Warn,
}

/// 内置断言种类，集合封闭
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssertionKind {
    RecipientName,
    NoPlaceholders,
    LengthBounds {
        #[serde(default)]
        min_words: usize,
        #[serde(default = "default_max_words")]
        max_words: usize,
    },
    NoProfanity,
    HasCallToAction,
    NoCompetitorMention {
        #[serde(default)]
        competitors: Vec<String>,
    },
    NoUnverifiedStats,
    ReferencesPriorConversation,
}

fn default_max_words() -> usize {
    500
}

impl AssertionKind {
    pub fn name(&self) -> &'static str {
        match self {
            AssertionKind::RecipientName => "recipient_name",
            AssertionKind::NoPlaceholders => "no_placeholders",
            AssertionKind::LengthBounds { .. } => "length_bounds",
            AssertionKind::NoProfanity => "no_profanity",
            AssertionKind::HasCallToAction => "has_call_to_action",
            AssertionKind::NoCompetitorMention { .. } => "no_competitor_mention",
            AssertionKind::NoUnverifiedStats => "no_unverified_stats",
            AssertionKind::ReferencesPriorConversation => "references_prior_conversation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssertionRule {
    #[serde(flatten)]
    pub kind: AssertionKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl AssertionRule {
    pub fn block(kind: AssertionKind) -> Self {
        Self {
            kind,
            severity: Severity::Block,
            label: None,
        }
    }

    pub fn warn(kind: AssertionKind) -> Self {
        Self {
            kind,
            severity: Severity::Warn,
            label: None,
        }
    }

    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or_else(|| self.kind.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    ProfessionalTone,
    Empathy,
    Conciseness,
    Clarity,
    Personalization,
}

impl Criterion {
    pub fn name(&self) -> &'static str {
        match self {
            Criterion::ProfessionalTone => "professional_tone",
            Criterion::Empathy => "empathy",
            Criterion::Conciseness => "conciseness",
            Criterion::Clarity => "clarity",
            Criterion::Personalization => "personalization",
        }
    }
}

/// agent 的自主级别
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyTier {
    Auto,
    #[default]
    Review,
    Readonly,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalRules {
    #[serde(default)]
    pub assertions: Vec<AssertionRule>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_auto_send_threshold")]
    pub auto_send_threshold: f64,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default = "default_true")]
    pub l3_enabled: bool,
    #[serde(default = "default_judge_tier")]
    pub judge_tier: ModelTier,
    /// 额外的 L3 审查条件描述，原样写入评审 prompt
    #[serde(default)]
    pub l3_conditions: Vec<String>,
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_auto_send_threshold() -> f64 {
    0.85
}

fn default_true() -> bool {
    true
}

fn default_judge_tier() -> ModelTier {
    ModelTier::Fast
}

impl Default for EvalRules {
    fn default() -> Self {
        Self {
            assertions: Vec::new(),
            criteria: Vec::new(),
            min_confidence: default_min_confidence(),
            auto_send_threshold: default_auto_send_threshold(),
            require_approval: false,
            l3_enabled: true,
            judge_tier: default_judge_tier(),
            l3_conditions: Vec::new(),
        }
    }
}

impl EvalRules {
    /// 外发邮件的默认规则
    pub fn outbound_email() -> Self {
        Self {
            assertions: vec![
                AssertionRule::block(AssertionKind::NoPlaceholders),
                AssertionRule::block(AssertionKind::NoProfanity),
                AssertionRule::block(AssertionKind::LengthBounds {
                    min_words: 10,
                    max_words: 400,
                }),
                AssertionRule::warn(AssertionKind::RecipientName),
                AssertionRule::warn(AssertionKind::HasCallToAction),
                AssertionRule::warn(AssertionKind::NoUnverifiedStats),
            ],
            criteria: vec![
                Criterion::ProfessionalTone,
                Criterion::Conciseness,
                Criterion::Clarity,
            ],
            l3_conditions: vec![
                "The message makes commitments on pricing, contracts or legal terms".to_string(),
                "The message shares confidential or personal data".to_string(),
            ],
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoSend,
    NeedsReview,
    Blocked,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Decision::AutoSend => "auto_send",
            Decision::NeedsReview => "needs_review",
            Decision::Blocked => "blocked",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rules_deserialize_with_defaults() {
        let rules: EvalRules = serde_json::from_value(json!({
            "assertions": [
                { "kind": "no_placeholders", "severity": "block" },
                { "kind": "length_bounds", "severity": "warn", "max_words": 120 },
                { "kind": "no_competitor_mention", "severity": "block", "competitors": ["Acme"] }
            ],
            "criteria": ["professional_tone", "conciseness"]
        }))
        .unwrap();

        assert_eq!(rules.assertions.len(), 3);
        assert_eq!(rules.assertions[0].name(), "no_placeholders");
        assert_eq!(
            rules.assertions[1].kind,
            AssertionKind::LengthBounds {
                min_words: 0,
                max_words: 120
            }
        );
        assert_eq!(rules.min_confidence, 0.7);
        assert_eq!(rules.auto_send_threshold, 0.85);
        assert!(rules.l3_enabled);
    }

    #[test]
    fn label_overrides_name() {
        let mut rule = AssertionRule::warn(AssertionKind::NoProfanity);
        rule.label = Some("clean_language".into());
        assert_eq!(rule.name(), "clean_language");
    }
}
