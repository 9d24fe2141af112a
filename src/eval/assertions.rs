use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::rules::{AssertionKind, AssertionRule, Severity};
use super::EvalContext;

static PLACEHOLDER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\[\s*insert[^\]]*\]",
        r"\[[A-Z][A-Z0-9 _\-]*\]",
        r"\{\{\s*[^{}]*\s*\}\}",
        r"\{\s*[A-Za-z_][A-Za-z0-9_.]*\s*\}",
        r"<<[^<>]*>>",
        r"X{4,}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static PROFANITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(damn|shit|fuck\w*|crap|bastard|bitch|asshole|piss(ed)?|bullshit)\b")
        .expect("profanity pattern compiles")
});

static STATISTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+(\.\d+)?\s?%|\b\d+(\.\d+)?x\b|\b\d+\s+times\b|studies show|research shows|statistics show)")
        .expect("statistic pattern compiles")
});

const SOURCE_MARKERS: &[&str] = &["according to", "source:", "sources:", "http://", "https://", "per the", "reported by"];

const CALL_TO_ACTION: &[&str] = &[
    "let me know",
    "reply",
    "schedule",
    "book a",
    "give me a call",
    "call me",
    "click",
    "sign up",
    "get in touch",
    "reach out",
    "are you available",
    "would you be open",
    "can we",
    "let's",
    "shall we",
    "please confirm",
];

const PRIOR_CONVERSATION: &[&str] = &[
    "as we discussed",
    "as discussed",
    "following up",
    "follow up on",
    "per our conversation",
    "our conversation",
    "our call",
    "our meeting",
    "last time",
    "you mentioned",
    "as mentioned",
    "your last email",
    "your reply",
    "thanks for getting back",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub name: String,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct L1Result {
    pub passed: bool,
    pub assertions: Vec<AssertionOutcome>,
}

impl L1Result {
    pub fn failures(&self) -> impl Iterator<Item = &AssertionOutcome> {
        self.assertions.iter().filter(|a| !a.passed)
    }

    pub fn blocking_failures(&self) -> impl Iterator<Item = &AssertionOutcome> {
        self.failures().filter(|a| a.severity == Severity::Block)
    }
}

pub fn word_count(content: &str) -> usize {
    content.split_whitespace().count()
}

/// 所有断言都会执行；只有 block 级别的失败影响结论
pub fn run_l1(rules: &[AssertionRule], content: &str, ctx: &EvalContext) -> L1Result {
    let assertions: Vec<AssertionOutcome> = rules
        .iter()
        .map(|rule| {
            let (passed, message) = check(&rule.kind, content, ctx);
            AssertionOutcome {
                name: rule.name().to_string(),
                severity: rule.severity,
                passed,
                message,
            }
        })
        .collect();
    let passed = !assertions
        .iter()
        .any(|a| !a.passed && a.severity == Severity::Block);
    L1Result { passed, assertions }
}

fn check(kind: &AssertionKind, content: &str, ctx: &EvalContext) -> (bool, String) {
    match kind {
        AssertionKind::RecipientName => recipient_name(content, ctx),
        AssertionKind::NoPlaceholders => no_placeholders(content),
        AssertionKind::LengthBounds {
            min_words,
            max_words,
        } => length_bounds(content, *min_words, *max_words),
        AssertionKind::NoProfanity => no_profanity(content),
        AssertionKind::HasCallToAction => has_call_to_action(content),
        AssertionKind::NoCompetitorMention { competitors } => {
            no_competitor_mention(content, competitors)
        }
        AssertionKind::NoUnverifiedStats => no_unverified_stats(content),
        AssertionKind::ReferencesPriorConversation => references_prior_conversation(content, ctx),
    }
}

fn recipient_name(content: &str, ctx: &EvalContext) -> (bool, String) {
    let Some(name) = ctx.recipient_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
        return (true, "no recipient name provided; check skipped".to_string());
    };
    let first = name.split_whitespace().next().unwrap_or(name);
    if mentions_word(&content.to_lowercase(), first) {
        (true, format!("recipient name `{first}` present"))
    } else {
        (false, format!("recipient name `{first}` not found in content"))
    }
}

pub fn find_placeholders(content: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for pattern in PLACEHOLDER_PATTERNS.iter() {
        for m in pattern.find_iter(content) {
            let text = m.as_str().to_string();
            let covered = found.iter().any(|f| f.contains(&text) || text.contains(f.as_str()));
            if !covered {
                found.push(text);
            }
        }
    }
    found
}

fn no_placeholders(content: &str) -> (bool, String) {
    let found = find_placeholders(content);
    if found.is_empty() {
        (true, "no placeholder tokens".to_string())
    } else {
        (false, format!("placeholder tokens found: {}", found.join(", ")))
    }
}

fn length_bounds(content: &str, min_words: usize, max_words: usize) -> (bool, String) {
    let words = word_count(content);
    if words < min_words {
        (false, format!("{words} words is below the minimum of {min_words}"))
    } else if words > max_words {
        (false, format!("{words} words exceeds the maximum of {max_words}"))
    } else {
        (true, format!("{words} words within {min_words}..={max_words}"))
    }
}

fn no_profanity(content: &str) -> (bool, String) {
    let hits: Vec<&str> = PROFANITY.find_iter(content).map(|m| m.as_str()).collect();
    if hits.is_empty() {
        (true, "no profanity".to_string())
    } else {
        (false, format!("profanity found: {}", hits.join(", ")))
    }
}

fn has_call_to_action(content: &str) -> (bool, String) {
    let lower = content.to_lowercase();
    if let Some(phrase) = CALL_TO_ACTION.iter().find(|p| lower.contains(*p)) {
        return (true, format!("call to action `{phrase}` present"));
    }
    if content.contains('?') {
        return (true, "closing question present".to_string());
    }
    (false, "no call to action found".to_string())
}

/// 整词匹配，`lower` 需已转为小写
fn mentions_word(lower: &str, word: &str) -> bool {
    let pattern = format!(r"\b{}\b", regex::escape(&word.to_lowercase()));
    Regex::new(&pattern)
        .map(|re| re.is_match(lower))
        .unwrap_or(false)
}

fn no_competitor_mention(content: &str, competitors: &[String]) -> (bool, String) {
    let lower = content.to_lowercase();
    let hits: Vec<&str> = competitors
        .iter()
        .map(String::as_str)
        .filter(|name| !name.trim().is_empty())
        .filter(|name| mentions_word(&lower, name))
        .collect();
    if hits.is_empty() {
        (true, "no competitor mentioned".to_string())
    } else {
        (false, format!("competitor mentioned: {}", hits.join(", ")))
    }
}

fn no_unverified_stats(content: &str) -> (bool, String) {
    let stats: Vec<&str> = STATISTIC.find_iter(content).map(|m| m.as_str()).collect();
    if stats.is_empty() {
        return (true, "no statistics".to_string());
    }
    let lower = content.to_lowercase();
    if SOURCE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        (true, "statistics are attributed to a source".to_string())
    } else {
        (false, format!("unverified statistics: {}", stats.join(", ")))
    }
}

fn references_prior_conversation(content: &str, ctx: &EvalContext) -> (bool, String) {
    if ctx.conversation_history.is_empty() {
        return (true, "no prior conversation; check skipped".to_string());
    }
    let lower = content.to_lowercase();
    if let Some(phrase) = PRIOR_CONVERSATION.iter().find(|p| lower.contains(*p)) {
        return (true, format!("references prior conversation via `{phrase}`"));
    }

    let distinctive = |text: &str| -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() >= 6)
            .map(str::to_lowercase)
            .collect()
    };
    let content_words = distinctive(content);
    let history_words: Vec<String> = ctx
        .conversation_history
        .iter()
        .flat_map(|m| distinctive(m))
        .collect();
    let mut shared: Vec<&String> = content_words
        .iter()
        .filter(|w| history_words.contains(w))
        .collect();
    shared.dedup();
    if shared.len() >= 2 {
        (true, "shares topics with prior conversation".to_string())
    } else {
        (false, "does not reference the prior conversation".to_string())
    }
}
