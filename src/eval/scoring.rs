use serde::{Deserialize, Serialize};

use super::assertions::word_count;
use super::rules::Criterion;
use super::EvalContext;

const COURTEOUS: &[&str] = &[
    "please",
    "thank you",
    "thanks",
    "appreciate",
    "kind regards",
    "best regards",
    "sincerely",
    "regards",
];

const SLANG: &[&str] = &[
    "gonna", "wanna", "gotta", "lol", "omg", "btw", "dude", "ya", "yeah", "nope", "u", "thx", "pls",
];

const EMPATHY: &[&str] = &[
    "understand",
    "sorry",
    "apologize",
    "appreciate",
    "hear that",
    "frustrat",
    "concern",
    "i know",
    "patience",
    "feel",
    "must be",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion: Criterion,
    pub score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct L2Result {
    pub score: f64,
    pub criteria: Vec<CriterionScore>,
}

/// 各项得分的算术平均；没有配置项时为 1
pub fn run_l2(criteria: &[Criterion], content: &str, ctx: &EvalContext) -> L2Result {
    let scores: Vec<CriterionScore> = criteria
        .iter()
        .map(|criterion| CriterionScore {
            criterion: *criterion,
            score: score(*criterion, content, ctx),
        })
        .collect();
    let overall = if scores.is_empty() {
        1.0
    } else {
        scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64
    };
    L2Result {
        score: overall,
        criteria: scores,
    }
}

pub fn score(criterion: Criterion, content: &str, ctx: &EvalContext) -> f64 {
    let raw = match criterion {
        Criterion::ProfessionalTone => professional_tone(content),
        Criterion::Empathy => empathy(content),
        Criterion::Conciseness => conciseness(content),
        Criterion::Clarity => clarity(content),
        Criterion::Personalization => personalization(content, ctx),
    };
    raw.clamp(0.0, 1.0)
}

fn words_lower(content: &str) -> Vec<String> {
    content
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn count_phrases(lower: &str, phrases: &[&str]) -> usize {
    phrases.iter().filter(|p| lower.contains(*p)).count()
}

/// 50–200 词满分，区间外按比例衰减
pub fn conciseness(content: &str) -> f64 {
    let words = word_count(content) as f64;
    if words == 0.0 {
        0.0
    } else if words < 50.0 {
        words / 50.0
    } else if words <= 200.0 {
        1.0
    } else {
        200.0 / words
    }
}

pub fn professional_tone(content: &str) -> f64 {
    if content.trim().is_empty() {
        return 0.0;
    }
    let lower = content.to_lowercase();
    let words = words_lower(content);

    let courtesy = (count_phrases(&lower, COURTEOUS) as f64 * 0.1).min(0.3);
    let exclamations = content.matches('!').count();
    let exclamation_penalty = exclamations.saturating_sub(1) as f64 * 0.15;
    let slang_hits = words.iter().filter(|w| SLANG.contains(&w.as_str())).count();
    let slang_penalty = slang_hits as f64 * 0.2;
    let shouting = content
        .split_whitespace()
        .filter(|w| w.len() > 3 && w.chars().all(|c| c.is_ascii_uppercase()))
        .count();
    let shouting_penalty = shouting as f64 * 0.1;

    0.7 + courtesy - exclamation_penalty - slang_penalty - shouting_penalty
}

pub fn empathy(content: &str) -> f64 {
    if content.trim().is_empty() {
        return 0.0;
    }
    let lower = content.to_lowercase();
    0.5 + count_phrases(&lower, EMPATHY) as f64 * 0.15
}

fn sentences(content: &str) -> Vec<&str> {
    content
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// 平均句长越短越清晰
pub fn clarity(content: &str) -> f64 {
    let sentences = sentences(content);
    if sentences.is_empty() {
        return 0.0;
    }
    let average = sentences.iter().map(|s| word_count(s)).sum::<usize>() as f64
        / sentences.len() as f64;
    if average <= 20.0 {
        1.0
    } else if average <= 40.0 {
        1.0 - (average - 20.0) / 20.0 * 0.6
    } else {
        0.3
    }
}

pub fn personalization(content: &str, ctx: &EvalContext) -> f64 {
    if content.trim().is_empty() {
        return 0.0;
    }
    let words = words_lower(content);
    let mut total = 0.4;
    if let Some(name) = ctx.recipient_name.as_deref() {
        let first = name.split_whitespace().next().unwrap_or(name).to_lowercase();
        if !first.is_empty() && words.contains(&first) {
            total += 0.4;
        }
    }
    if words.iter().any(|w| w == "you" || w == "your") {
        total += 0.2;
    }
    total
}
