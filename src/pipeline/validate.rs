//! Confidence Validator.
//!
//! Scores a stage payload and turns the score into an explicit [`Decision`].
//! The effective confidence is the minimum of the backend's self-reported
//! confidence and an independent structural score, so a confident answer
//! with missing or inconsistent fields is always downgraded.

use crate::output::{
    ClassificationPayload, DocumentType, EntitiesPayload, EntityKind, RiskPayload, StagePayload,
    SummaryPayload,
};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

/// Outcome of validating one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Store and move to the next stage.
    Accept,
    /// Try the next strategy on the ladder.
    Retry,
    /// Stop here and deliver the best attempt as degraded.
    Degrade,
}

/// Validator output for one attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub effective_confidence: f32,
    pub structural_score: f32,
    pub decision: Decision,
}

/// Summaries shorter than this lose part of their structural score.
const MIN_SUMMARY_CHARS: usize = 50;

/// Validate a stage payload.
///
/// `terminal` marks the last rung of the ladder (a heuristic result): it can
/// never be accepted, only degraded.
pub fn validate(
    payload: &StagePayload,
    self_reported: Option<f32>,
    threshold: f32,
    terminal: bool,
) -> Verdict {
    let structural_score = structural_score(payload);
    let effective_confidence = combine(self_reported, structural_score);

    let decision = if terminal {
        Decision::Degrade
    } else if effective_confidence >= threshold {
        Decision::Accept
    } else {
        Decision::Retry
    };

    Verdict {
        effective_confidence,
        structural_score,
        decision,
    }
}

/// `min(self_reported, structural)`, both clamped to `[0, 1]`.
pub fn combine(self_reported: Option<f32>, structural: f32) -> f32 {
    let structural = sanitize(structural);
    match self_reported {
        Some(hint) => sanitize(hint).min(structural),
        None => structural,
    }
}

fn sanitize(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Structural completeness and consistency score in `[0, 1]`.
pub fn structural_score(payload: &StagePayload) -> f32 {
    let score = match payload {
        StagePayload::Classification(p) => score_classification(p),
        StagePayload::Entities(p) => score_entities(p),
        StagePayload::Summary(p) => score_summary(p),
        StagePayload::Risk(p) => score_risk(p),
    };
    score.clamp(0.0, 1.0)
}

fn score_classification(p: &ClassificationPayload) -> f32 {
    let mut score = if p.document_type == DocumentType::Other {
        0.35
    } else {
        0.7
    };
    if !p.rationale.trim().is_empty() {
        score += 0.3;
    }
    score
}

fn score_entities(p: &EntitiesPayload) -> f32 {
    if p.entities.is_empty() {
        return 0.0;
    }
    let mut score = 0.4;
    if p.entities.iter().all(|e| !e.value.trim().is_empty()) {
        score += 0.2;
    }
    let amounts_ok = p
        .entities
        .iter()
        .filter(|e| e.kind == EntityKind::Amount)
        .all(|e| parse_amount(&e.value).is_some());
    if amounts_ok {
        score += 0.2;
    }
    let dates_ok = p
        .entities
        .iter()
        .filter(|e| e.kind == EntityKind::Date)
        .all(|e| parse_date(&e.value).is_some());
    if dates_ok {
        score += 0.2;
    }
    score
}

fn score_summary(p: &SummaryPayload) -> f32 {
    let text = p.summary.trim();
    if text.is_empty() {
        return 0.0;
    }
    let mut score = 0.5;
    if text.chars().count() >= MIN_SUMMARY_CHARS {
        score += 0.2;
    }
    if p.key_points.iter().any(|k| !k.trim().is_empty()) {
        score += 0.3;
    }
    score
}

fn score_risk(p: &RiskPayload) -> f32 {
    let mut score = 0.0;
    if p.risk_factors.iter().all(|r| !r.description.trim().is_empty()) {
        score += 0.6;
    }
    if p.risk_factors.is_empty() || !p.recommendations.is_empty() {
        score += 0.4;
    }
    score
}

// ── Consistency helpers ──────────────────────────────────────────────────

static RE_AMOUNT_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9.\-]").unwrap());

/// Parse a monetary amount such as `$1,250.00`, `EUR 300` or `1 200.5`.
pub fn parse_amount(value: &str) -> Option<f64> {
    if !value.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let cleaned = RE_AMOUNT_CHARS.replace_all(value, "");
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%d-%m-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %b %Y",
];

static RE_ORDINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2})(st|nd|rd|th)\b").unwrap());

/// Parse a calendar date in one of the common written forms.
///
/// Rejects impossible dates such as `2024-02-30`.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let cleaned = RE_ORDINAL.replace_all(value.trim().trim_end_matches('.'), "$1");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
}
