//! Stage strategies and the per-stage fallback ladder.
//!
//! Every stage owns an ordered list of three [`Strategy`] variants: a
//! primary backend strategy, a cheaper backend fallback, and a terminal
//! heuristic that needs no backend. [`run_stage`] walks the list with an
//! index, asking the Confidence Validator after each attempt whether to
//! accept, move one rung down, or stop and degrade.
//!
//! Ladder rules:
//! - a rejected attempt moves one rung down;
//! - an unparseable backend answer moves one rung down at once, without
//!   spending a transient-error retry;
//! - the last permitted attempt jumps to the terminal heuristic when no
//!   parseable candidate exists yet;
//! - exhausting the transient retries of a backend call ends the stage:
//!   `Degraded` with the best earlier candidate, or `Failed` without one.

use crate::backend::{call_with_retry, AiBackend, BackendResponse, CompletionRequest, RetryPolicy};
use crate::config::AnalysisConfig;
use crate::document::DocumentContent;
use crate::error::{BackendError, StageError};
use crate::output::{
    AnalysisStageResult, ClassificationPayload, DocumentType, EntitiesPayload, Entity, EntityKind,
    RiskPayload, Stage, StagePayload, StageStatus, SummaryPayload,
};
use crate::pipeline::heuristics;
use crate::pipeline::validate::{validate, Decision};
use crate::progress::ProgressCallback;
use crate::prompts::{self, ANALYST_SYSTEM_PROMPT};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on backend calls spent by the chunked summary strategy.
const MAX_SUMMARY_CHUNKS: usize = 8;

// ── Strategies ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FullDocument,
    LeadingBlocks,
    KeywordClassifier,
    StructuredEntities,
    FreeTextEntities,
    RegexEntities,
    FullSummary,
    ChunkedSummary,
    ExtractiveSummary,
    EntitiesAndSummary,
    SummaryOnly,
    EmptyRisk,
}

impl Strategy {
    /// The fallback ladder of a stage, most capable first.
    pub fn ladder(stage: Stage) -> [Strategy; 3] {
        match stage {
            Stage::Classification => [
                Strategy::FullDocument,
                Strategy::LeadingBlocks,
                Strategy::KeywordClassifier,
            ],
            Stage::Entities => [
                Strategy::StructuredEntities,
                Strategy::FreeTextEntities,
                Strategy::RegexEntities,
            ],
            Stage::Summary => [
                Strategy::FullSummary,
                Strategy::ChunkedSummary,
                Strategy::ExtractiveSummary,
            ],
            Stage::Risk => [
                Strategy::EntitiesAndSummary,
                Strategy::SummaryOnly,
                Strategy::EmptyRisk,
            ],
        }
    }

    /// Heuristic strategies: no backend call, never accepted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Strategy::KeywordClassifier
                | Strategy::RegexEntities
                | Strategy::ExtractiveSummary
                | Strategy::EmptyRisk
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::FullDocument => "full_document",
            Strategy::LeadingBlocks => "leading_blocks",
            Strategy::KeywordClassifier => "keyword_classifier",
            Strategy::StructuredEntities => "structured_schema",
            Strategy::FreeTextEntities => "free_text_reparse",
            Strategy::RegexEntities => "regex_patterns",
            Strategy::FullSummary => "full_context",
            Strategy::ChunkedSummary => "chunked_merge",
            Strategy::ExtractiveSummary => "extractive",
            Strategy::EntitiesAndSummary => "entities_and_summary",
            Strategy::SummaryOnly => "summary_only",
            Strategy::EmptyRisk => "empty_risk",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Context ──────────────────────────────────────────────────────────────

/// Everything a strategy may read: the document plus the best available
/// output of earlier stages.
pub struct StageContext<'a> {
    pub content: &'a DocumentContent,
    pub config: &'a AnalysisConfig,
    pub backend: &'a dyn AiBackend,
    pub policy: RetryPolicy,
    pub doc_type: DocumentType,
    pub entities: Option<&'a EntitiesPayload>,
    pub summary: Option<&'a SummaryPayload>,
}

/// A decoded attempt, not yet validated.
struct Candidate {
    payload: StagePayload,
    self_reported: Option<f32>,
}

enum AttemptError {
    Parse(String),
    Exhausted { calls: u32, detail: String },
}

struct StrategyOutcome {
    result: Result<Candidate, AttemptError>,
    calls: u32,
}

/// Final stage result plus the backend calls it cost.
pub struct StageRun {
    pub result: AnalysisStageResult,
    pub backend_calls: u32,
}

// ── Ladder ───────────────────────────────────────────────────────────────

struct Scored {
    payload: StagePayload,
    confidence: f32,
    strategy: Strategy,
}

/// Run one stage to its final status. Never returns an error: quality and
/// backend problems are folded into the stage result.
pub async fn run_stage(stage: Stage, ctx: &StageContext<'_>, progress: Option<&ProgressCallback>) -> StageRun {
    let start = Instant::now();
    let ladder = Strategy::ladder(stage);
    let threshold = ctx.config.thresholds.for_stage(stage);
    let max_attempts = ctx.config.max_attempts();

    let mut best: Option<Scored> = None;
    let mut last_error: Option<StageError> = None;
    let mut attempts = 0u32;
    let mut calls = 0u32;
    let mut rung = 0usize;
    let mut exhausted = false;

    if let Some(cb) = progress {
        cb.on_stage_start(stage);
    }

    while attempts < max_attempts {
        let is_last = attempts + 1 == max_attempts;
        if is_last && attempts > 0 && best.is_none() {
            rung = ladder.len() - 1;
        }
        let strategy = ladder[rung];
        attempts += 1;

        let outcome = run_strategy(strategy, ctx).await;
        calls += outcome.calls;

        let rejection = match outcome.result {
            Err(AttemptError::Exhausted { calls: spent, detail }) => {
                warn!("{}: backend exhausted during {} ({})", stage, strategy, detail);
                last_error = Some(StageError::BackendExhausted {
                    attempts: spent,
                    detail,
                });
                exhausted = true;
                break;
            }
            Err(AttemptError::Parse(detail)) => {
                warn!("{}: {} produced unparseable output: {}", stage, strategy, detail);
                let reason = format!("unparseable output from {strategy}");
                last_error = Some(StageError::Parse { detail });
                reason
            }
            Ok(candidate) => {
                let verdict = validate(
                    &candidate.payload,
                    candidate.self_reported,
                    threshold,
                    strategy.is_terminal(),
                );
                info!(
                    "{}: attempt {}/{} via {} → confidence {:.2} (structural {:.2}, {:?})",
                    stage,
                    attempts,
                    max_attempts,
                    strategy,
                    verdict.effective_confidence,
                    verdict.structural_score,
                    verdict.decision
                );

                if verdict.decision == Decision::Accept {
                    return finish(
                        stage,
                        StageStatus::Accepted,
                        Some(Scored {
                            payload: candidate.payload,
                            confidence: verdict.effective_confidence,
                            strategy,
                        }),
                        None,
                        attempts,
                        calls,
                        start,
                        progress,
                    );
                }

                let improves = best
                    .as_ref()
                    .is_none_or(|b| verdict.effective_confidence > b.confidence);
                if improves {
                    best = Some(Scored {
                        payload: candidate.payload,
                        confidence: verdict.effective_confidence,
                        strategy,
                    });
                }
                if verdict.decision == Decision::Degrade {
                    break;
                }
                last_error = Some(StageError::LowConfidence {
                    confidence: verdict.effective_confidence,
                    threshold,
                });
                format!(
                    "confidence {:.2} below {:.2} via {}",
                    verdict.effective_confidence, threshold, strategy
                )
            }
        };

        if strategy.is_terminal() || rung + 1 >= ladder.len() {
            break;
        }
        if attempts < max_attempts {
            if let Some(cb) = progress {
                cb.on_stage_retry(stage, attempts, &rejection);
            }
        }
        rung += 1;
    }

    // An unreachable backend fails the stage even after a weak candidate.
    if exhausted {
        if let Some(b) = &best {
            debug!("{}: discarding {} candidate at {:.2}", stage, b.strategy, b.confidence);
        }
        return finish(stage, StageStatus::Failed, None, last_error, attempts, calls, start, progress);
    }
    let status = if best.is_some() {
        StageStatus::Degraded
    } else {
        StageStatus::Failed
    };
    finish(stage, status, best, last_error, attempts, calls, start, progress)
}

#[allow(clippy::too_many_arguments)]
fn finish(
    stage: Stage,
    status: StageStatus,
    scored: Option<Scored>,
    error: Option<StageError>,
    attempt_count: u32,
    backend_calls: u32,
    start: Instant,
    progress: Option<&ProgressCallback>,
) -> StageRun {
    let (payload, confidence, strategy) = match scored {
        Some(s) => (Some(s.payload), s.confidence, Some(s.strategy.name().to_string())),
        None => (None, 0.0, None),
    };

    match status {
        StageStatus::Accepted => info!("{}: accepted at {:.2}", stage, confidence),
        StageStatus::Degraded => warn!("{}: degraded at {:.2} after {} attempt(s)", stage, confidence, attempt_count),
        StageStatus::Failed => warn!("{}: failed after {} attempt(s)", stage, attempt_count),
    }
    if let Some(cb) = progress {
        cb.on_stage_complete(stage, status, confidence);
    }

    StageRun {
        result: AnalysisStageResult {
            stage,
            payload,
            confidence,
            status,
            attempt_count,
            strategy,
            error,
            duration_ms: start.elapsed().as_millis() as u64,
        },
        backend_calls,
    }
}

// ── Strategy execution ───────────────────────────────────────────────────

async fn run_strategy(strategy: Strategy, ctx: &StageContext<'_>) -> StrategyOutcome {
    let floor = Some(ctx.config.heuristic_confidence_floor);
    let heuristic = |payload: StagePayload| StrategyOutcome {
        result: Ok(Candidate {
            payload,
            self_reported: floor,
        }),
        calls: 0,
    };

    let mut calls = 0;
    let result = match strategy {
        Strategy::KeywordClassifier => {
            return heuristic(StagePayload::Classification(heuristics::classify_by_keywords(
                &ctx.content.raw_text,
            )))
        }
        Strategy::RegexEntities => {
            return heuristic(StagePayload::Entities(heuristics::extract_regex_entities(
                &ctx.content.raw_text,
            )))
        }
        Strategy::ExtractiveSummary => {
            return heuristic(StagePayload::Summary(heuristics::extractive_summary(
                ctx.content,
                ctx.config.extractive_sentences,
            )))
        }
        Strategy::EmptyRisk => return heuristic(StagePayload::Risk(heuristics::empty_risk())),

        Strategy::FullDocument => {
            let (document, _) = truncate_chars(&ctx.content.raw_text, ctx.config.max_context_chars);
            classify(ctx, strategy, prompts::classification_prompt(document, false), &mut calls).await
        }
        Strategy::LeadingBlocks => {
            let leading = ctx.content.leading_blocks_text(ctx.config.truncated_block_count);
            let (document, _) = truncate_chars(&leading, ctx.config.max_context_chars);
            classify(ctx, strategy, prompts::classification_prompt(document, true), &mut calls).await
        }
        Strategy::StructuredEntities => structured_entities(ctx, &mut calls).await,
        Strategy::FreeTextEntities => free_text_entities(ctx, &mut calls).await,
        Strategy::FullSummary => full_summary(ctx, &mut calls).await,
        Strategy::ChunkedSummary => chunked_summary(ctx, &mut calls).await,
        Strategy::EntitiesAndSummary => assess_risk(ctx, ctx.entities, strategy, &mut calls).await,
        Strategy::SummaryOnly => assess_risk(ctx, None, strategy, &mut calls).await,
    };

    StrategyOutcome { result, calls }
}

fn request(stage: Stage, strategy: Strategy, prompt: String) -> CompletionRequest {
    CompletionRequest::new(format!("{stage}/{strategy}"), ANALYST_SYSTEM_PROMPT, prompt)
}

async fn call(ctx: &StageContext<'_>, request: &CompletionRequest, calls: &mut u32) -> Result<BackendResponse, AttemptError> {
    let outcome = call_with_retry(ctx.backend, request, &ctx.policy).await;
    *calls += outcome.calls;
    match outcome.result {
        Ok(response) => Ok(response),
        Err(BackendError::Parse(detail)) => Err(AttemptError::Parse(detail)),
        Err(e) => Err(AttemptError::Exhausted {
            calls: outcome.calls,
            detail: e.to_string(),
        }),
    }
}

fn decode<T: DeserializeOwned>(mut payload: Value, normalise: impl FnOnce(&mut Value)) -> Result<T, AttemptError> {
    normalise(&mut payload);
    serde_json::from_value(payload).map_err(|e| AttemptError::Parse(e.to_string()))
}

async fn classify(
    ctx: &StageContext<'_>,
    strategy: Strategy,
    prompt: String,
    calls: &mut u32,
) -> Result<Candidate, AttemptError> {
    let req = request(Stage::Classification, strategy, prompt)
        .with_schema(prompts::response_schema::<ClassificationPayload>());
    let response = call(ctx, &req, calls).await?;
    let payload: ClassificationPayload = decode(response.payload, |v| {
        lowercase_field(v.get_mut("document_type"));
    })?;
    Ok(Candidate {
        payload: StagePayload::Classification(payload),
        self_reported: response.self_reported_confidence,
    })
}

async fn structured_entities(ctx: &StageContext<'_>, calls: &mut u32) -> Result<Candidate, AttemptError> {
    let (document, _) = truncate_chars(&ctx.content.raw_text, ctx.config.max_context_chars);
    let req = request(
        Stage::Entities,
        Strategy::StructuredEntities,
        prompts::entities_structured_prompt(document, ctx.doc_type),
    )
    .with_schema(prompts::response_schema::<EntitiesPayload>());
    let response = call(ctx, &req, calls).await?;
    let mut payload: EntitiesPayload = decode(response.payload, normalise_entity_kinds)?;
    for e in &mut payload.entities {
        e.confidence = e.confidence.map(|c| c.clamp(0.0, 1.0));
    }
    Ok(Candidate {
        payload: StagePayload::Entities(payload),
        self_reported: response.self_reported_confidence,
    })
}

async fn free_text_entities(ctx: &StageContext<'_>, calls: &mut u32) -> Result<Candidate, AttemptError> {
    let (document, _) = truncate_chars(&ctx.content.raw_text, ctx.config.max_context_chars);
    let req = request(
        Stage::Entities,
        Strategy::FreeTextEntities,
        prompts::entities_free_text_prompt(document, ctx.doc_type),
    );
    let response = call(ctx, &req, calls).await?;
    let (entities, self_reported) = parse_entity_lines(&response.text());
    if entities.is_empty() {
        return Err(AttemptError::Parse("no `kind: value` lines in free-text answer".into()));
    }
    Ok(Candidate {
        payload: StagePayload::Entities(EntitiesPayload { entities }),
        self_reported: self_reported.or(response.self_reported_confidence),
    })
}

async fn full_summary(ctx: &StageContext<'_>, calls: &mut u32) -> Result<Candidate, AttemptError> {
    let (document, _) = truncate_chars(&ctx.content.raw_text, ctx.config.max_context_chars);
    let req = request(
        Stage::Summary,
        Strategy::FullSummary,
        prompts::summary_prompt(document, ctx.doc_type),
    )
    .with_schema(prompts::response_schema::<SummaryPayload>());
    let response = call(ctx, &req, calls).await?;
    let payload: SummaryPayload = decode(response.payload, normalise_summary)?;
    Ok(Candidate {
        payload: StagePayload::Summary(payload),
        self_reported: response.self_reported_confidence,
    })
}

async fn chunked_summary(ctx: &StageContext<'_>, calls: &mut u32) -> Result<Candidate, AttemptError> {
    let text = &ctx.content.raw_text;
    let total_chars = text.chars().count();
    let chunk_chars = ctx
        .config
        .summary_chunk_chars
        .max(total_chars.div_ceil(MAX_SUMMARY_CHUNKS));
    let chunks = chunk_text(text, chunk_chars);
    debug!("summary: {} chunk(s) of ≤ {} chars", chunks.len(), chunk_chars);

    let schema = prompts::response_schema::<SummaryPayload>();
    let mut partials = Vec::with_capacity(chunks.len());
    let mut last_confidence = None;
    for (i, chunk) in chunks.iter().enumerate() {
        let req = request(
            Stage::Summary,
            Strategy::ChunkedSummary,
            prompts::summary_chunk_prompt(chunk, i + 1, chunks.len()),
        )
        .with_schema(schema.clone());
        let response = call(ctx, &req, calls).await?;
        last_confidence = response.self_reported_confidence;
        partials.push(decode::<SummaryPayload>(response.payload, normalise_summary)?);
    }

    if partials.len() == 1 {
        let payload = partials.remove(0);
        return Ok(Candidate {
            payload: StagePayload::Summary(payload),
            self_reported: last_confidence,
        });
    }

    let req = request(
        Stage::Summary,
        Strategy::ChunkedSummary,
        prompts::summary_merge_prompt(&partials, ctx.doc_type),
    )
    .with_schema(schema);
    let response = call(ctx, &req, calls).await?;
    let payload: SummaryPayload = decode(response.payload, normalise_summary)?;
    Ok(Candidate {
        payload: StagePayload::Summary(payload),
        self_reported: response.self_reported_confidence,
    })
}

async fn assess_risk(
    ctx: &StageContext<'_>,
    entities: Option<&EntitiesPayload>,
    strategy: Strategy,
    calls: &mut u32,
) -> Result<Candidate, AttemptError> {
    let (summary, key_points): (String, &[String]) = match ctx.summary {
        Some(s) => (s.summary.clone(), s.key_points.as_slice()),
        None => {
            let (leading, _) = truncate_chars(&ctx.content.raw_text, ctx.config.summary_chunk_chars);
            (leading.to_string(), &[][..])
        }
    };
    let req = request(
        Stage::Risk,
        strategy,
        prompts::risk_prompt(ctx.doc_type, &summary, key_points, entities),
    )
    .with_schema(prompts::response_schema::<RiskPayload>());
    let response = call(ctx, &req, calls).await?;
    let payload: RiskPayload = decode(response.payload, |v| {
        lowercase_field(v.get_mut("urgency"));
        if let Some(Value::Array(items)) = v.get_mut("risk_factors") {
            for item in items {
                lowercase_field(item.get_mut("severity"));
            }
        }
    })?;
    Ok(Candidate {
        payload: StagePayload::Risk(payload),
        self_reported: response.self_reported_confidence,
    })
}

// ── Payload normalisation ────────────────────────────────────────────────

fn lowercase_field(field: Option<&mut Value>) {
    if let Some(Value::String(s)) = field {
        *s = s.trim().to_lowercase();
    }
}

fn normalise_summary(v: &mut Value) {
    lowercase_field(v.get_mut("sentiment"));
    lowercase_field(v.get_mut("completeness"));
}

/// Map free-form kind labels ("Company", "Total") onto known kinds.
fn normalise_entity_kinds(v: &mut Value) {
    if let Some(Value::Array(items)) = v.get_mut("entities") {
        for item in items {
            if let Some(Value::String(kind)) = item.get_mut("kind") {
                let mapped = EntityKind::parse_label(kind).unwrap_or(EntityKind::Other);
                *kind = mapped.to_string();
            }
        }
    }
}

static RE_LIST_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s*").unwrap());

/// Re-parse `kind: value` lines from a free-text answer. A trailing
/// `confidence: x` line is returned separately.
pub fn parse_entity_lines(text: &str) -> (Vec<Entity>, Option<f32>) {
    let mut entities = Vec::new();
    let mut confidence = None;

    for line in text.lines() {
        let line = RE_LIST_PREFIX.replace(line, "");
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim().trim_matches(['*', '`']).trim();
        let value = value.trim().trim_matches(['*', '`']).trim();
        if value.is_empty() {
            continue;
        }
        if label.eq_ignore_ascii_case("confidence") {
            confidence = value.parse::<f32>().ok().map(|c| c.clamp(0.0, 1.0));
            continue;
        }
        if let Some(kind) = EntityKind::parse_label(label) {
            entities.push(Entity {
                kind,
                value: value.to_string(),
                context: None,
                confidence: None,
            });
        }
    }
    (entities, confidence)
}

// ── Text helpers ─────────────────────────────────────────────────────────

/// The first `max_chars` characters of `text`, and whether it was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (&text[..byte_idx], true),
        None => (text, false),
    }
}

/// Split on paragraph boundaries into pieces of at most `max_chars`
/// characters; oversized paragraphs are cut hard.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for para in text.split("\n\n").filter(|p| !p.trim().is_empty()) {
        let mut rest = para;
        loop {
            let rest_chars = rest.chars().count();
            let sep = if current.is_empty() { 0 } else { 2 };
            if current_chars + sep + rest_chars <= max_chars {
                if sep > 0 {
                    current.push_str("\n\n");
                }
                current.push_str(rest);
                current_chars += sep + rest_chars;
                break;
            }
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_chars = 0;
                continue;
            }
            let (head, _) = truncate_chars(rest, max_chars);
            chunks.push(head.to_string());
            rest = &rest[head.len()..];
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_ladder_ends_with_a_terminal_heuristic() {
        for stage in Stage::ALL {
            let ladder = Strategy::ladder(stage);
            assert!(!ladder[0].is_terminal());
            assert!(!ladder[1].is_terminal());
            assert!(ladder[2].is_terminal());
        }
    }

    #[test]
    fn entity_lines_are_reparsed() {
        let text = "Here you go:\n- Amount: $1,250.00\n* **Date**: 2024-03-15\n1. company: ACME Corp\n\
                    nonsense line\nconfidence: 0.7";
        let (entities, confidence) = parse_entity_lines(text);
        assert_eq!(entities.len(), 3);
        assert_eq!(entities[0].kind, EntityKind::Amount);
        assert_eq!(entities[1].value, "2024-03-15");
        assert_eq!(entities[2].kind, EntityKind::Organization);
        assert_eq!(confidence, Some(0.7));
    }

    #[test]
    fn urls_keep_their_scheme() {
        let (entities, _) = parse_entity_lines("url: https://acme.example/pay");
        assert_eq!(entities[0].value, "https://acme.example/pay");
    }

    #[test]
    fn entity_kinds_are_normalised() {
        let mut v = serde_json::json!({"entities": [{"kind": "Company", "value": "ACME"}, {"kind": "sku", "value": "X1"}]});
        normalise_entity_kinds(&mut v);
        assert_eq!(v["entities"][0]["kind"], "organization");
        assert_eq!(v["entities"][1]["kind"], "other");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), ("hé", true));
        assert_eq!(truncate_chars("hi", 5), ("hi", false));
    }

    #[test]
    fn chunking_prefers_paragraphs() {
        let chunks = chunk_text("aaaa\n\nbbbb\n\ncccccccccc", 9);
        assert_eq!(chunks, vec!["aaaa", "bbbb", "ccccccccc", "c"]);
        let chunks = chunk_text("aa\n\nbb", 10);
        assert_eq!(chunks, vec!["aa\n\nbb"]);
    }
}
