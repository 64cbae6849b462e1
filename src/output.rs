//! Output types produced by the analysis orchestrator.
//!
//! An [`AnalysisResult`] is built once per run and never mutated afterwards.
//! A fresh run produces a new value; callers holding an `Arc<AnalysisResult>`
//! keep seeing exactly what the orchestrator delivered.

use crate::document::{DocumentContent, SourceFormat};
use crate::error::StageError;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use uuid::Uuid;

// ── Stages ───────────────────────────────────────────────────────────────

/// One of the four analysis phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classification,
    Entities,
    Summary,
    Risk,
}

impl Stage {
    /// Fixed dependency order: later stages read earlier stages' output.
    pub const ALL: [Stage; 4] = [
        Stage::Classification,
        Stage::Entities,
        Stage::Summary,
        Stage::Risk,
    ];

    /// Weight of the stage in [`AnalysisResult::overall_confidence`].
    pub fn weight(self) -> f32 {
        match self {
            Stage::Classification => 0.30,
            Stage::Entities => 0.30,
            Stage::Summary => 0.25,
            Stage::Risk => 0.15,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Classification => "classification",
            Stage::Entities => "entities",
            Stage::Summary => "summary",
            Stage::Risk => "risk",
        };
        f.write_str(s)
    }
}

/// Final disposition of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Confidence reached the stage threshold.
    Accepted,
    /// Delivered, but below threshold or produced by a heuristic fallback.
    Degraded,
    /// No usable output: the backend stayed unreachable.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Accepted => "accepted",
            StageStatus::Degraded => "degraded",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Invoice,
    Contract,
    Resume,
    Report,
    Letter,
    #[default]
    #[serde(other)]
    Other,
}

impl DocumentType {
    pub const KNOWN: [DocumentType; 5] = [
        DocumentType::Invoice,
        DocumentType::Contract,
        DocumentType::Resume,
        DocumentType::Report,
        DocumentType::Letter,
    ];
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentType::Invoice => "invoice",
            DocumentType::Contract => "contract",
            DocumentType::Resume => "resume",
            DocumentType::Report => "report",
            DocumentType::Letter => "letter",
            DocumentType::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClassificationPayload {
    pub document_type: DocumentType,
    /// Short justification citing document features.
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Person,
    Organization,
    Date,
    Amount,
    Location,
    Email,
    Phone,
    Url,
    #[serde(other)]
    Other,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Person => "person",
            EntityKind::Organization => "organization",
            EntityKind::Date => "date",
            EntityKind::Amount => "amount",
            EntityKind::Location => "location",
            EntityKind::Email => "email",
            EntityKind::Phone => "phone",
            EntityKind::Url => "url",
            EntityKind::Other => "other",
        };
        f.write_str(s)
    }
}

impl EntityKind {
    /// Lenient label parsing used when re-reading free-text output.
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "person" | "name" | "people" => Some(EntityKind::Person),
            "organization" | "organisation" | "company" | "vendor" => Some(EntityKind::Organization),
            "date" => Some(EntityKind::Date),
            "amount" | "money" | "total" => Some(EntityKind::Amount),
            "location" | "address" => Some(EntityKind::Location),
            "email" | "e-mail" => Some(EntityKind::Email),
            "phone" | "telephone" => Some(EntityKind::Phone),
            "url" | "website" | "link" => Some(EntityKind::Url),
            "other" => Some(EntityKind::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    pub kind: EntityKind,
    pub value: String,
    /// Where in the document the value was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct EntitiesPayload {
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    // Unrecognised labels land here; `other` must be the last variant.
    #[default]
    #[serde(other)]
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    Complete,
    Partial,
    Incomplete,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SummaryPayload {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub sentiment: Sentiment,
    #[serde(default)]
    pub completeness: Completeness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
    #[default]
    #[serde(other)]
    Medium,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RiskFactor {
    pub description: String,
    #[serde(default)]
    pub severity: Level,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RiskPayload {
    #[serde(default)]
    pub risk_factors: Vec<RiskFactor>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub urgency: Level,
}

/// Stage-specific structured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StagePayload {
    Classification(ClassificationPayload),
    Entities(EntitiesPayload),
    Summary(SummaryPayload),
    Risk(RiskPayload),
}

impl StagePayload {
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Classification(_) => Stage::Classification,
            StagePayload::Entities(_) => Stage::Entities,
            StagePayload::Summary(_) => Stage::Summary,
            StagePayload::Risk(_) => Stage::Risk,
        }
    }
}

// ── Results ──────────────────────────────────────────────────────────────

/// The outcome of one stage after validation and any fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStageResult {
    pub stage: Stage,
    /// `None` only when `status == Failed`.
    pub payload: Option<StagePayload>,
    /// Effective confidence in `[0, 1]` after validation.
    pub confidence: f32,
    pub status: StageStatus,
    /// Strategy attempts made; never exceeds `max_retries + 1`.
    pub attempt_count: u32,
    /// Name of the strategy that produced `payload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub duration_ms: u64,
}

/// Non-owning link from a result back to the content it was computed from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentRef {
    pub fingerprint: String,
    pub page_count: usize,
    pub source_format: Option<SourceFormat>,
    #[serde(skip)]
    handle: Weak<DocumentContent>,
}

impl DocumentRef {
    pub fn new(content: &Arc<DocumentContent>) -> Self {
        Self {
            fingerprint: content.fingerprint(),
            page_count: content.page_count,
            source_format: Some(content.source_format),
            handle: Arc::downgrade(content),
        }
    }

    /// The originating content, if the caller still holds it.
    pub fn upgrade(&self) -> Option<Arc<DocumentContent>> {
        self.handle.upgrade()
    }

    /// True when `content` is the document this result was computed from.
    pub fn refers_to(&self, content: &DocumentContent) -> bool {
        self.fingerprint == content.fingerprint()
    }
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub total_duration_ms: u64,
    pub backend_calls: u32,
    pub accepted: usize,
    pub degraded: usize,
    pub failed: usize,
}

/// One result per stage plus aggregate confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub run_id: Uuid,
    pub document_ref: DocumentRef,
    /// Exactly one entry per [`Stage`], in [`Stage::ALL`] order.
    pub stages: Vec<AnalysisStageResult>,
    pub overall_confidence: f32,
    pub created_at: DateTime<Utc>,
    pub stats: AnalysisStats,
}

impl AnalysisResult {
    pub fn stage(&self, stage: Stage) -> Option<&AnalysisStageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn classification(&self) -> Option<&ClassificationPayload> {
        match self.stage(Stage::Classification)?.payload.as_ref()? {
            StagePayload::Classification(p) => Some(p),
            _ => None,
        }
    }

    /// Best-known document type; `Other` when classification failed.
    pub fn document_type(&self) -> DocumentType {
        self.classification()
            .map(|c| c.document_type)
            .unwrap_or_default()
    }

    pub fn entities(&self) -> &[Entity] {
        match self
            .stage(Stage::Entities)
            .and_then(|s| s.payload.as_ref())
        {
            Some(StagePayload::Entities(p)) => &p.entities,
            _ => &[],
        }
    }

    pub fn summary(&self) -> Option<&SummaryPayload> {
        match self.stage(Stage::Summary)?.payload.as_ref()? {
            StagePayload::Summary(p) => Some(p),
            _ => None,
        }
    }

    pub fn risk(&self) -> Option<&RiskPayload> {
        match self.stage(Stage::Risk)?.payload.as_ref()? {
            StagePayload::Risk(p) => Some(p),
            _ => None,
        }
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failed)
            .map(|s| s.stage)
            .collect()
    }

    pub fn is_fully_accepted(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.status == StageStatus::Accepted)
    }
}

/// Weighted mean of stage confidences; failed stages contribute zero.
pub fn overall_confidence(stages: &[AnalysisStageResult]) -> f32 {
    let total_weight: f32 = stages.iter().map(|s| s.stage.weight()).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f32 = stages
        .iter()
        .map(|s| match s.status {
            StageStatus::Failed => 0.0,
            _ => s.confidence * s.stage.weight(),
        })
        .sum();
    (weighted / total_weight).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_result(stage: Stage, confidence: f32, status: StageStatus) -> AnalysisStageResult {
        AnalysisStageResult {
            stage,
            payload: None,
            confidence,
            status,
            attempt_count: 1,
            strategy: None,
            error: None,
            duration_ms: 0,
        }
    }

    #[test]
    fn unknown_labels_fall_back_to_default() {
        let sentiment: Sentiment = serde_json::from_str("\"mixed\"").unwrap();
        assert_eq!(sentiment, Sentiment::Neutral);
        let level: Level = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(level, Level::Medium);
        let completeness: Completeness = serde_json::from_str("\"mostly\"").unwrap();
        assert_eq!(completeness, Completeness::Unknown);

        let risk: RiskPayload = serde_json::from_value(serde_json::json!({
            "risk_factors": [{"description": "late fee", "severity": "critical"}],
            "urgency": "high"
        }))
        .unwrap();
        assert_eq!(risk.risk_factors[0].severity, Level::Medium);
        assert_eq!(risk.urgency, Level::High);

        let summary: SummaryPayload =
            serde_json::from_value(serde_json::json!({"summary": "s", "sentiment": "negative"}))
                .unwrap();
        assert_eq!(summary.sentiment, Sentiment::Negative);
    }

    #[test]
    fn weights_sum_to_one() {
        let sum: f32 = Stage::ALL.iter().map(|s| s.weight()).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn failed_stage_contributes_zero() {
        let stages = vec![
            stage_result(Stage::Classification, 1.0, StageStatus::Accepted),
            stage_result(Stage::Entities, 1.0, StageStatus::Failed),
            stage_result(Stage::Summary, 1.0, StageStatus::Accepted),
            stage_result(Stage::Risk, 1.0, StageStatus::Degraded),
        ];
        let overall = overall_confidence(&stages);
        assert!((overall - 0.70).abs() < 1e-5, "got {overall}");
    }

    #[test]
    fn unknown_labels_fall_back_to_other() {
        let p: ClassificationPayload =
            serde_json::from_str(r#"{"document_type":"memo"}"#).unwrap();
        assert_eq!(p.document_type, DocumentType::Other);
        assert!(p.rationale.is_empty());

        let e: Entity = serde_json::from_str(r#"{"kind":"iban","value":"DE89"}"#).unwrap();
        assert_eq!(e.kind, EntityKind::Other);
    }

    #[test]
    fn document_ref_does_not_own_content() {
        let content = Arc::new(DocumentContent {
            raw_text: "hello".into(),
            layout_blocks: vec![],
            page_count: 1,
            source_format: SourceFormat::Image,
        });
        let r = DocumentRef::new(&content);
        assert!(r.upgrade().is_some());
        assert!(r.refers_to(&content));
        drop(content);
        assert!(r.upgrade().is_none());
    }

    #[test]
    fn entity_label_parsing() {
        assert_eq!(EntityKind::parse_label(" Company "), Some(EntityKind::Organization));
        assert_eq!(EntityKind::parse_label("TOTAL"), Some(EntityKind::Amount));
        assert_eq!(EntityKind::parse_label("banana"), None);
    }
}
