//! Analysis Orchestrator and end-to-end entry points.
//!
//! [`analyze`] runs the four stages over an already-normalised document.
//! [`process_document`] and [`process_bytes`] go the whole way from a path,
//! URL or buffer to an immutable [`ProcessedDocument`], ready for export or
//! a Q&A session.

use crate::backend::{resolve_backend, AiBackend, RetryPolicy};
use crate::config::AnalysisConfig;
use crate::document::DocumentContent;
use crate::error::DocIntelError;
use crate::output::{
    overall_confidence, AnalysisResult, AnalysisStageResult, AnalysisStats, DocumentRef,
    DocumentType, Stage, StagePayload, StageStatus,
};
use crate::pipeline::extract::{DocumentExtractor, Extractor};
use crate::pipeline::input::{self, InputDocument};
use crate::pipeline::preprocess::normalize;
use crate::pipeline::stages::{run_stage, StageContext};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// A document and its analysis, both immutable.
///
/// A fresh run produces a fresh pair; nothing patches an existing one.
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    /// Path, URL or caller-supplied name of the source.
    pub name: String,
    pub content: Arc<DocumentContent>,
    pub result: Arc<AnalysisResult>,
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Run classification, entities, summary and risk over `content`.
///
/// Returns `Ok` whenever the run completes, even if every stage degraded or
/// failed. `Err` is reserved for invalid configuration and a backend that
/// cannot be constructed at all.
pub async fn analyze(
    content: &Arc<DocumentContent>,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, DocIntelError> {
    analyze_with_cancel(content, config, &CancellationToken::new()).await
}

/// [`analyze`] with a cooperative cancellation checkpoint before each stage.
///
/// A stage in flight when `cancel` fires runs to completion (or timeout)
/// and its result is discarded; the call then returns
/// [`DocIntelError::Cancelled`].
pub async fn analyze_with_cancel(
    content: &Arc<DocumentContent>,
    config: &AnalysisConfig,
    cancel: &CancellationToken,
) -> Result<AnalysisResult, DocIntelError> {
    config.validate()?;
    let backend = resolve_backend(config)?;
    run_analysis(content, config, backend.as_ref(), cancel).await
}

async fn run_analysis(
    content: &Arc<DocumentContent>,
    config: &AnalysisConfig,
    backend: &dyn AiBackend,
    cancel: &CancellationToken,
) -> Result<AnalysisResult, DocIntelError> {
    let start = Instant::now();
    let run_id = Uuid::new_v4();
    let policy = RetryPolicy::from_config(config);
    let progress = config.progress_callback.as_ref();

    info!(
        "Analysis {} started: {} page(s), {} chars, backend {}",
        run_id,
        content.page_count,
        content.raw_text.len(),
        backend.name()
    );
    if let Some(cb) = progress {
        cb.on_analysis_start(Stage::ALL.len());
    }

    let mut stages: Vec<AnalysisStageResult> = Vec::with_capacity(Stage::ALL.len());
    let mut backend_calls = 0;

    for (completed, stage) in Stage::ALL.into_iter().enumerate() {
        if cancel.is_cancelled() {
            info!("Analysis {} cancelled before {}", run_id, stage);
            return Err(DocIntelError::Cancelled { completed });
        }

        let run = {
            let ctx = StageContext {
                content,
                config,
                backend,
                policy,
                doc_type: document_type(&stages),
                entities: stages.iter().find_map(|s| match &s.payload {
                    Some(StagePayload::Entities(p)) => Some(p),
                    _ => None,
                }),
                summary: stages.iter().find_map(|s| match &s.payload {
                    Some(StagePayload::Summary(p)) => Some(p),
                    _ => None,
                }),
            };
            run_stage(stage, &ctx, progress).await
        };

        if cancel.is_cancelled() {
            info!("Analysis {} cancelled during {}; result discarded", run_id, stage);
            return Err(DocIntelError::Cancelled { completed });
        }

        backend_calls += run.backend_calls;
        stages.push(run.result);
    }

    let count = |status: StageStatus| stages.iter().filter(|s| s.status == status).count();
    let stats = AnalysisStats {
        total_duration_ms: start.elapsed().as_millis() as u64,
        backend_calls,
        accepted: count(StageStatus::Accepted),
        degraded: count(StageStatus::Degraded),
        failed: count(StageStatus::Failed),
    };
    let overall = overall_confidence(&stages);

    info!(
        "Analysis {} finished in {}ms: overall confidence {:.2} ({} accepted, {} degraded, {} failed)",
        run_id, stats.total_duration_ms, overall, stats.accepted, stats.degraded, stats.failed
    );
    if let Some(cb) = progress {
        cb.on_analysis_complete(overall, stats.accepted);
    }

    Ok(AnalysisResult {
        run_id,
        document_ref: DocumentRef::new(content),
        stages,
        overall_confidence: overall,
        created_at: Utc::now(),
        stats,
    })
}

/// Best available document type; a failed classification means `Other`.
fn document_type(stages: &[AnalysisStageResult]) -> DocumentType {
    stages
        .iter()
        .find_map(|s| match &s.payload {
            Some(StagePayload::Classification(c)) => Some(c.document_type),
            _ => None,
        })
        .unwrap_or_default()
}

// ── End-to-end entry points ──────────────────────────────────────────────

/// Resolve, extract, normalise and analyse a local file or HTTP(S) URL.
///
/// # Errors
/// Input errors (missing, oversized, unsupported or corrupt files) are
/// returned before any backend call. Stage-level problems never are: check
/// each [`AnalysisStageResult::status`].
///
/// # Example
/// ```rust,no_run
/// use edgequake_docintel::{process_document, AnalysisConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AnalysisConfig::default();
/// let doc = process_document("invoice.pdf", &config).await?;
/// println!("{} ({:.0}%)", doc.result.document_type(), doc.result.overall_confidence * 100.0);
/// # Ok(())
/// # }
/// ```
pub async fn process_document(
    input_str: impl AsRef<str>,
    config: &AnalysisConfig,
) -> Result<ProcessedDocument, DocIntelError> {
    process_document_with_cancel(input_str, config, &CancellationToken::new()).await
}

/// [`process_document`] with cooperative cancellation.
pub async fn process_document_with_cancel(
    input_str: impl AsRef<str>,
    config: &AnalysisConfig,
    cancel: &CancellationToken,
) -> Result<ProcessedDocument, DocIntelError> {
    config.validate()?;
    let input_str = input_str.as_ref();
    info!("Processing document: {}", input_str);
    let doc = input::resolve_input(
        input_str,
        config.max_file_size_bytes,
        config.download_timeout_secs,
    )
    .await?;
    process_input(doc, config, cancel).await
}

/// Process an in-memory document. `name` is used for format detection by
/// extension and in error messages.
pub async fn process_bytes(
    bytes: Vec<u8>,
    name: &str,
    config: &AnalysisConfig,
) -> Result<ProcessedDocument, DocIntelError> {
    config.validate()?;
    let doc = input::from_bytes(bytes, name, config.max_file_size_bytes)?;
    process_input(doc, config, &CancellationToken::new()).await
}

/// Synchronous wrapper around [`process_document`].
///
/// Creates a temporary tokio runtime internally.
pub fn process_sync(
    input_str: impl AsRef<str>,
    config: &AnalysisConfig,
) -> Result<ProcessedDocument, DocIntelError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| DocIntelError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(process_document(input_str, config))
}

async fn process_input(
    doc: InputDocument,
    config: &AnalysisConfig,
    cancel: &CancellationToken,
) -> Result<ProcessedDocument, DocIntelError> {
    let backend = resolve_backend(config)?;
    let extractor: Arc<dyn Extractor> = match config.extractor {
        Some(ref e) => Arc::clone(e),
        None => Arc::new(DocumentExtractor::new(
            Some(Arc::clone(&backend)),
            RetryPolicy::from_config(config),
        )),
    };

    let extract_start = Instant::now();
    let raw = extractor
        .extract(&doc.bytes, doc.format)
        .await
        .map_err(|e| e.into_doc_error(&doc.name))?;
    debug!(
        "Extracted {} blocks from {} in {}ms",
        raw.text_blocks.len(),
        doc.name,
        extract_start.elapsed().as_millis()
    );

    let content = Arc::new(normalize(raw)?);
    let result = run_analysis(&content, config, backend.as_ref(), cancel).await?;

    Ok(ProcessedDocument {
        name: doc.name,
        content,
        result: Arc::new(result),
    })
}
