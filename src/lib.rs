//! # edgequake-docintel
//!
//! Turn PDFs and scanned images into structured, confidence-scored analysis,
//! then answer questions about them.
//!
//! ## Why this crate?
//!
//! LLM output is only useful when you know how far to trust it. Every stage
//! here is validated twice: by the model's own confidence and by a
//! structural check on what it actually returned. A stage that falls short
//! walks down a fallback ladder (full document, truncated document, local
//! heuristics) instead of failing the run, and says so in its status.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Input       resolve local file, URL or buffer; size + format checks
//!  ├─ 2. Extract     lopdf text layer, or a vision model for scans
//!  ├─ 3. Normalize   clean text, typed layout blocks, page markers
//!  ├─ 4. Analyze     classification → entities → summary → risk
//!  │                 (each: strategy ladder + validation)
//!  ├─ 5. Q&A         grounded answers in a session over the result
//!  └─ 6. Export      JSON, plain-text report or Markdown
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docintel::{process_document, AnalysisConfig, ConversationManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = AnalysisConfig::default();
//!     let doc = process_document("invoice.pdf", &config).await?;
//!
//!     for stage in &doc.result.stages {
//!         eprintln!("{}: {} ({:.2})", stage.stage, stage.status, stage.confidence);
//!     }
//!
//!     let qa = ConversationManager::new(&config)?;
//!     let session = qa.open_session(&doc);
//!     let turn = qa.ask(&session, "What is the total amount due?").await?;
//!     println!("{} ({:.0}%)", turn.answer, turn.confidence * 100.0);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docintel` binary (clap + anyhow + tracing-subscriber) |
//!
//! ## Bring Your Own Backend
//!
//! Anything implementing [`AiBackend`] can stand in for the LLM, and anything
//! implementing [`Extractor`] can replace the built-in PDF/OCR extraction.
//! Both are injected through [`AnalysisConfigBuilder`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyze;
pub mod backend;
pub mod config;
pub mod conversation;
pub mod document;
pub mod error;
pub mod export;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analyze::{
    analyze, analyze_with_cancel, process_bytes, process_document, process_document_with_cancel,
    process_sync, ProcessedDocument,
};
pub use backend::{AiBackend, BackendResponse, CompletionRequest, LlmBackend};
pub use config::{AnalysisConfig, AnalysisConfigBuilder, StageThresholds};
pub use conversation::{
    ConversationManager, ConversationSession, QaTurn, SessionState, NOT_FOUND_ANSWER,
};
pub use document::{BlockType, DocumentContent, LayoutBlock, RawExtraction, SourceFormat};
pub use error::{BackendError, DocIntelError, ExtractError, StageError};
pub use export::{export, write_atomic, ExportBundle, ExportFormat, Exporter};
pub use output::{
    AnalysisResult, AnalysisStageResult, AnalysisStats, ClassificationPayload, DocumentType,
    EntitiesPayload, Entity, EntityKind, RiskPayload, Stage, StagePayload, StageStatus,
    SummaryPayload,
};
pub use pipeline::extract::{DocumentExtractor, Extractor};
pub use progress::{AnalysisProgressCallback, NoopProgressCallback, ProgressCallback};
pub use tokio_util::sync::CancellationToken;
