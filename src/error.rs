//! Error types for the edgequake-docintel library.
//!
//! Failures fall into four families, and each has a distinct home:
//!
//! * **Input errors** (missing file, oversized file, unsupported format,
//!   corrupt bytes) — [`DocIntelError`], returned before any analysis starts.
//!
//! * **Transient backend errors** (unreachable service, rate limiting,
//!   timeouts) — [`BackendError`] at the AI backend boundary. The orchestrator
//!   retries them with backoff; once exhausted they become a
//!   [`StageError::BackendExhausted`] on the affected stage only.
//!
//! * **Quality errors** (low confidence, undecodable structured output) —
//!   never surfaced as `Err`. They drive the fallback ladder and end up as a
//!   [`StageError`] attached to a degraded stage.
//!
//! * **Session errors** (expired or superseded session) — [`DocIntelError`],
//!   surfaced to Q&A callers only.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docintel library.
///
/// Stage-level problems use [`StageError`] and are stored in
/// [`crate::output::AnalysisStageResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum DocIntelError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The document is larger than `max_file_size_bytes`.
    #[error("'{name}' is {size} bytes, which exceeds the {limit}-byte limit")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    /// The bytes are not one of the supported document formats.
    #[error("Unsupported format for '{name}': {detail}\nSupported: pdf, png, jpg, jpeg, tiff, bmp")]
    UnsupportedFormat { name: String, detail: String },

    /// The file claims a supported format but cannot be parsed.
    #[error("'{name}' is corrupt: {detail}")]
    CorruptFile { name: String, detail: String },

    // ── Preprocessing errors ──────────────────────────────────────────────
    /// Extraction produced no text and no layout blocks.
    #[error("No text could be recovered from the document ({pages} page(s) scanned)")]
    ExtractionEmpty { pages: usize },

    /// The raw extraction names a source format the pipeline does not handle.
    #[error("Malformed extraction: {0}")]
    MalformedInput(String),

    // ── Backend errors ────────────────────────────────────────────────────
    /// The configured backend is not initialised (missing API key etc.).
    #[error("AI backend '{provider}' is not configured.\n{hint}")]
    BackendNotConfigured { provider: String, hint: String },

    /// The backend stayed unreachable for every retry of a Q&A turn.
    #[error("AI backend unavailable after {attempts} attempt(s): {detail}")]
    BackendUnavailable { attempts: u32, detail: String },

    // ── Session errors ────────────────────────────────────────────────────
    /// The session was superseded by a newer document or outlived its TTL.
    #[error("Session {session_id} has expired; process the document again to continue")]
    SessionExpired { session_id: String },

    /// A blank question was submitted.
    #[error("Question must not be empty")]
    EmptyQuestion,

    /// The run was cancelled at a stage checkpoint.
    #[error("Analysis cancelled after {completed} of 4 stages")]
    Cancelled { completed: usize },

    // ── Output errors ─────────────────────────────────────────────────────
    /// An export adapter could not serialise the result.
    #[error("Export to {format} failed: {detail}")]
    Export { format: String, detail: String },

    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or pre-run validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocIntelError {
    /// True for errors raised before the pipeline starts (bad file, bad size).
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            DocIntelError::FileNotFound { .. }
                | DocIntelError::PermissionDenied { .. }
                | DocIntelError::InvalidInput { .. }
                | DocIntelError::DownloadFailed { .. }
                | DocIntelError::DownloadTimeout { .. }
                | DocIntelError::FileTooLarge { .. }
                | DocIntelError::UnsupportedFormat { .. }
                | DocIntelError::CorruptFile { .. }
        )
    }
}

/// Errors raised by an [`crate::backend::AiBackend`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Service unreachable or returned a server error.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// HTTP 429 or equivalent; callers back off instead of falling back.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The call did not finish within `api_timeout_secs`.
    #[error("backend call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The response could not be decoded into the requested shape.
    #[error("could not parse backend output: {0}")]
    Parse(String),
}

impl BackendError {
    /// Unavailable, rate-limited and timed-out calls are worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendError::Parse(_))
    }
}

/// A non-fatal error attached to a single analysis stage.
///
/// The run continues; the stage is marked `degraded` or `failed`.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    /// Transient backend errors persisted through every retry.
    #[error("backend exhausted after {attempts} call(s): {detail}")]
    BackendExhausted { attempts: u32, detail: String },

    /// The last backend answer could not be decoded.
    #[error("unparseable output: {detail}")]
    Parse { detail: String },

    /// The best candidate never reached the stage threshold.
    #[error("confidence {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence { confidence: f32, threshold: f32 },
}

/// Errors raised by an [`crate::pipeline::extract::Extractor`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt file: {0}")]
    CorruptFile(String),

    #[error("extraction engine unavailable after {attempts} call(s): {detail}")]
    EngineUnavailable { attempts: u32, detail: String },
}

impl ExtractError {
    /// Attach the document name for the caller-facing error.
    pub fn into_doc_error(self, name: &str) -> DocIntelError {
        match self {
            ExtractError::UnsupportedFormat(detail) => DocIntelError::UnsupportedFormat {
                name: name.to_string(),
                detail,
            },
            ExtractError::CorruptFile(detail) => DocIntelError::CorruptFile {
                name: name.to_string(),
                detail,
            },
            ExtractError::EngineUnavailable { attempts, detail } => {
                DocIntelError::BackendUnavailable { attempts, detail }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_too_large_display() {
        let e = DocIntelError::FileTooLarge {
            name: "scan.png".into(),
            size: 60,
            limit: 50,
        };
        let msg = e.to_string();
        assert!(msg.contains("scan.png"), "got: {msg}");
        assert!(msg.contains("50-byte"), "got: {msg}");
        assert!(e.is_input_error());
    }

    #[test]
    fn session_errors_are_not_input_errors() {
        let e = DocIntelError::SessionExpired {
            session_id: "abc".into(),
        };
        assert!(!e.is_input_error());
        assert!(e.to_string().contains("abc"));
    }

    #[test]
    fn parse_is_not_transient() {
        assert!(!BackendError::Parse("eof".into()).is_transient());
        assert!(BackendError::Unavailable("503".into()).is_transient());
        assert!(BackendError::RateLimited {
            retry_after_secs: None
        }
        .is_transient());
        assert!(BackendError::Timeout { secs: 5 }.is_transient());
    }

    #[test]
    fn stage_error_serialises_with_kind_tag() {
        let e = StageError::LowConfidence {
            confidence: 0.2,
            threshold: 0.5,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "low_confidence");
        assert!(e.to_string().contains("0.20"));
    }

    #[test]
    fn extract_error_keeps_name() {
        let e = ExtractError::CorruptFile("bad xref".into()).into_doc_error("a.pdf");
        assert!(matches!(e, DocIntelError::CorruptFile { ref name, .. } if name == "a.pdf"));
    }
}
