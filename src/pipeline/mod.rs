//! Pipeline steps from raw bytes to a validated, stage-by-stage analysis.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ preprocess ──▶ stages (× 4) ──▶ AnalysisResult
//! (path/URL) (lopdf/VLM)  (normalize)    │  ▲
//!                                        ▼  │
//!                                      validate
//! ```
//!
//! 1. [`input`]      — resolve a path, URL or buffer; size and format checks
//! 2. [`extract`]    — the Extraction Adapter boundary and its default
//!    implementation; [`encode`] prepares scans for the vision backend
//! 3. [`preprocess`] — canonical [`crate::document::DocumentContent`]
//! 4. [`stages`]     — per-stage strategy ladders; the only step with
//!    backend I/O besides scan transcription
//! 5. [`validate`]   — structural scoring and accept / retry / degrade
//!    decisions; [`heuristics`] are the terminal rungs

pub mod encode;
pub mod extract;
pub mod heuristics;
pub mod input;
pub mod preprocess;
pub mod stages;
pub mod validate;
