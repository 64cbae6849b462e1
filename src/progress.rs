//! Progress-callback trait for per-stage analysis events.
//!
//! Inject an [`Arc<dyn AnalysisProgressCallback>`] via
//! [`crate::config::AnalysisConfigBuilder::progress_callback`] to observe a
//! run as it moves through classification, entities, summary and risk.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docintel::{AnalysisConfig, AnalysisProgressCallback, Stage, StageStatus};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct DegradedCounter {
//!     degraded: AtomicUsize,
//! }
//!
//! impl AnalysisProgressCallback for DegradedCounter {
//!     fn on_stage_complete(&self, stage: Stage, status: StageStatus, confidence: f32) {
//!         if status == StageStatus::Degraded {
//!             self.degraded.fetch_add(1, Ordering::SeqCst);
//!             eprintln!("{stage} degraded at {confidence:.2}");
//!         }
//!     }
//! }
//!
//! let counter = Arc::new(DegradedCounter { degraded: AtomicUsize::new(0) });
//!
//! let config = AnalysisConfig::builder()
//!     .progress_callback(counter as Arc<dyn AnalysisProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::output::{Stage, StageStatus};
use std::sync::Arc;

/// Called by the orchestrator as it processes each stage.
///
/// Implementations must be `Send + Sync`: independent documents may be
/// analysed concurrently with the same config. All methods default to no-ops.
pub trait AnalysisProgressCallback: Send + Sync {
    /// Called once before the first stage.
    fn on_analysis_start(&self, total_stages: usize) {
        let _ = total_stages;
    }

    /// Called before a stage's first strategy attempt.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when an attempt is rejected and the stage moves down its
    /// fallback ladder.
    ///
    /// # Arguments
    /// * `attempt` — 1-indexed number of the attempt that was rejected
    /// * `reason`  — human-readable rejection reason
    fn on_stage_retry(&self, stage: Stage, attempt: u32, reason: &str) {
        let _ = (stage, attempt, reason);
    }

    /// Called once the stage reaches its final status.
    fn on_stage_complete(&self, stage: Stage, status: StageStatus, confidence: f32) {
        let _ = (stage, status, confidence);
    }

    /// Called once after all stages have run.
    fn on_analysis_complete(&self, overall_confidence: f32, accepted_stages: usize) {
        let _ = (overall_confidence, accepted_stages);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl AnalysisProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::AnalysisConfig`].
pub type ProgressCallback = Arc<dyn AnalysisProgressCallback>;
