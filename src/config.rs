//! Configuration types for document analysis.
//!
//! All pipeline behaviour is controlled through [`AnalysisConfig`], built via
//! [`AnalysisConfigBuilder`]. The same struct is validated again at the start
//! of every run, so a config assembled by hand (struct literal or field
//! mutation) still fails fast with [`DocIntelError::InvalidConfig`] instead of
//! misbehaving mid-run.

use crate::backend::AiBackend;
use crate::error::DocIntelError;
use crate::output::Stage;
use crate::pipeline::extract::Extractor;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Per-stage acceptance thresholds.
///
/// A stage result is accepted only when its effective confidence is at least
/// the threshold for that stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageThresholds {
    pub classification: f32,
    pub entities: f32,
    pub summary: f32,
    pub risk: f32,
}

impl Default for StageThresholds {
    fn default() -> Self {
        Self {
            classification: 0.6,
            entities: 0.5,
            summary: 0.5,
            risk: 0.4,
        }
    }
}

impl StageThresholds {
    pub fn for_stage(&self, stage: Stage) -> f32 {
        match stage {
            Stage::Classification => self.classification,
            Stage::Entities => self.entities,
            Stage::Summary => self.summary,
            Stage::Risk => self.risk,
        }
    }
}

/// Configuration for a document analysis run and its Q&A sessions.
///
/// # Example
/// ```rust
/// use edgequake_docintel::AnalysisConfig;
///
/// let config = AnalysisConfig::builder()
///     .max_retries(2)
///     .api_timeout_secs(30)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct AnalysisConfig {
    /// Acceptance threshold per stage.
    pub thresholds: StageThresholds,

    /// Fallback retries per stage after the primary attempt. Default: 2.
    ///
    /// A stage makes at most `max_retries + 1` strategy attempts.
    pub max_retries: u32,

    /// Retries per backend call on transient errors. Default: 3.
    pub backend_retries: u32,

    /// Initial backoff in milliseconds, doubled per transient retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-backend-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Largest accepted input file. Default: 50 MiB.
    pub max_file_size_bytes: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// LLM model identifier. If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    pub provider_name: Option<String>,

    /// Pre-constructed backend. Takes precedence over `provider_name`.
    pub backend: Option<Arc<dyn AiBackend>>,

    /// Pre-constructed extraction adapter. Defaults to
    /// [`crate::pipeline::extract::DocumentExtractor`].
    pub extractor: Option<Arc<dyn Extractor>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per call. Default: 8192.
    pub max_tokens: usize,

    /// Document characters sent as "full context". Default: 30 000.
    pub max_context_chars: usize,

    /// Blocks kept by the truncated classification prompt. Default: 20.
    pub truncated_block_count: usize,

    /// Chunk size for the chunked summary strategy. Default: 8 000.
    pub summary_chunk_chars: usize,

    /// Sentences kept by the extractive summary fallback. Default: 3.
    pub extractive_sentences: usize,

    /// Fixed confidence of heuristic (terminal) fallbacks. Default: 0.3.
    pub heuristic_confidence_floor: f32,

    /// Prior turns included as Q&A context. Default: 5.
    pub qa_history_turns: usize,

    /// Session lifetime in seconds. Default: 3600.
    pub session_ttl_secs: u64,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            thresholds: StageThresholds::default(),
            max_retries: 2,
            backend_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            max_file_size_bytes: 50 * 1024 * 1024,
            download_timeout_secs: 120,
            model: None,
            provider_name: None,
            backend: None,
            extractor: None,
            temperature: 0.1,
            max_tokens: 8192,
            max_context_chars: 30_000,
            truncated_block_count: 20,
            summary_chunk_chars: 8_000,
            extractive_sentences: 3,
            heuristic_confidence_floor: 0.3,
            qa_history_turns: 5,
            session_ttl_secs: 3600,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("thresholds", &self.thresholds)
            .field("max_retries", &self.max_retries)
            .field("backend_retries", &self.backend_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_file_size_bytes", &self.max_file_size_bytes)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("backend", &self.backend.as_ref().map(|_| "<dyn AiBackend>"))
            .field("extractor", &self.extractor.as_ref().map(|_| "<dyn Extractor>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_context_chars", &self.max_context_chars)
            .field("qa_history_turns", &self.qa_history_turns)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .finish()
    }
}

impl AnalysisConfig {
    /// Create a new builder for `AnalysisConfig`.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check every constraint; called by `build()` and before each run.
    pub fn validate(&self) -> Result<(), DocIntelError> {
        for stage in Stage::ALL {
            let t = self.thresholds.for_stage(stage);
            if !(0.0..=1.0).contains(&t) {
                return Err(DocIntelError::InvalidConfig(format!(
                    "{stage} threshold must be within 0–1, got {t}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.heuristic_confidence_floor) {
            return Err(DocIntelError::InvalidConfig(format!(
                "heuristic confidence floor must be within 0–1, got {}",
                self.heuristic_confidence_floor
            )));
        }
        if self.max_retries > 10 {
            return Err(DocIntelError::InvalidConfig(format!(
                "max_retries must be ≤ 10, got {}",
                self.max_retries
            )));
        }
        if self.backend_retries > 10 {
            return Err(DocIntelError::InvalidConfig(format!(
                "backend_retries must be ≤ 10, got {}",
                self.backend_retries
            )));
        }
        let positive = [
            ("api_timeout_secs", self.api_timeout_secs),
            ("max_file_size_bytes", self.max_file_size_bytes),
            ("download_timeout_secs", self.download_timeout_secs),
            ("max_context_chars", self.max_context_chars as u64),
            ("truncated_block_count", self.truncated_block_count as u64),
            ("summary_chunk_chars", self.summary_chunk_chars as u64),
            ("extractive_sentences", self.extractive_sentences as u64),
            ("qa_history_turns", self.qa_history_turns as u64),
            ("session_ttl_secs", self.session_ttl_secs),
            ("max_tokens", self.max_tokens as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(DocIntelError::InvalidConfig(format!(
                "{name} must be ≥ 1"
            )));
        }
        Ok(())
    }

    /// Total strategy attempts a stage may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Builder for [`AnalysisConfig`].
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl fmt::Debug for AnalysisConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl AnalysisConfigBuilder {
    pub fn thresholds(mut self, thresholds: StageThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn threshold(mut self, stage: Stage, value: f32) -> Self {
        let t = &mut self.config.thresholds;
        match stage {
            Stage::Classification => t.classification = value,
            Stage::Entities => t.entities = value,
            Stage::Summary => t.summary = value,
            Stage::Risk => t.risk = value,
        }
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn backend_retries(mut self, n: u32) -> Self {
        self.config.backend_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_file_size_bytes(mut self, bytes: u64) -> Self {
        self.config.max_file_size_bytes = bytes;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn backend(mut self, backend: Arc<dyn AiBackend>) -> Self {
        self.config.backend = Some(backend);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.config.extractor = Some(extractor);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_context_chars(mut self, n: usize) -> Self {
        self.config.max_context_chars = n;
        self
    }

    pub fn truncated_block_count(mut self, n: usize) -> Self {
        self.config.truncated_block_count = n;
        self
    }

    pub fn summary_chunk_chars(mut self, n: usize) -> Self {
        self.config.summary_chunk_chars = n;
        self
    }

    pub fn extractive_sentences(mut self, n: usize) -> Self {
        self.config.extractive_sentences = n;
        self
    }

    pub fn heuristic_confidence_floor(mut self, v: f32) -> Self {
        self.config.heuristic_confidence_floor = v;
        self
    }

    pub fn qa_history_turns(mut self, n: usize) -> Self {
        self.config.qa_history_turns = n;
        self
    }

    pub fn session_ttl_secs(mut self, secs: u64) -> Self {
        self.config.session_ttl_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalysisConfig, DocIntelError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.thresholds.for_stage(Stage::Classification), 0.6);
        assert_eq!(config.thresholds.for_stage(Stage::Risk), 0.4);
    }

    #[test]
    fn thresholds_are_per_stage() {
        let t = StageThresholds::default();
        assert_ne!(t.for_stage(Stage::Classification), t.for_stage(Stage::Risk));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let err = AnalysisConfig::builder()
            .threshold(Stage::Entities, 1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, DocIntelError::InvalidConfig(ref m) if m.contains("entities")));
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = AnalysisConfig::builder()
            .api_timeout_secs(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("api_timeout_secs"));
    }

    #[test]
    fn too_many_retries_rejected() {
        assert!(AnalysisConfig::builder().max_retries(11).build().is_err());
        assert!(AnalysisConfig::builder().max_retries(10).build().is_ok());
    }

    #[test]
    fn hand_mutated_config_fails_validation() {
        let mut config = AnalysisConfig::default();
        config.qa_history_turns = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn temperature_is_clamped() {
        let config = AnalysisConfig::builder().temperature(5.0).build().unwrap();
        assert_eq!(config.temperature, 2.0);
    }
}
