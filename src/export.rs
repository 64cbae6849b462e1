//! Export adapters: pure functions from an analysis (plus Q&A history) to
//! bytes.
//!
//! Each format is an independent [`Exporter`]; [`export`] dispatches on
//! [`ExportFormat`]. Nothing here touches the analysis core.

use crate::conversation::QaTurn;
use crate::error::DocIntelError;
use crate::output::{AnalysisResult, StageStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Everything an export renders.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExportBundle<'a> {
    pub source: &'a str,
    pub result: &'a AnalysisResult,
    pub history: &'a [QaTurn],
}

impl<'a> ExportBundle<'a> {
    pub fn new(source: &'a str, result: &'a AnalysisResult, history: &'a [QaTurn]) -> Self {
        Self {
            source,
            result,
            history,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Text,
    Markdown,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Text => "txt",
            ExportFormat::Markdown => "md",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportFormat::Json => "json",
            ExportFormat::Text => "text",
            ExportFormat::Markdown => "markdown",
        };
        f.write_str(s)
    }
}

impl FromStr for ExportFormat {
    type Err = DocIntelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "text" | "txt" => Ok(ExportFormat::Text),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            other => Err(DocIntelError::InvalidConfig(format!(
                "unknown export format '{other}' (expected json, text or markdown)"
            ))),
        }
    }
}

/// Serialises an [`ExportBundle`] into one concrete format.
pub trait Exporter: Send + Sync {
    fn format(&self) -> ExportFormat;
    fn serialize(&self, bundle: &ExportBundle<'_>) -> Result<Vec<u8>, DocIntelError>;
}

/// Render `bundle` as `format`.
pub fn export(bundle: &ExportBundle<'_>, format: ExportFormat) -> Result<Vec<u8>, DocIntelError> {
    exporter_for(format).serialize(bundle)
}

pub fn exporter_for(format: ExportFormat) -> Box<dyn Exporter> {
    match format {
        ExportFormat::Json => Box::new(JsonExporter),
        ExportFormat::Text => Box::new(TextReportExporter),
        ExportFormat::Markdown => Box::new(MarkdownExporter),
    }
}

// ── JSON ─────────────────────────────────────────────────────────────────

/// Full structured result and history, pretty-printed.
pub struct JsonExporter;

impl Exporter for JsonExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    fn serialize(&self, bundle: &ExportBundle<'_>) -> Result<Vec<u8>, DocIntelError> {
        let mut bytes = serde_json::to_vec_pretty(bundle).map_err(|e| DocIntelError::Export {
            format: ExportFormat::Json.to_string(),
            detail: e.to_string(),
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

// ── Text report ──────────────────────────────────────────────────────────

/// Plain-text analysis report.
pub struct TextReportExporter;

fn pct(v: f32) -> String {
    format!("{:.1}%", v * 100.0)
}

impl Exporter for TextReportExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Text
    }

    fn serialize(&self, bundle: &ExportBundle<'_>) -> Result<Vec<u8>, DocIntelError> {
        let r = bundle.result;
        let mut out = String::new();

        out.push_str("DOCUMENT ANALYSIS REPORT\n");
        out.push_str(&format!("Source: {}\n", bundle.source));
        out.push_str(&format!("Generated: {}\n", r.created_at.format("%Y-%m-%d %H:%M:%S UTC")));
        out.push_str(&format!("{}\n\n", "=".repeat(50)));

        out.push_str(&format!("DOCUMENT TYPE: {}\n", r.document_type()));
        out.push_str(&format!("CONFIDENCE: {}\n\n", pct(r.overall_confidence)));

        out.push_str("STAGES:\n");
        for s in &r.stages {
            out.push_str(&format!(
                "- {}: {} ({}, {} attempt(s){})\n",
                s.stage,
                s.status,
                pct(s.confidence),
                s.attempt_count,
                s.strategy.as_deref().map(|n| format!(", {n}")).unwrap_or_default()
            ));
        }

        out.push_str("\nEXECUTIVE SUMMARY:\n");
        match r.summary() {
            Some(s) if !s.summary.is_empty() => out.push_str(&format!("{}\n", s.summary)),
            _ => out.push_str("No summary available\n"),
        }

        out.push_str("\nKEY ENTITIES:\n");
        for e in r.entities() {
            out.push_str(&format!("- {}: {}\n", e.kind, e.value));
        }

        if let Some(s) = r.summary().filter(|s| !s.key_points.is_empty()) {
            out.push_str("\nKEY POINTS:\n");
            for (i, p) in s.key_points.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, p));
            }
        }

        if let Some(risk) = r.risk().filter(|k| !k.risk_factors.is_empty()) {
            out.push_str(&format!("\nRISK FACTORS (urgency {}):\n", risk.urgency));
            for (i, f) in risk.risk_factors.iter().enumerate() {
                out.push_str(&format!("{}. [{}] {}\n", i + 1, f.severity, f.description));
            }
            if !risk.recommendations.is_empty() {
                out.push_str("\nRECOMMENDATIONS:\n");
                for (i, rec) in risk.recommendations.iter().enumerate() {
                    out.push_str(&format!("{}. {}\n", i + 1, rec));
                }
            }
        }

        if !bundle.history.is_empty() {
            out.push_str("\nQ&A HISTORY:\n");
            for t in bundle.history {
                out.push_str(&format!("Q: {}\nA: {} ({})\n", t.question, t.answer, pct(t.confidence)));
            }
        }

        Ok(out.into_bytes())
    }
}

// ── Markdown ─────────────────────────────────────────────────────────────

/// Markdown report with a stage table.
pub struct MarkdownExporter;

fn status_badge(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Accepted => "✅ accepted",
        StageStatus::Degraded => "⚠️ degraded",
        StageStatus::Failed => "❌ failed",
    }
}

fn escape_cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}

impl Exporter for MarkdownExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Markdown
    }

    fn serialize(&self, bundle: &ExportBundle<'_>) -> Result<Vec<u8>, DocIntelError> {
        let r = bundle.result;
        let mut out = String::new();

        out.push_str(&format!("# Document Analysis: {}\n\n", bundle.source));
        out.push_str(&format!(
            "**Type:** {} · **Confidence:** {} · **Generated:** {}\n\n",
            r.document_type(),
            pct(r.overall_confidence),
            r.created_at.format("%Y-%m-%d %H:%M UTC")
        ));

        out.push_str("## Stages\n\n| Stage | Status | Confidence | Attempts |\n|---|---|---|---|\n");
        for s in &r.stages {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                s.stage,
                status_badge(s.status),
                pct(s.confidence),
                s.attempt_count
            ));
        }

        if let Some(s) = r.summary() {
            out.push_str(&format!("\n## Summary\n\n{}\n", s.summary));
            if !s.key_points.is_empty() {
                out.push('\n');
                for p in &s.key_points {
                    out.push_str(&format!("- {p}\n"));
                }
            }
        }

        if !r.entities().is_empty() {
            out.push_str("\n## Entities\n\n| Kind | Value |\n|---|---|\n");
            for e in r.entities() {
                out.push_str(&format!("| {} | {} |\n", e.kind, escape_cell(&e.value)));
            }
        }

        if let Some(risk) = r.risk() {
            out.push_str(&format!("\n## Risks (urgency: {})\n\n", risk.urgency));
            if risk.risk_factors.is_empty() {
                out.push_str("No risks identified.\n");
            }
            for f in &risk.risk_factors {
                out.push_str(&format!("- **{}** {}\n", f.severity, f.description));
            }
            if !risk.recommendations.is_empty() {
                out.push_str("\n### Recommendations\n\n");
                for rec in &risk.recommendations {
                    out.push_str(&format!("- {rec}\n"));
                }
            }
        }

        if !bundle.history.is_empty() {
            out.push_str("\n## Q&A\n");
            for t in bundle.history {
                out.push_str(&format!(
                    "\n**Q:** {}\n\n**A:** {} _({})_\n",
                    t.question,
                    t.answer,
                    pct(t.confidence)
                ));
            }
        }

        Ok(out.into_bytes())
    }
}

/// Write `bytes` to `path` atomically (temp file + rename).
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DocIntelError> {
    let write_err = |e: std::io::Error| DocIntelError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, bytes).await.map_err(write_err)?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            warn!("Could not remove {}: {}", tmp_path.display(), cleanup);
        }
        return Err(write_err(e));
    }
    Ok(())
}
