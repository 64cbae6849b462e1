//! Extraction Adapter: raw document bytes → [`RawExtraction`].
//!
//! The pipeline only depends on the [`Extractor`] trait. The bundled
//! [`DocumentExtractor`] reads the text layer of PDFs with `lopdf` and sends
//! image scans to the vision backend for transcription. Block typing (table,
//! heading, text) happens here, on the adapter side; the Preprocessor only
//! merges the hints it is given.

use crate::backend::{call_with_retry, AiBackend, CompletionRequest, RetryPolicy};
use crate::document::{BlockType, FormatHint, LayoutHint, RawBlock, RawExtraction};
use crate::error::{BackendError, ExtractError};
use crate::pipeline::encode::prepare_scan;
use crate::prompts::TRANSCRIBE_SYSTEM_PROMPT;
use async_trait::async_trait;
use lopdf::Document;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Wraps a text-extraction engine.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], format: FormatHint) -> Result<RawExtraction, ExtractError>;
}

/// Default adapter: `lopdf` for PDFs, vision transcription for scans.
pub struct DocumentExtractor {
    vision: Option<Arc<dyn AiBackend>>,
    retry: RetryPolicy,
}

impl DocumentExtractor {
    /// `vision` transcribes image scans; without it only PDFs are readable.
    pub fn new(vision: Option<Arc<dyn AiBackend>>, retry: RetryPolicy) -> Self {
        Self { vision, retry }
    }

    async fn transcribe(&self, bytes: &[u8], format: FormatHint) -> Result<RawExtraction, ExtractError> {
        let vision = self.vision.as_ref().ok_or_else(|| {
            ExtractError::UnsupportedFormat(format!(
                "{format} scans need a vision backend for transcription"
            ))
        })?;

        let image = prepare_scan(bytes, format)?;
        let request = CompletionRequest::new(
            "extract/transcribe",
            TRANSCRIBE_SYSTEM_PROMPT,
            "Transcribe this scanned page.",
        )
        .with_images(vec![image]);

        let outcome = call_with_retry(vision.as_ref(), &request, &self.retry).await;
        let text = match outcome.result {
            Ok(response) => strip_fences(&response.text()),
            Err(BackendError::Parse(detail)) => return Err(ExtractError::CorruptFile(detail)),
            Err(e) => {
                return Err(ExtractError::EngineUnavailable {
                    attempts: outcome.calls,
                    detail: e.to_string(),
                })
            }
        };

        info!("Transcribed {} scan: {} chars", format, text.len());
        Ok(build_extraction(vec![(1, text)], 1, format))
    }
}

#[async_trait]
impl Extractor for DocumentExtractor {
    async fn extract(&self, bytes: &[u8], format: FormatHint) -> Result<RawExtraction, ExtractError> {
        match format {
            FormatHint::Pdf => {
                let owned = bytes.to_vec();
                // lopdf can panic on hostile input; a crashed worker means the file is unreadable.
                tokio::task::spawn_blocking(move || read_pdf(&owned))
                    .await
                    .map_err(|e| ExtractError::CorruptFile(format!("PDF parser aborted: {e}")))?
            }
            _ => self.transcribe(bytes, format).await,
        }
    }
}

/// Read the text layer of every page.
fn read_pdf(bytes: &[u8]) -> Result<RawExtraction, ExtractError> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| ExtractError::CorruptFile(format!("cannot parse PDF: {e}")))?;
    if doc.is_encrypted() {
        return Err(ExtractError::UnsupportedFormat("encrypted PDF".into()));
    }

    let pages = doc.get_pages();
    let page_count = pages.len();
    if page_count == 0 {
        return Err(ExtractError::CorruptFile("PDF has no pages".into()));
    }

    let mut page_texts = Vec::with_capacity(page_count);
    for (index, page_num) in pages.keys().enumerate() {
        match doc.extract_text(&[*page_num]) {
            Ok(text) => page_texts.push((index + 1, text)),
            Err(e) => warn!("Page {}: no text layer ({})", index + 1, e),
        }
    }
    debug!("Read {} of {} PDF pages with text", page_texts.len(), page_count);

    Ok(build_extraction(page_texts, page_count, FormatHint::Pdf))
}

/// Split page texts into paragraph blocks and attach layout hints.
fn build_extraction(pages: Vec<(usize, String)>, page_count: usize, format: FormatHint) -> RawExtraction {
    let mut text_blocks = Vec::new();
    let mut layout_hints = Vec::new();

    for (page, text) in pages {
        for paragraph in split_paragraphs(&text) {
            let block_type = classify_block(&paragraph);
            if block_type != BlockType::Text {
                layout_hints.push(LayoutHint {
                    block_index: text_blocks.len(),
                    block_type,
                });
            }
            text_blocks.push(RawBlock {
                page,
                text: paragraph,
                bounds: None,
            });
        }
    }

    RawExtraction {
        text_blocks,
        layout_hints,
        page_count,
        format: format.to_string(),
    }
}

/// Paragraphs separated by blank lines. A title-like first line is split
/// off its paragraph so it can become a heading block.
fn split_paragraphs(text: &str) -> Vec<String> {
    let normalised = text.replace("\r\n", "\n");
    let mut out = Vec::new();
    for para in normalised.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        match para.split_once('\n') {
            Some((first, rest)) if is_title_like(first) && !first.trim_start().starts_with('|') => {
                out.push(first.trim().to_string());
                out.push(rest.trim().to_string());
            }
            _ => out.push(para.to_string()),
        }
    }
    out
}

/// Adapter-side block typing from text shape.
pub fn classify_block(text: &str) -> BlockType {
    let trimmed = text.trim();
    if trimmed.starts_with('#') {
        return BlockType::Heading;
    }
    let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
    if !lines.is_empty() && lines.iter().all(|l| l.trim_start().starts_with('|')) {
        return BlockType::Table;
    }
    if lines.len() == 1 && is_title_like(lines[0]) {
        return BlockType::Heading;
    }
    BlockType::Text
}

fn is_title_like(line: &str) -> bool {
    let line = line.trim();
    let starts_upper = line.chars().next().is_some_and(|c| c.is_uppercase());
    starts_upper
        && line.chars().count() <= 60
        && line.split_whitespace().count() <= 8
        && !line.ends_with(['.', ',', ';', ':'])
        && !line.contains([':', '$'])
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|text)?\n(.*)\n```\s*$").unwrap());

fn strip_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}
