//! Preprocessor: canonicalise a [`RawExtraction`] into [`DocumentContent`].
//!
//! Pure transform, no I/O. Whitespace cleanup rules follow the same spirit
//! as Markdown post-processing: cheap, deterministic passes that never touch
//! the words themselves.

use crate::document::{BlockType, DocumentContent, LayoutBlock, RawExtraction, SourceFormat};
use crate::error::DocIntelError;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// Marker inserted before each page of a multi-page document.
pub fn page_marker(page: usize) -> String {
    format!("<!-- page {page} -->")
}

static RE_PAGE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<!-- page \d+ -->$").unwrap());

/// True for lines produced by [`page_marker`].
pub fn is_page_marker(line: &str) -> bool {
    RE_PAGE_MARKER.is_match(line.trim())
}

/// Map the adapter's format string onto a [`SourceFormat`].
fn source_format(format: &str) -> Result<SourceFormat, DocIntelError> {
    match format.trim().to_ascii_lowercase().as_str() {
        "pdf" => Ok(SourceFormat::Pdf),
        "image" | "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" => Ok(SourceFormat::Image),
        other => Err(DocIntelError::MalformedInput(format!(
            "unsupported source format '{other}'"
        ))),
    }
}

/// Build the canonical document from raw extraction output.
///
/// Fails with `MalformedInput` for unknown source formats and with
/// `ExtractionEmpty` when no block carries any text.
pub fn normalize(raw: RawExtraction) -> Result<DocumentContent, DocIntelError> {
    let source_format = source_format(&raw.format)?;

    let mut types = vec![BlockType::Text; raw.text_blocks.len()];
    for hint in &raw.layout_hints {
        match types.get_mut(hint.block_index) {
            Some(slot) => *slot = hint.block_type,
            None => warn!(
                "Ignoring layout hint for block {} (only {} blocks)",
                hint.block_index,
                raw.text_blocks.len()
            ),
        }
    }

    let layout_blocks: Vec<LayoutBlock> = raw
        .text_blocks
        .into_iter()
        .zip(types)
        .filter_map(|(block, block_type)| {
            let text = clean_text(&block.text);
            (!text.is_empty()).then(|| LayoutBlock {
                page: block.page.max(1),
                bounds: block.bounds,
                block_type,
                text,
            })
        })
        .collect();

    let highest_page = layout_blocks.iter().map(|b| b.page).max().unwrap_or(0);
    let page_count = raw.page_count.max(highest_page);

    if layout_blocks.is_empty() {
        return Err(DocIntelError::ExtractionEmpty { pages: page_count });
    }

    let raw_text = merge_pages(&layout_blocks, page_count);
    debug!(
        "Normalised {} blocks across {} page(s), {} chars",
        layout_blocks.len(),
        page_count,
        raw_text.len()
    );

    Ok(DocumentContent {
        raw_text,
        layout_blocks,
        page_count,
        source_format,
    })
}

fn merge_pages(blocks: &[LayoutBlock], page_count: usize) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(blocks.len() * 2);
    let mut current_page = 0;
    for block in blocks {
        if page_count > 1 && block.page != current_page {
            parts.push(page_marker(block.page));
        }
        current_page = block.page;
        parts.push(block.text.clone());
    }
    parts.join("\n\n")
}

// ── Whitespace cleanup ───────────────────────────────────────────────────

static RE_INLINE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{00A0}]+").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Zero-width spaces, joiners, BOM and soft hyphens.
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
    )
}

/// Collapse noisy whitespace, keeping line structure.
pub fn clean_text(input: &str) -> String {
    let visible: String = input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !is_invisible(*c))
        .collect();

    let lines = visible
        .lines()
        .map(|line| RE_INLINE_SPACE.replace_all(line.trim(), " ").into_owned())
        .collect::<Vec<_>>()
        .join("\n");

    RE_BLANK_LINES.replace_all(lines.trim(), "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{LayoutHint, RawBlock};

    fn block(page: usize, text: &str) -> RawBlock {
        RawBlock {
            page,
            text: text.into(),
            bounds: None,
        }
    }

    fn raw(blocks: Vec<RawBlock>, hints: Vec<LayoutHint>, pages: usize, format: &str) -> RawExtraction {
        RawExtraction {
            text_blocks: blocks,
            layout_hints: hints,
            page_count: pages,
            format: format.into(),
        }
    }

    #[test]
    fn single_page_has_no_markers() {
        let doc = normalize(raw(vec![block(1, "INVOICE"), block(1, "Total  $10")], vec![], 1, "png")).unwrap();
        assert_eq!(doc.raw_text, "INVOICE\n\nTotal $10");
        assert_eq!(doc.source_format, SourceFormat::Image);
        assert_eq!(doc.page_count, 1);
    }

    #[test]
    fn multi_page_gets_markers() {
        let doc = normalize(raw(vec![block(1, "one"), block(2, "two")], vec![], 2, "pdf")).unwrap();
        assert_eq!(doc.raw_text, "<!-- page 1 -->\n\none\n\n<!-- page 2 -->\n\ntwo");
        assert!(is_page_marker("<!-- page 2 -->"));
        assert!(!is_page_marker("page 2"));
    }

    #[test]
    fn hints_are_merged_and_default_is_text() {
        let doc = normalize(raw(
            vec![block(1, "Heading"), block(1, "body"), block(1, "| a |")],
            vec![
                LayoutHint { block_index: 0, block_type: BlockType::Heading },
                LayoutHint { block_index: 2, block_type: BlockType::Table },
                LayoutHint { block_index: 9, block_type: BlockType::Table },
            ],
            1,
            "pdf",
        ))
        .unwrap();
        let types: Vec<_> = doc.layout_blocks.iter().map(|b| b.block_type).collect();
        assert_eq!(types, vec![BlockType::Heading, BlockType::Text, BlockType::Table]);
    }

    #[test]
    fn whitespace_only_blocks_are_dropped() {
        let doc = normalize(raw(vec![block(1, " \u{200B} \n\t"), block(1, "kept")], vec![], 1, "pdf")).unwrap();
        assert_eq!(doc.layout_blocks.len(), 1);
        assert_eq!(doc.raw_text, "kept");
    }

    #[test]
    fn empty_extraction_fails() {
        let err = normalize(raw(vec![block(1, "   ")], vec![], 3, "pdf")).unwrap_err();
        assert!(matches!(err, DocIntelError::ExtractionEmpty { pages: 3 }));
    }

    #[test]
    fn unknown_format_is_malformed() {
        let err = normalize(raw(vec![block(1, "x")], vec![], 1, "docx")).unwrap_err();
        assert!(matches!(err, DocIntelError::MalformedInput(_)));
    }

    #[test]
    fn clean_text_collapses_noise() {
        assert_eq!(clean_text("a  \t b\r\n\n\n\n c\u{FEFF}"), "a b\n\nc");
    }
}
