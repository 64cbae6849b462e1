//! Document-side data model: what the Extraction Adapter hands over
//! ([`RawExtraction`]) and what the preprocessor produces ([`DocumentContent`]).
//!
//! `DocumentContent` is immutable once built. The pipeline shares it behind an
//! `Arc` with the conversation layer; nothing holds a `&mut` to it after
//! [`crate::pipeline::preprocess::normalize`] returns.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Where the document bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Pdf,
    Image,
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Pdf => write!(f, "pdf"),
            SourceFormat::Image => write!(f, "image"),
        }
    }
}

/// Concrete file formats accepted at the input boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatHint {
    Pdf,
    Png,
    Jpeg,
    Tiff,
    Bmp,
}

impl FormatHint {
    /// Detect the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            Some(FormatHint::Pdf)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(FormatHint::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(FormatHint::Jpeg)
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(FormatHint::Tiff)
        } else if bytes.starts_with(b"BM") {
            Some(FormatHint::Bmp)
        } else {
            None
        }
    }

    /// Map a file extension (without the dot, any case).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FormatHint::Pdf),
            "png" => Some(FormatHint::Png),
            "jpg" | "jpeg" => Some(FormatHint::Jpeg),
            "tif" | "tiff" => Some(FormatHint::Tiff),
            "bmp" => Some(FormatHint::Bmp),
            _ => None,
        }
    }

    pub fn source_format(self) -> SourceFormat {
        match self {
            FormatHint::Pdf => SourceFormat::Pdf,
            _ => SourceFormat::Image,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            FormatHint::Pdf => "application/pdf",
            FormatHint::Png => "image/png",
            FormatHint::Jpeg => "image/jpeg",
            FormatHint::Tiff => "image/tiff",
            FormatHint::Bmp => "image/bmp",
        }
    }
}

impl fmt::Display for FormatHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FormatHint::Pdf => "pdf",
            FormatHint::Png => "png",
            FormatHint::Jpeg => "jpeg",
            FormatHint::Tiff => "tiff",
            FormatHint::Bmp => "bmp",
        };
        f.write_str(s)
    }
}

/// Structural role of a layout block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    #[default]
    Text,
    Table,
    Heading,
}

/// Page-relative bounding region, in the adapter's units (usually points).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One normalised block of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutBlock {
    /// 1-indexed page the block was found on.
    pub page: usize,
    pub bounds: Option<BoundingBox>,
    pub block_type: BlockType,
    pub text: String,
}

/// Canonical document produced by the preprocessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentContent {
    /// Full text with page-boundary markers between pages.
    pub raw_text: String,
    pub layout_blocks: Vec<LayoutBlock>,
    pub page_count: usize,
    pub source_format: SourceFormat,
}

impl DocumentContent {
    /// Stable content fingerprint used by [`crate::output::DocumentRef`].
    pub fn fingerprint(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.raw_text.hash(&mut hasher);
        self.page_count.hash(&mut hasher);
        self.source_format.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// The first `n` blocks joined as plain text.
    pub fn leading_blocks_text(&self, n: usize) -> String {
        self.layout_blocks
            .iter()
            .take(n)
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Heading blocks in document order.
    pub fn headings(&self) -> impl Iterator<Item = &LayoutBlock> {
        self.layout_blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Heading)
    }
}

// ── Extraction Adapter output ────────────────────────────────────────────

/// A text block as reported by the extraction engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawBlock {
    /// 1-indexed page number.
    pub page: usize,
    pub text: String,
    pub bounds: Option<BoundingBox>,
}

/// Layout classification the engine made for `text_blocks[block_index]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutHint {
    pub block_index: usize,
    pub block_type: BlockType,
}

/// Everything the Extraction Adapter recovered from the raw bytes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawExtraction {
    pub text_blocks: Vec<RawBlock>,
    pub layout_hints: Vec<LayoutHint>,
    pub page_count: usize,
    /// Format label reported by the engine: "pdf", "png", "jpeg", "image", …
    pub format: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_magic_bytes() {
        assert_eq!(FormatHint::sniff(b"%PDF-1.7\n"), Some(FormatHint::Pdf));
        assert_eq!(
            FormatHint::sniff(&[0x89, b'P', b'N', b'G', 0x0D]),
            Some(FormatHint::Png)
        );
        assert_eq!(
            FormatHint::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(FormatHint::Jpeg)
        );
        assert_eq!(FormatHint::sniff(b"II*\0rest"), Some(FormatHint::Tiff));
        assert_eq!(FormatHint::sniff(b"BM\0\0"), Some(FormatHint::Bmp));
        assert_eq!(FormatHint::sniff(b"PK\x03\x04"), None);
    }

    #[test]
    fn extension_mapping_is_case_insensitive() {
        assert_eq!(FormatHint::from_extension("JPG"), Some(FormatHint::Jpeg));
        assert_eq!(FormatHint::from_extension("tif"), Some(FormatHint::Tiff));
        assert_eq!(FormatHint::from_extension("docx"), None);
        assert_eq!(FormatHint::Png.source_format(), SourceFormat::Image);
    }

    #[test]
    fn fingerprint_depends_on_text() {
        let a = DocumentContent {
            raw_text: "Invoice 1".into(),
            layout_blocks: vec![],
            page_count: 1,
            source_format: SourceFormat::Pdf,
        };
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.raw_text.push('2');
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
