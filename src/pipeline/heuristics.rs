//! Terminal fallbacks: deterministic analysers that need no backend.
//!
//! They run on the last rung of a stage's ladder. Their output is always
//! delivered as degraded, at a fixed floor confidence set by the caller.

use crate::document::{BlockType, DocumentContent};
use crate::output::{
    ClassificationPayload, Completeness, DocumentType, EntitiesPayload, Entity, EntityKind, Level,
    RiskPayload, Sentiment, SummaryPayload,
};
use crate::pipeline::preprocess::is_page_marker;
use crate::pipeline::validate::{parse_amount, parse_date};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

// ── Keyword classifier ───────────────────────────────────────────────────

const KEYWORDS: &[(DocumentType, &[&str])] = &[
    (
        DocumentType::Invoice,
        &[
            "invoice", "bill to", "amount due", "total due", "subtotal", "invoice number",
            "due date", "payment terms", "remit to",
        ],
    ),
    (
        DocumentType::Contract,
        &[
            "agreement", "hereinafter", "whereas", "parties", "shall", "governing law",
            "termination", "terms and conditions",
        ],
    ),
    (
        DocumentType::Resume,
        &[
            "resume", "curriculum vitae", "work experience", "education", "skills",
            "employment history", "references",
        ],
    ),
    (
        DocumentType::Report,
        &[
            "report", "executive summary", "findings", "methodology", "conclusion",
            "recommendations", "results",
        ],
    ),
    (
        DocumentType::Letter,
        &["dear", "sincerely", "yours truly", "kind regards", "to whom it may concern"],
    ),
];

/// Lowercase words separated by single spaces, padded for phrase matching.
fn word_haystack(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    format!(" {} ", words.join(" "))
}

/// Classify by counting keyword hits; ties go to the earlier type.
pub fn classify_by_keywords(text: &str) -> ClassificationPayload {
    let haystack = word_haystack(text);

    let mut best: Option<(DocumentType, Vec<&str>)> = None;
    for (doc_type, keywords) in KEYWORDS {
        let hits: Vec<&str> = keywords
            .iter()
            .copied()
            .filter(|kw| haystack.contains(&format!(" {kw} ")))
            .collect();
        if hits.is_empty() {
            continue;
        }
        if best.as_ref().is_none_or(|(_, b)| hits.len() > b.len()) {
            best = Some((*doc_type, hits));
        }
    }

    match best {
        Some((document_type, hits)) => ClassificationPayload {
            document_type,
            rationale: format!("keyword match: {}", hits.join(", ")),
        },
        None => ClassificationPayload {
            document_type: DocumentType::Other,
            rationale: String::new(),
        },
    }
}

// ── Regex entities ───────────────────────────────────────────────────────

static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).unwrap());
static RE_PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+\d{1,3}[\s.-]?)?\(?\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}\b").unwrap()
});
static RE_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[$€£¥]\s?\d[\d,]*(?:\.\d{1,2})?|\b(?:USD|EUR|GBP|CAD|AUD|CHF)\s?\d[\d,]*(?:\.\d{1,2})?|\b\d[\d,]*(?:\.\d{1,2})?\s?(?:USD|EUR|GBP|CAD|AUD|CHF)\b",
    )
    .unwrap()
});
static RE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \b\d{4}[-/]\d{1,2}[-/]\d{1,2}\b
        | \b\d{1,2}[/.-]\d{1,2}[/.-]\d{4}\b
        | \b(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4}\b
        | \b\d{1,2}\s+(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\s+\d{4}\b
        ",
    )
    .unwrap()
});

/// Pattern-based partial entity set. Amounts and dates that do not parse
/// are dropped; duplicates are removed.
pub fn extract_regex_entities(text: &str) -> EntitiesPayload {
    let mut seen = HashSet::new();
    let mut entities = Vec::new();

    let mut push = |kind: EntityKind, value: &str| {
        let value = value.trim().trim_end_matches(['.', ',']).to_string();
        if !value.is_empty() && seen.insert((kind, value.clone())) {
            entities.push(Entity {
                kind,
                value,
                context: None,
                confidence: None,
            });
        }
    };

    for m in RE_AMOUNT.find_iter(text) {
        if parse_amount(m.as_str()).is_some() {
            push(EntityKind::Amount, m.as_str());
        }
    }
    for m in RE_DATE.find_iter(text) {
        if parse_date(m.as_str()).is_some() {
            push(EntityKind::Date, m.as_str());
        }
    }
    for m in RE_EMAIL.find_iter(text) {
        push(EntityKind::Email, m.as_str());
    }
    for m in RE_URL.find_iter(text) {
        push(EntityKind::Url, m.as_str());
    }
    for m in RE_PHONE.find_iter(text) {
        push(EntityKind::Phone, m.as_str());
    }

    EntitiesPayload { entities }
}

// ── Extractive summary ───────────────────────────────────────────────────

const MAX_KEY_POINTS: usize = 5;

/// First `n` sentences of the body text; headings become key points.
pub fn extractive_summary(content: &DocumentContent, n: usize) -> SummaryPayload {
    let body: Vec<&str> = content
        .layout_blocks
        .iter()
        .filter(|b| b.block_type == BlockType::Text)
        .map(|b| b.text.as_str())
        .collect();
    let source = if body.is_empty() {
        content
            .raw_text
            .lines()
            .filter(|l| !is_page_marker(l))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        body.join("\n\n")
    };

    let summary = split_sentences(&source)
        .into_iter()
        .filter(|s| s.chars().any(char::is_alphabetic))
        .take(n)
        .collect::<Vec<_>>()
        .join(" ");

    let key_points = content
        .headings()
        .map(|h| h.text.trim_start_matches('#').trim().to_string())
        .filter(|h| !h.is_empty())
        .take(MAX_KEY_POINTS)
        .collect();

    SummaryPayload {
        summary,
        key_points,
        sentiment: Sentiment::Neutral,
        completeness: Completeness::Unknown,
    }
}

/// Split on `.`, `!` or `?` followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(if c == '\n' { ' ' } else { c });
        let boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().is_none_or(|next| next.is_whitespace());
        if boundary {
            let s = current.split_whitespace().collect::<Vec<_>>().join(" ");
            if !s.is_empty() {
                sentences.push(s);
            }
            current.clear();
        }
    }
    let rest = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

// ── Risk ─────────────────────────────────────────────────────────────────

/// No risks can be inferred without a backend.
pub fn empty_risk() -> RiskPayload {
    RiskPayload {
        risk_factors: Vec::new(),
        recommendations: Vec::new(),
        urgency: Level::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{LayoutBlock, SourceFormat};

    const INVOICE: &str = "ACME Corp\nINVOICE\nInvoice Number: 1042\nBill To: Jane Roe\n\
        Due Date: 2024-03-15\nTotal Due: $1,250.00\nQuestions? billing@acme.example or 555-123-4567.\n\
        Pay online at https://acme.example/pay.";

    #[test]
    fn keyword_classifier_picks_invoice() {
        let c = classify_by_keywords(INVOICE);
        assert_eq!(c.document_type, DocumentType::Invoice);
        assert!(c.rationale.contains("invoice"));
    }

    #[test]
    fn keyword_classifier_needs_whole_words() {
        let c = classify_by_keywords("The syntax of the dearth of data.");
        assert_eq!(c.document_type, DocumentType::Other);
        assert!(c.rationale.is_empty());
    }

    #[test]
    fn regex_entities_cover_common_kinds() {
        let e = extract_regex_entities(INVOICE);
        let has = |k: EntityKind, v: &str| e.entities.iter().any(|x| x.kind == k && x.value == v);
        assert!(has(EntityKind::Amount, "$1,250.00"));
        assert!(has(EntityKind::Date, "2024-03-15"));
        assert!(has(EntityKind::Email, "billing@acme.example"));
        assert!(has(EntityKind::Phone, "555-123-4567"));
        assert!(has(EntityKind::Url, "https://acme.example/pay"));
    }

    #[test]
    fn invalid_dates_are_dropped() {
        let e = extract_regex_entities("Signed 2024-02-30 and 31/12/2023.");
        let dates: Vec<_> = e
            .entities
            .iter()
            .filter(|x| x.kind == EntityKind::Date)
            .map(|x| x.value.as_str())
            .collect();
        assert_eq!(dates, vec!["31/12/2023"]);
    }

    #[test]
    fn duplicates_are_removed() {
        let e = extract_regex_entities("$5.00 then $5.00 again");
        assert_eq!(e.entities.len(), 1);
    }

    #[test]
    fn sentence_splitting() {
        let s = split_sentences("First one. Second one!\nThird? v1.2 stays. Tail");
        assert_eq!(s, vec!["First one.", "Second one!", "Third?", "v1.2 stays.", "Tail"]);
    }

    #[test]
    fn extractive_summary_uses_body_and_headings() {
        let block = |t: BlockType, text: &str| LayoutBlock {
            page: 1,
            bounds: None,
            block_type: t,
            text: text.into(),
        };
        let content = DocumentContent {
            raw_text: String::new(),
            layout_blocks: vec![
                block(BlockType::Heading, "# Quarterly Report"),
                block(BlockType::Text, "Revenue grew. Costs fell. Margin improved. Outlook stable."),
            ],
            page_count: 1,
            source_format: SourceFormat::Pdf,
        };
        let s = extractive_summary(&content, 2);
        assert_eq!(s.summary, "Revenue grew. Costs fell.");
        assert_eq!(s.key_points, vec!["Quarterly Report"]);
    }
}
