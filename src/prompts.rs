//! Prompts for every analysis strategy and for grounded Q&A.
//!
//! Keeping every prompt here means strategy code in
//! [`crate::pipeline::stages`] only decides *what context* to send, and
//! prompt wording can change without touching retry or validation logic.

use crate::output::{DocumentType, EntitiesPayload, SummaryPayload};
use schemars::JsonSchema;
use serde_json::{json, Value};

/// Shared system prompt for all analysis stages.
pub const ANALYST_SYSTEM_PROMPT: &str = r#"You are an expert document analyst. You read extracted document text and produce precise, structured findings.

Rules:
1. Use ONLY information present in the document text.
2. Never invent names, numbers or dates.
3. Include a "confidence" field between 0 and 1 that reflects how sure you are.
4. Return only the requested output, without commentary."#;

/// System prompt for grounded question answering.
pub const QA_SYSTEM_PROMPT: &str = r#"You are a document assistant answering questions about ONE document.

Rules:
1. Answer only from the document text provided.
2. Use the previous turns to resolve references such as "it", "they" or "that amount".
3. Put the exact document passages supporting your answer in "evidence", copied verbatim.
4. If the document does not contain the answer, set "found" to false and leave "answer" empty.
5. Include a "confidence" field between 0 and 1."#;

/// System prompt for image transcription in the default extractor.
pub const TRANSCRIBE_SYSTEM_PROMPT: &str = r#"You are an OCR engine. Transcribe ALL text visible in the image.

Rules:
1. Preserve reading order.
2. Use # for headings and GFM pipe tables for tables.
3. Separate paragraphs with a blank line.
4. Output ONLY the transcription, without commentary or fences."#;

/// Appended to the system prompt of structured requests.
pub fn schema_instruction(schema: &Value) -> String {
    format!(
        "Respond with a single JSON object matching this JSON Schema:\n{}",
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
    )
}

/// JSON Schema for `T` with the `confidence` property every stage reports.
pub fn response_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({}));
    if let Some(props) = schema
        .get_mut("properties")
        .and_then(Value::as_object_mut)
    {
        props.insert(
            "confidence".to_string(),
            json!({"type": "number", "minimum": 0, "maximum": 1}),
        );
    }
    schema
}

// ── Classification ───────────────────────────────────────────────────────

pub fn classification_prompt(document: &str, truncated: bool) -> String {
    let scope = if truncated {
        "the opening blocks of a document"
    } else {
        "a document"
    };
    format!(
        "Classify {scope} as one of: invoice, contract, resume, report, letter, other.\n\
         Give a one-sentence rationale citing concrete features.\n\n\
         DOCUMENT:\n\"\"\"\n{document}\n\"\"\""
    )
}

// ── Entities ─────────────────────────────────────────────────────────────

fn entity_focus(doc_type: DocumentType) -> &'static str {
    match doc_type {
        DocumentType::Invoice => "Focus on amounts, dates, vendor and customer organizations, and line items.",
        DocumentType::Contract => "Focus on parties, dates, amounts, obligations and penalties.",
        DocumentType::Resume => "Focus on the person, contact details, employers, and education.",
        DocumentType::Report => "Focus on organizations, people, dates and key figures.",
        DocumentType::Letter => "Focus on sender, recipient, dates and referenced organizations.",
        DocumentType::Other => "Extract every relevant entity.",
    }
}

pub fn entities_structured_prompt(document: &str, doc_type: DocumentType) -> String {
    format!(
        "Extract named entities from this {doc_type} document.\n\
         Allowed kinds: person, organization, date, amount, location, email, phone, url, other.\n\
         {}\n\
         Copy values exactly as written. Give each entity a short context.\n\n\
         DOCUMENT:\n\"\"\"\n{document}\n\"\"\"",
        entity_focus(doc_type)
    )
}

pub fn entities_free_text_prompt(document: &str, doc_type: DocumentType) -> String {
    format!(
        "List the named entities in this {doc_type} document, one per line, as `kind: value`.\n\
         Kinds: person, organization, date, amount, location, email, phone, url, other.\n\
         {}\n\
         Finish with a line `confidence: <number between 0 and 1>`.\n\n\
         DOCUMENT:\n\"\"\"\n{document}\n\"\"\"",
        entity_focus(doc_type)
    )
}

// ── Summary ──────────────────────────────────────────────────────────────

pub fn summary_prompt(document: &str, doc_type: DocumentType) -> String {
    format!(
        "Summarise this {doc_type} in 2–3 sentences, list its key points, and rate its \
         sentiment (positive, neutral, negative) and completeness (complete, partial, incomplete).\n\n\
         DOCUMENT:\n\"\"\"\n{document}\n\"\"\""
    )
}

pub fn summary_chunk_prompt(chunk: &str, index: usize, total: usize) -> String {
    format!(
        "This is part {index} of {total} of a longer document. Summarise this part in 2–3 \
         sentences and list its key points.\n\n\
         PART:\n\"\"\"\n{chunk}\n\"\"\""
    )
}

pub fn summary_merge_prompt(partials: &[SummaryPayload], doc_type: DocumentType) -> String {
    let body = partials
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let points = p
                .key_points
                .iter()
                .map(|k| format!("  - {k}"))
                .collect::<Vec<_>>()
                .join("\n");
            format!("Part {}: {}\n{}", i + 1, p.summary, points)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Merge these partial summaries of one {doc_type} into a single 2–3 sentence summary \
         with deduplicated key points, sentiment and completeness.\n\n{body}"
    )
}

// ── Risk ─────────────────────────────────────────────────────────────────

pub fn risk_prompt(
    doc_type: DocumentType,
    summary: &str,
    key_points: &[String],
    entities: Option<&EntitiesPayload>,
) -> String {
    let mut context = format!("DOCUMENT TYPE: {doc_type}\n\nSUMMARY:\n{summary}\n");
    if !key_points.is_empty() {
        context.push_str("\nKEY POINTS:\n");
        for k in key_points {
            context.push_str(&format!("- {k}\n"));
        }
    }
    if let Some(entities) = entities {
        context.push_str("\nENTITIES:\n");
        for e in &entities.entities {
            context.push_str(&format!("- {}: {}\n", e.kind, e.value));
        }
    }
    format!(
        "Identify risks, concerns or red flags in this document (missing information, \
         unusual terms, deadlines, inconsistencies). Rate each risk's severity (low, medium, high), \
         suggest actionable recommendations, and rate overall urgency.\n\
         An empty risk list is a valid answer.\n\n{context}"
    )
}

// ── Q&A ──────────────────────────────────────────────────────────────────

pub fn qa_prompt(document: &str, history: &[(String, String)], question: &str) -> String {
    let mut prompt = format!("DOCUMENT:\n\"\"\"\n{document}\n\"\"\"\n");
    if !history.is_empty() {
        prompt.push_str("\nPREVIOUS TURNS:\n");
        for (q, a) in history {
            prompt.push_str(&format!("Q: {q}\nA: {a}\n"));
        }
    }
    prompt.push_str(&format!("\nQUESTION: {question}"));
    prompt
}

pub fn qa_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "found": {"type": "boolean"},
            "answer": {"type": "string"},
            "evidence": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
        },
        "required": ["found", "answer"]
    })
}
