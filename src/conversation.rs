//! Conversation Manager: grounded follow-up questions about one document.
//!
//! A [`ConversationSession`] is an explicit value owned by the caller; there
//! is no process-wide session registry. It shares the immutable
//! document/analysis pair and holds the ordered Q&A history.
//!
//! ## Turn serialisation
//!
//! The history lives behind a `tokio::sync::Mutex` that is held for the
//! whole of [`ConversationManager::ask`]. Two concurrent questions on the
//! same session therefore answer one after the other, and the second sees
//! the first in its context window. Different sessions never contend.
//!
//! ## Grounding
//!
//! An answer is kept only if it can be traced to the document text: at
//! least half of its tokens must occur in the document, and when the
//! backend quotes evidence, at least one quote must occur verbatim.
//! Anything else becomes
//! [`NOT_FOUND_ANSWER`] with confidence 0.

use crate::analyze::ProcessedDocument;
use crate::backend::{call_with_retry, resolve_backend, AiBackend, CompletionRequest, RetryPolicy};
use crate::config::AnalysisConfig;
use crate::document::DocumentContent;
use crate::error::{BackendError, DocIntelError};
use crate::output::AnalysisResult;
use crate::pipeline::stages::truncate_chars;
use crate::prompts::{qa_prompt, qa_schema, QA_SYSTEM_PROMPT};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Literal answer for questions the document cannot answer.
pub const NOT_FOUND_ANSWER: &str = "not found in document";

/// Minimum share of answer tokens that must occur in the document.
const MIN_TOKEN_OVERLAP: f32 = 0.5;

/// One question and its answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaTurn {
    pub question: String,
    pub answer: String,
    pub confidence: f32,
    /// `false` when the answer is [`NOT_FOUND_ANSWER`].
    pub found: bool,
    /// Document passages supporting the answer, verified verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl QaTurn {
    fn not_found(question: &str) -> Self {
        Self {
            question: question.to_string(),
            answer: NOT_FOUND_ANSWER.to_string(),
            confidence: 0.0,
            found: false,
            evidence: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Answering,
    Closed,
}

// ── Session ──────────────────────────────────────────────────────────────

/// Conversational state tied to one analysed document.
pub struct ConversationSession {
    id: Uuid,
    content: Arc<DocumentContent>,
    result: Arc<AnalysisResult>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    superseded: AtomicBool,
    turns: Mutex<Vec<QaTurn>>,
}

impl fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationSession")
            .field("id", &self.id)
            .field("run_id", &self.result.run_id)
            .field("expires_at", &self.expires_at)
            .field("state", &self.state())
            .finish()
    }
}

impl ConversationSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn content(&self) -> &Arc<DocumentContent> {
        &self.content
    }

    pub fn result(&self) -> &Arc<AnalysisResult> {
        &self.result
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Mark the session as replaced by a newer document run.
    pub fn supersede(&self) {
        if !self.superseded.swap(true, Ordering::SeqCst) {
            info!("Session {} superseded", self.id);
        }
    }

    /// Superseded or past its TTL.
    pub fn is_expired(&self) -> bool {
        self.superseded.load(Ordering::SeqCst) || Utc::now() >= self.expires_at
    }

    pub fn state(&self) -> SessionState {
        if self.is_expired() {
            SessionState::Closed
        } else if self.turns.try_lock().is_err() {
            SessionState::Answering
        } else {
            SessionState::Idle
        }
    }

    /// Snapshot of the turns so far, in order. Waits for an in-flight answer.
    pub async fn history(&self) -> Vec<QaTurn> {
        self.turns.lock().await.clone()
    }

    fn expired_error(&self) -> DocIntelError {
        DocIntelError::SessionExpired {
            session_id: self.id.to_string(),
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

/// Opens sessions and answers questions with a shared backend.
pub struct ConversationManager {
    backend: Arc<dyn AiBackend>,
    config: AnalysisConfig,
}

impl ConversationManager {
    /// Validate `config` and resolve its backend.
    pub fn new(config: &AnalysisConfig) -> Result<Self, DocIntelError> {
        config.validate()?;
        Ok(Self {
            backend: resolve_backend(config)?,
            config: config.clone(),
        })
    }

    /// Open a session over a processed document.
    pub fn open_session(&self, doc: &ProcessedDocument) -> ConversationSession {
        let created_at = Utc::now();
        let ttl = TimeDelta::try_seconds(self.config.session_ttl_secs.min(i64::MAX as u64) as i64)
            .unwrap_or(TimeDelta::MAX);
        let session = ConversationSession {
            id: Uuid::new_v4(),
            content: Arc::clone(&doc.content),
            result: Arc::clone(&doc.result),
            created_at,
            expires_at: created_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            superseded: AtomicBool::new(false),
            turns: Mutex::new(Vec::new()),
        };
        info!(
            "Session {} opened for run {} (expires {})",
            session.id, doc.result.run_id, session.expires_at
        );
        session
    }

    /// Supersede `previous` and open a session for the new document.
    pub fn replace_session(&self, previous: &ConversationSession, doc: &ProcessedDocument) -> ConversationSession {
        previous.supersede();
        self.open_session(doc)
    }

    /// Answer `question` from the session's document and recent turns.
    ///
    /// # Errors
    /// - [`DocIntelError::EmptyQuestion`] for a blank question
    /// - [`DocIntelError::SessionExpired`] once superseded or past the TTL
    /// - [`DocIntelError::BackendUnavailable`] when transient retries run out
    pub async fn ask(&self, session: &ConversationSession, question: &str) -> Result<QaTurn, DocIntelError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(DocIntelError::EmptyQuestion);
        }
        if session.is_expired() {
            return Err(session.expired_error());
        }

        let mut turns = session.turns.lock().await;
        if session.is_expired() {
            return Err(session.expired_error());
        }

        let window = self.config.qa_history_turns;
        let history: Vec<(String, String)> = turns
            .iter()
            .skip(turns.len().saturating_sub(window))
            .map(|t| (t.question.clone(), t.answer.clone()))
            .collect();

        let (document, _) = truncate_chars(&session.content.raw_text, self.config.max_context_chars);
        let request = CompletionRequest::new("qa", QA_SYSTEM_PROMPT, qa_prompt(document, &history, question))
            .with_schema(qa_schema());

        let policy = RetryPolicy::from_config(&self.config);
        let outcome = call_with_retry(self.backend.as_ref(), &request, &policy).await;

        let turn = match outcome.result {
            Ok(response) => {
                let claimed = serde_json::from_value::<QaAnswer>(response.payload).ok();
                match claimed {
                    Some(answer) => ground(question, answer, response.self_reported_confidence, &session.content.raw_text),
                    None => {
                        warn!("Session {}: undecodable answer, treating as not found", session.id);
                        QaTurn::not_found(question)
                    }
                }
            }
            Err(BackendError::Parse(detail)) => {
                warn!("Session {}: unparseable answer ({}), treating as not found", session.id, detail);
                QaTurn::not_found(question)
            }
            Err(e) => {
                return Err(DocIntelError::BackendUnavailable {
                    attempts: outcome.calls,
                    detail: e.to_string(),
                })
            }
        };

        info!(
            "Session {} turn {}: {} (confidence {:.2})",
            session.id,
            turns.len() + 1,
            if turn.found { "grounded" } else { "not found" },
            turn.confidence
        );
        turns.push(turn.clone());
        Ok(turn)
    }
}

// ── Grounding ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct QaAnswer {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    evidence: Vec<String>,
}

/// Lowercase alphanumeric tokens joined by single spaces.
fn normalise(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn ground(question: &str, claimed: QaAnswer, self_reported: Option<f32>, document: &str) -> QaTurn {
    let answer = claimed.answer.trim();
    if !claimed.found || answer.is_empty() || answer.eq_ignore_ascii_case(NOT_FOUND_ANSWER) {
        return QaTurn::not_found(question);
    }

    let doc_norm = format!(" {} ", normalise(document));
    let quotes: Vec<String> = claimed
        .evidence
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !normalise(e).is_empty())
        .collect();

    // The answer itself must be traceable, with or without quotes.
    let doc_tokens: HashSet<&str> = doc_norm.split_whitespace().collect();
    let answer_norm = normalise(answer);
    let tokens: Vec<&str> = answer_norm.split_whitespace().collect();
    let hits = tokens.iter().filter(|t| doc_tokens.contains(*t)).count();
    let overlap = hits as f32 / tokens.len().max(1) as f32;
    debug!("Answer token overlap {:.2}", overlap);
    if overlap < MIN_TOKEN_OVERLAP {
        return QaTurn::not_found(question);
    }

    let (score, evidence) = if quotes.is_empty() {
        (overlap, Vec::new())
    } else {
        let total = quotes.len();
        let verified: Vec<String> = quotes
            .into_iter()
            .filter(|q| doc_norm.contains(&format!(" {} ", normalise(q))))
            .collect();
        debug!("{} of {} evidence quotes verified", verified.len(), total);
        if verified.is_empty() {
            return QaTurn::not_found(question);
        }
        let verified_share = verified.len() as f32 / total as f32;
        (verified_share.min(overlap), verified)
    };

    let confidence = match self_reported {
        Some(c) => c.clamp(0.0, 1.0).min(score),
        None => score,
    };

    QaTurn {
        question: question.to_string(),
        answer: answer.to_string(),
        confidence,
        found: true,
        evidence,
        timestamp: Utc::now(),
    }
}
