//! AI backend boundary: the trait the pipeline calls and its LLM adapter.
//!
//! The orchestrator and the conversation manager only see [`AiBackend`].
//! [`LlmBackend`] adapts any `edgequake_llm` provider to it; tests plug in a
//! deterministic stub instead.
//!
//! ## Retry Strategy
//!
//! [`call_with_retry`] wraps every call with a timeout and retries transient
//! failures (unavailable, rate-limited, timed out) with exponential backoff
//! (`retry_backoff_ms * 2^attempt`). A rate-limit response that carries a
//! retry-after hint waits for that long instead. Parse errors are returned at
//! once: they are a quality problem for the fallback ladder, not a reason to
//! hammer the backend.

use crate::config::AnalysisConfig;
use crate::error::{BackendError, DocIntelError};
use crate::prompts::schema_instruction;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Model used when a provider is named without a model.
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// Longest server-requested rate-limit pause we honour.
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// A single request to the backend.
#[derive(Clone, Default)]
pub struct CompletionRequest {
    /// Stable label such as `"entities/structured"`, used in logs.
    pub label: String,
    pub system: String,
    pub prompt: String,
    /// JSON Schema the payload must satisfy. `None` asks for free text.
    pub response_schema: Option<Value>,
    /// Images attached to the user turn (vision transcription).
    pub images: Vec<ImageData>,
}

impl fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("label", &self.label)
            .field("system_len", &self.system.len())
            .field("prompt_len", &self.prompt.len())
            .field("structured", &self.response_schema.is_some())
            .field("images", &self.images.len())
            .finish()
    }
}

impl CompletionRequest {
    pub fn new(label: impl Into<String>, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            system: system.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }
}

/// What the backend returned.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    /// A JSON object for structured requests, a JSON string for free text.
    pub payload: Value,
    /// The model's own confidence estimate, if it gave one.
    pub self_reported_confidence: Option<f32>,
}

impl BackendResponse {
    /// Build a response, reading `confidence` from an object payload.
    pub fn from_payload(payload: Value) -> Self {
        let self_reported_confidence = payload
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| (c as f32).clamp(0.0, 1.0));
        Self {
            payload,
            self_reported_confidence,
        }
    }

    /// The payload as text (free-text responses).
    pub fn text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// The completion capability the pipeline depends on.
#[async_trait]
pub trait AiBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<BackendResponse, BackendError>;

    /// Label used in logs.
    fn name(&self) -> &str {
        "backend"
    }
}

// ── edgequake-llm adapter ────────────────────────────────────────────────

/// [`AiBackend`] over an `edgequake_llm` provider.
pub struct LlmBackend {
    provider: Arc<dyn LLMProvider>,
    label: String,
    temperature: f32,
    max_tokens: usize,
}

impl LlmBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>, config: &AnalysisConfig) -> Self {
        Self {
            provider,
            label: label.into(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn build_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AiBackend for LlmBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<BackendResponse, BackendError> {
        let system = match request.response_schema {
            Some(ref schema) => format!("{}\n\n{}", request.system, schema_instruction(schema)),
            None => request.system.clone(),
        };

        let mut messages = vec![ChatMessage::system(&system)];
        if request.images.is_empty() {
            messages.push(ChatMessage::user(&request.prompt));
        } else {
            messages.push(ChatMessage::user_with_images(
                &request.prompt,
                request.images.clone(),
            ));
        }

        let options = self.build_options();
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_provider_error(&e))?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            request.label, response.prompt_tokens, response.completion_tokens
        );

        if request.response_schema.is_some() {
            Ok(BackendResponse::from_payload(parse_json_object(&response.content)?))
        } else {
            Ok(BackendResponse {
                payload: Value::String(response.content),
                self_reported_confidence: None,
            })
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Map a provider error onto the boundary taxonomy.
fn classify_provider_error(err: &LlmError) -> BackendError {
    match err {
        LlmError::RateLimited(message) => BackendError::RateLimited {
            retry_after_secs: retry_after_hint(message),
        },
        // Some providers surface 429 as a generic API error.
        LlmError::ApiError(message) | LlmError::ProviderError(message) if is_rate_limit_text(message) => {
            BackendError::RateLimited {
                retry_after_secs: retry_after_hint(message),
            }
        }
        other => BackendError::Unavailable(other.to_string()),
    }
}

fn is_rate_limit_text(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
}

static RE_RETRY_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:retry[- ]after|try again in)\D{0,3}(\d+(?:\.\d+)?)\s*(ms|s\b|sec|second)?").unwrap()
});

/// Seconds to wait, from "retry after 12" or "try again in 1.5s".
fn retry_after_hint(message: &str) -> Option<u64> {
    let caps = RE_RETRY_AFTER.captures(message)?;
    let value: f64 = caps[1].parse().ok()?;
    let secs = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) if unit == "ms" => value / 1000.0,
        _ => value,
    };
    Some(secs.ceil() as u64)
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n(.*)\n```\s*$").unwrap());

/// Decode a JSON object from model output, tolerating fences and chatter
/// around the object.
pub fn parse_json_object(content: &str) -> Result<Value, BackendError> {
    let trimmed = content.trim();
    let unfenced = RE_OUTER_FENCES
        .captures(trimmed)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| trimmed.to_string());

    let candidate = match serde_json::from_str::<Value>(&unfenced) {
        Ok(v) => v,
        Err(first) => {
            let start = unfenced.find('{');
            let end = unfenced.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if e > s => serde_json::from_str::<Value>(&unfenced[s..=e])
                    .map_err(|e| BackendError::Parse(e.to_string()))?,
                _ => return Err(BackendError::Parse(first.to_string())),
            }
        }
    };

    if candidate.is_object() {
        Ok(candidate)
    } else {
        Err(BackendError::Parse(format!(
            "expected a JSON object, got {}",
            json_kind(&candidate)
        )))
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Retry wrapper ────────────────────────────────────────────────────────

/// Timeout and retry bounds for a single logical backend call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff_ms: u64,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            retries: config.backend_retries,
            backoff_ms: config.retry_backoff_ms,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    fn delay_for(&self, retry: u32, last: &BackendError) -> Duration {
        if let BackendError::RateLimited {
            retry_after_secs: Some(secs),
        } = last
        {
            return Duration::from_secs((*secs).min(MAX_RETRY_AFTER_SECS));
        }
        Duration::from_millis(self.backoff_ms.saturating_mul(2u64.saturating_pow(retry - 1)))
    }
}

/// Result of [`call_with_retry`] plus the number of backend calls spent.
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<BackendResponse, BackendError>,
    pub calls: u32,
}

/// Call the backend, retrying transient failures within `policy`.
pub async fn call_with_retry(
    backend: &dyn AiBackend,
    request: &CompletionRequest,
    policy: &RetryPolicy,
) -> CallOutcome {
    let mut last_err: Option<BackendError> = None;
    let mut calls = 0;

    for attempt in 0..=policy.retries {
        if let Some(ref err) = last_err {
            let delay = policy.delay_for(attempt, err);
            warn!(
                "{}: retry {}/{} after {:?} ({})",
                request.label, attempt, policy.retries, delay, err
            );
            sleep(delay).await;
        }

        calls += 1;
        let result = match timeout(policy.timeout, backend.complete(request)).await {
            Ok(r) => r,
            Err(_) => Err(BackendError::Timeout {
                secs: policy.timeout.as_secs(),
            }),
        };

        match result {
            Ok(response) => {
                return CallOutcome {
                    result: Ok(response),
                    calls,
                }
            }
            Err(e) if e.is_transient() => {
                warn!("{}: call {} failed: {}", request.label, calls, e);
                last_err = Some(e);
            }
            Err(e) => {
                return CallOutcome {
                    result: Err(e),
                    calls,
                }
            }
        }
    }

    CallOutcome {
        result: Err(last_err.unwrap_or_else(|| BackendError::Unavailable("no attempt made".into()))),
        calls,
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider_backend(
    provider_name: &str,
    model: &str,
    config: &AnalysisConfig,
) -> Result<Arc<dyn AiBackend>, DocIntelError> {
    let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        DocIntelError::BackendNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    Ok(Arc::new(LlmBackend::new(
        provider,
        format!("{provider_name}/{model}"),
        config,
    )))
}

/// Resolve the backend, from most-specific to least-specific:
///
/// 1. **Pre-built backend** (`config.backend`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** via `ProviderFactory::from_env`.
pub fn resolve_backend(config: &AnalysisConfig) -> Result<Arc<dyn AiBackend>, DocIntelError> {
    if let Some(ref backend) = config.backend {
        return Ok(Arc::clone(backend));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider_backend(name, model, config);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider_backend(&prov, &model, config);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider_backend("openai", model, config);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| DocIntelError::BackendNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or GEMINI_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(Arc::new(LlmBackend::new(llm_provider, "auto", config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        failures_before_success: u32,
        error: BackendError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AiBackend for FlakyBackend {
        async fn complete(&self, _request: &CompletionRequest) -> Result<BackendResponse, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(self.error.clone())
            } else {
                Ok(BackendResponse::from_payload(serde_json::json!({"ok": true, "confidence": 0.8})))
            }
        }
    }

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            backoff_ms: 1,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn parse_plain_object() {
        let v = parse_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn parse_fenced_object() {
        let v = parse_json_object("```json\n{\"a\": 2}\n```").unwrap();
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn parse_object_with_chatter() {
        let v = parse_json_object("Sure! Here it is: {\"a\": 3} Hope this helps.").unwrap();
        assert_eq!(v["a"], 3);
    }

    #[test]
    fn parse_rejects_truncated_and_non_objects() {
        assert!(matches!(
            parse_json_object(r#"{"entities": [ {"kind": "date""#),
            Err(BackendError::Parse(_))
        ));
        assert!(matches!(parse_json_object("[1, 2]"), Err(BackendError::Parse(_))));
        assert!(matches!(parse_json_object("no json here"), Err(BackendError::Parse(_))));
    }

    #[test]
    fn confidence_is_read_and_clamped() {
        let r = BackendResponse::from_payload(serde_json::json!({"confidence": 1.7}));
        assert_eq!(r.self_reported_confidence, Some(1.0));
        let r = BackendResponse::from_payload(serde_json::json!({"x": 1}));
        assert_eq!(r.self_reported_confidence, None);
    }

    #[test]
    fn provider_errors_are_classified() {
        assert_eq!(
            classify_provider_error(&LlmError::RateLimited(
                "Rate limit reached for gpt-4.1-mini. Please try again in 20s.".into()
            )),
            BackendError::RateLimited {
                retry_after_secs: Some(20)
            }
        );
        assert_eq!(
            classify_provider_error(&LlmError::RateLimited("slow down".into())),
            BackendError::RateLimited {
                retry_after_secs: None
            }
        );
        assert!(matches!(
            classify_provider_error(&LlmError::ApiError("HTTP 429 Too Many Requests".into())),
            BackendError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_provider_error(&LlmError::NetworkError("connection refused".into())),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(classify_provider_error(&LlmError::Timeout), BackendError::Unavailable(_)));
    }

    #[test]
    fn retry_after_hints_are_parsed() {
        assert_eq!(retry_after_hint("Retry-After: 7"), Some(7));
        assert_eq!(retry_after_hint("please try again in 1.2s"), Some(2));
        assert_eq!(retry_after_hint("try again in 450ms"), Some(1));
        assert_eq!(retry_after_hint("quota exceeded"), None);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let backend = FlakyBackend {
            failures_before_success: 2,
            error: BackendError::Unavailable("503".into()),
            calls: AtomicU32::new(0),
        };
        let outcome = call_with_retry(&backend, &CompletionRequest::default(), &fast_policy(3)).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.calls, 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let backend = FlakyBackend {
            failures_before_success: u32::MAX,
            error: BackendError::RateLimited {
                retry_after_secs: None,
            },
            calls: AtomicU32::new(0),
        };
        let outcome = call_with_retry(&backend, &CompletionRequest::default(), &fast_policy(2)).await;
        assert!(matches!(outcome.result, Err(BackendError::RateLimited { .. })));
        assert_eq!(outcome.calls, 3);
    }

    #[tokio::test]
    async fn parse_errors_are_not_retried() {
        let backend = FlakyBackend {
            failures_before_success: u32::MAX,
            error: BackendError::Parse("bad".into()),
            calls: AtomicU32::new(0),
        };
        let outcome = call_with_retry(&backend, &CompletionRequest::default(), &fast_policy(3)).await;
        assert!(matches!(outcome.result, Err(BackendError::Parse(_))));
        assert_eq!(outcome.calls, 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            retries: 3,
            backoff_ms: 500,
            timeout: Duration::from_secs(1),
        };
        let err = BackendError::Unavailable("x".into());
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3, &err), Duration::from_millis(2000));
        let limited = BackendError::RateLimited {
            retry_after_secs: Some(7),
        };
        assert_eq!(policy.delay_for(1, &limited), Duration::from_secs(7));
    }
}
