//! Turning HTTP and transport failures into [`BackendError`]s.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tiller_core::error::{BackendError, BackendErrorKind, PayloadSummary};
use tiller_core::Message;

/// Longest slice of an error body kept in the error message.
const MAX_BODY_EXCERPT: usize = 400;

fn context_too_long_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)context.?length|context.?window|prompt is too long|too many tokens|maximum context|input is too long|exceeds? the (?:maximum|max)",
        )
        .expect("context-length regex must compile")
    })
}

/// Who a request went to, attached to every error it produces.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    pub payload: PayloadSummary,
}

impl RequestTarget {
    pub fn new(provider: &str, endpoint: &str, model: &str, messages: &[Message]) -> Self {
        Self {
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            payload: PayloadSummary::of(messages),
        }
    }

    pub fn error(&self, kind: BackendErrorKind) -> BackendError {
        BackendError {
            provider: self.provider.clone(),
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            payload: self.payload,
            kind,
        }
    }
}

/// Classify a non-success HTTP response.
pub fn classify_status(status: u16, headers: &HeaderMap, body: &str) -> BackendErrorKind {
    let message = excerpt(&extract_error_message(body));

    match status {
        401 | 403 => BackendErrorKind::AuthenticationFailed(message),
        429 => BackendErrorKind::RateLimited {
            retry_after_secs: retry_after(headers),
        },
        400 | 413 | 422 if context_too_long_regex().is_match(body) => {
            BackendErrorKind::ContextTooLong(message)
        }
        _ => BackendErrorKind::Api {
            status_code: status,
            message,
        },
    }
}

/// Classify a failure that never produced an HTTP status.
pub fn classify_transport(err: &reqwest::Error) -> BackendErrorKind {
    if err.is_timeout() {
        BackendErrorKind::Timeout(err.to_string())
    } else {
        BackendErrorKind::Network(err.to_string())
    }
}

/// Seconds from a `Retry-After` header, when given as an integer.
pub fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| secs.max(0.0).ceil() as u64)
}

/// Pull `error.message` / `message` / `detail` out of a JSON error body.
fn extract_error_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };

    let candidates = [
        json.pointer("/error/message"),
        json.get("message"),
        json.get("detail"),
        json.get("error"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= MAX_BODY_EXCERPT {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_BODY_EXCERPT).collect();
    format!("{cut}… ({} chars total)", text.chars().count())
}
