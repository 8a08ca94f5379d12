//! Rate limit response header names.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlidegateError};

/// Names of the headers written on limited responses.
///
/// Any name left empty is not written at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseHeaders {
    /// Configured request limit
    pub limit: String,
    /// Requests left in the current window
    pub remaining: String,
    /// Cost of this request
    pub increment: String,
    /// Seconds until the current window ends
    pub reset: String,
    /// Seconds to wait before retrying, on rejection only
    pub retry_after: String,
}

impl Default for ResponseHeaders {
    fn default() -> Self {
        Self {
            limit: "X-RateLimit-Limit".to_string(),
            remaining: "X-RateLimit-Remaining".to_string(),
            increment: "X-RateLimit-Increment".to_string(),
            reset: "X-RateLimit-Reset".to_string(),
            retry_after: "Retry-After".to_string(),
        }
    }
}

impl ResponseHeaders {
    /// No rate limit headers at all.
    pub fn none() -> Self {
        Self {
            limit: String::new(),
            remaining: String::new(),
            increment: String::new(),
            reset: String::new(),
            retry_after: String::new(),
        }
    }

    /// Validate the names, producing the set used at request time.
    pub(crate) fn compile(&self) -> Result<HeaderNames> {
        Ok(HeaderNames {
            limit: parse_name(&self.limit)?,
            remaining: parse_name(&self.remaining)?,
            increment: parse_name(&self.increment)?,
            reset: parse_name(&self.reset)?,
            retry_after: parse_name(&self.retry_after)?,
        })
    }
}

fn parse_name(name: &str) -> Result<Option<HeaderName>> {
    if name.is_empty() {
        return Ok(None);
    }
    HeaderName::from_bytes(name.as_bytes())
        .map(Some)
        .map_err(|e| SlidegateError::Config(format!("invalid header name '{}': {}", name, e)))
}

/// Parsed header names; `None` means omitted.
#[derive(Debug, Clone)]
pub(crate) struct HeaderNames {
    pub limit: Option<HeaderName>,
    pub remaining: Option<HeaderName>,
    pub increment: Option<HeaderName>,
    pub reset: Option<HeaderName>,
    pub retry_after: Option<HeaderName>,
}

/// Write `value` under `name` unless the header is omitted.
pub(crate) fn set_header(headers: &mut HeaderMap, name: &Option<HeaderName>, value: u64) {
    if let Some(name) = name {
        headers.insert(name.clone(), HeaderValue::from(value));
    }
}
