//! Transport abstraction and buffered HTTP types.
//!
//! The merge layer is written against a minimal `Transport` capability so it
//! can wrap any concrete HTTP client. Requests and responses are fully
//! buffered: a stable dedup key must exist before dispatch, and one shared
//! response body is replayed to every merged caller.

use async_trait::async_trait;
use thiserror::Error;

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
}

impl HttpMethod {
    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request or response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Per-request merge opt-out.
///
/// Requests that must not share a response with identical concurrent
/// requests (e.g. non-idempotent calls) set `Never` and dispatch unmerged,
/// subject only to the concurrency budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeHint {
    /// Merge with any identical in-flight request.
    #[default]
    Auto,
    /// Always dispatch a dedicated underlying call.
    Never,
}

/// A fully-formed outbound call. Immutable once issued; partial or
/// streaming bodies are not supported because the dedup key is computed
/// over the complete body before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<HttpHeader>,
    pub body: Option<Vec<u8>>,
    pub merge_hint: MergeHint,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            merge_hint: MergeHint::Auto,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HttpHeader::new(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_hint(mut self, hint: MergeHint) -> Self {
        self.merge_hint = hint;
        self
    }

    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// A buffered response, cheap enough to clone once per merged waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<HttpHeader>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: Vec::new() }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures of the underlying call. Cloneable because one failure is
/// delivered verbatim to every waiter on the affected entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("request cancelled before completion")]
    Cancelled,

    #[error("transport overloaded: {current} pending requests (max {max})")]
    Overloaded { current: usize, max: usize },
}

/// The underlying call capability the engine wraps.
///
/// Implementations must tolerate concurrent invocation; the engine
/// guarantees at most one call per distinct in-flight dedup key and at most
/// `concurrency_limit` calls outstanding overall.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}
