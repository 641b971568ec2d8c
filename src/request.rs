//! Per-request inputs: HTTP method and the identity-relevant request config.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// HTTP methods the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Safe to repeat without additional side effects.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Method::Post | Method::Patch)
    }

    /// Changes server state; successful calls invalidate cached reads of the same path.
    pub fn is_mutation(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch | Method::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unsupported method name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported http method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

/// Request options. `query` and `params` feed the request signature; `headers` never do.
///
/// ```rust
/// use lifeline::RequestConfig;
/// use std::time::Duration;
///
/// let config = RequestConfig::new()
///     .param("id", "42")
///     .query("window", "1h")
///     .header("x-trace-id", "abc123")
///     .cache_ttl(Duration::from_secs(30));
/// assert_eq!(config.query.get("window").map(String::as_str), Some("1h"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Query string parameters.
    pub query: BTreeMap<String, String>,
    /// Route parameters substituted into `{name}` or `:name` path segments.
    pub params: BTreeMap<String, String>,
    /// Extra headers sent with the request.
    pub headers: BTreeMap<String, String>,
    /// Overrides the client's default cache duration; `Some(Duration::ZERO)` disables caching.
    pub cache_ttl: Option<Duration>,
    /// Send without credentials and never enter the refresh path.
    pub skip_auth: bool,
    /// Lets the caller stop waiting.
    pub cancel: Option<CancellationToken>,
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}
