//! Client configuration.
//!
//! Everything has a default, so a host can deserialize a partial JSON document:
//!
//! ```rust
//! use lifeline::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::from_json(r#"{
//!     "base_url": "https://dashboard.example.com/api",
//!     "default_cache_ttl_ms": 5000,
//!     "retry": { "max_retries": 2 },
//!     "cache": { "max_entries": 256 }
//! }"#).unwrap();
//! assert_eq!(config.default_cache_ttl, Duration::from_secs(5));
//! assert_eq!(config.retry.max_retries, 2);
//! assert_eq!(config.auth.refresh_path, "/auth/refresh");
//! ```

use crate::error::ConfigError;
use crate::request::Method;
use crate::retry::RetryConfig;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use url::Url;

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Absolute http(s) URL every request path is appended to.
    pub base_url: String,
    /// Cache duration for cacheable methods when the request does not set one. Zero disables.
    #[serde(rename = "default_cache_ttl_ms", with = "duration_ms")]
    pub default_cache_ttl: Duration,
    pub cacheable_methods: BTreeSet<Method>,
    /// Share one transport call between concurrent identical requests.
    pub dedupe: bool,
    /// Drop cached reads under a path after a successful mutation of that path.
    pub invalidate_on_mutation: bool,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            default_cache_ttl: Duration::ZERO,
            cacheable_methods: [Method::Get].into_iter().collect(),
            dedupe: true,
            invalidate_on_mutation: true,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_base_url()?;
        if !self.auth.refresh_path.starts_with('/') {
            return Err(ConfigError::InvalidRefreshPath(self.auth.refresh_path.clone()));
        }
        if self.cache.max_entries == Some(0) {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        self.retry.validate()?;
        Ok(())
    }

    /// Parse `base_url`. It must be an absolute http(s) URL with a host and without a
    /// query or fragment.
    pub fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: reason.to_string(),
        };
        let url = Url::parse(self.base_url.trim()).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        let has_host = url.host_str().is_some_and(|host| !host.is_empty());
        if url.cannot_be_a_base() || !has_host {
            return Err(invalid("must have a host"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("must not carry a query or fragment"));
        }
        Ok(url)
    }
}

/// Absolute URL for a normalized `path` and encoded `query` below `base`.
pub(crate) fn endpoint(base: &Url, path: &str, query: &str) -> String {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{path}"));
    url.set_query((!query.is_empty()).then_some(query));
    url.into()
}

/// Response cache sizing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Evict the oldest entry once this many are stored. `None` means unbounded.
    pub max_entries: Option<usize>,
}

/// Credential handling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Endpoint exchanging a refresh token for a new token pair.
    pub refresh_path: String,
    /// Header carrying the access token.
    pub header: String,
    /// Prefix placed before the token in `header`.
    pub scheme: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: "/auth/refresh".to_string(),
            header: "authorization".to_string(),
            scheme: "Bearer".to_string(),
        }
    }
}

/// Serde adapter for durations written as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
