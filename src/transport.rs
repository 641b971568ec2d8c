//! HTTP transport collaborator.
//!
//! The runtime never speaks HTTP itself; it hands a [`TransportRequest`] to an injected
//! [`Transport`] and gets back either a response (any status) or a [`TransportError`] when
//! no response was received. Bodies are JSON values; an empty body is `Value::Null`.
//!
//! With the `reqwest` feature, [`ReqwestTransport`] provides a ready-made implementation.

use crate::request::Method;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Outgoing request handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    /// Absolute URL including the encoded query string.
    pub url: String,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl TransportRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Bearer token carried by this request, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization").and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// Response received from the server, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

impl TransportResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, headers: BTreeMap::new(), body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure before any response arrived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Other(String),
}

/// Asynchronous HTTP call primitive.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use super::*;
    use std::time::Duration;

    /// `reqwest`-backed transport.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        /// Build a transport with a per-request timeout.
        pub fn new(timeout: Duration) -> Result<Self, TransportError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportError::Other(e.to_string()))?;
            Ok(Self { client })
        }

        /// Wrap an existing client.
        pub fn from_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    fn to_reqwest(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            let mut builder = self.client.request(to_reqwest(request.method), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else if e.is_connect() {
                    TransportError::Connect(e.to_string())
                } else {
                    TransportError::Other(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
                })
                .collect();
            let text = response.text().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Other(e.to_string())
                }
            })?;
            let body = if text.trim().is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
            };
            Ok(TransportResponse { status, headers, body })
        }
    }
}
