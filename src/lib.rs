#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # lifeline
//!
//! A resilient API client runtime. Every backend call a dashboard makes goes through one
//! [`ApiClient`], which takes care of the failure modes feature code should not have to:
//!
//! - **Single-flight token refresh**: many requests hitting an expired token at once
//!   trigger one refresh, then replay with the new credential
//! - **In-flight deduplication**: concurrent identical requests share one transport call
//! - **TTL response cache** with lazy expiry and an optional size bound
//! - **Bounded retries** with exponential backoff and optional jitter
//! - **Normalized errors**: every failure is an [`ErrorRecord`] with a stable [`ErrorKind`]
//!
//! The HTTP layer and token storage are collaborators behind the [`Transport`] and
//! [`CredentialStore`] traits.
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeline::{ApiClient, ClientConfig, RequestConfig};
//! use lifeline::transport::{Transport, TransportError, TransportRequest, TransportResponse};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! struct Backend;
//!
//! #[async_trait::async_trait]
//! impl Transport for Backend {
//!     async fn send(&self, _req: TransportRequest) -> Result<TransportResponse, TransportError> {
//!         Ok(TransportResponse::new(200, json!({"id": 42, "state": "running"})))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = ApiClient::builder(Backend)
//!         .config(ClientConfig { default_cache_ttl: Duration::from_secs(5), ..Default::default() })
//!         .build()
//!         .unwrap();
//!
//!     let status: serde_json::Value = client
//!         .get("/pipelines/:id/status", RequestConfig::new().param("id", "42"))
//!         .await
//!         .unwrap();
//!     assert_eq!(status["state"], "running");
//!     assert_eq!(client.cached_entries(), 1);
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod cache;
pub mod classify;
pub mod client;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod dedupe;
pub mod error;
pub mod events;
pub mod jitter;
pub mod request;
pub mod retry;
pub mod signature;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use auth::RefreshCoordinator;
pub use backoff::Backoff;
pub use cache::ResponseCache;
pub use classify::{ErrorClassifier, RawFailure, RetryableStatuses};
pub use client::{ApiClient, ClientBuilder};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AuthConfig, CacheConfig, ClientConfig};
pub use credentials::{CredentialStore, InMemoryCredentialStore, TokenPair};
pub use dedupe::{InFlight, PendingRequest};
pub use error::{ConfigError, ErrorKind, ErrorRecord};
pub use events::{ClientEvent, EventBus, SubscriptionId};
pub use jitter::Jitter;
pub use request::{Method, RequestConfig};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy, RetryState};
pub use signature::RequestSignature;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{DispatchEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use tokio_util::sync::CancellationToken;
pub use transport::{Transport, TransportError, TransportRequest, TransportResponse};
