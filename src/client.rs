//! Request dispatcher.
//!
//! [`ApiClient`] is the single entry point feature code uses to talk to the backend. A
//! call flows through these stages:
//!
//! 1. cancellation check, then cache lookup for cacheable methods;
//! 2. attach to an identical in-flight call, or start one;
//! 3. attempt loop: send, classify failures, refresh-and-replay once on an auth
//!    failure, otherwise consult the retry policy and back off;
//! 4. on success populate the cache (and drop stale reads after a mutation) before any
//!    attached caller sees the value.
//!
//! ```rust,no_run
//! use lifeline::{ApiClient, ClientConfig, RequestConfig};
//! # use lifeline::transport::{Transport, TransportRequest, TransportResponse, TransportError};
//! # struct Http;
//! # #[async_trait::async_trait]
//! # impl Transport for Http {
//! #     async fn send(&self, _: TransportRequest) -> Result<TransportResponse, TransportError> {
//! #         Ok(TransportResponse::new(200, serde_json::json!({"state": "running"})))
//! #     }
//! # }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ApiClient::builder(Http)
//!     .config(ClientConfig::from_json(r#"{"base_url": "https://dashboard.example.com/api"}"#)?)
//!     .build()?;
//!
//! let status: serde_json::Value = client
//!     .get("/pipelines/{id}/status", RequestConfig::new().param("id", "42"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::auth::{RefreshContext, RefreshCoordinator};
use crate::cache::ResponseCache;
use crate::classify::{ErrorClassifier, RawFailure};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{self, ClientConfig};
use crate::credentials::{CredentialStore, InMemoryCredentialStore};
use crate::dedupe::InFlight;
use crate::error::{ConfigError, ErrorKind, ErrorRecord};
use crate::events::{ClientEvent, EventBus, SubscriptionId};
use crate::request::{Method, RequestConfig};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::signature::{self, RequestSignature};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{DispatchEvent, NullSink, Telemetry, TelemetrySink};
use crate::transport::{Transport, TransportRequest};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Builder for [`ApiClient`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    credentials: Option<Arc<dyn CredentialStore>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    telemetry: Option<Telemetry>,
}

impl ClientBuilder {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
            credentials: None,
            clock: None,
            sleeper: None,
            telemetry: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an empty [`InMemoryCredentialStore`].
    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Route dispatch events to `sink`. Defaults to [`NullSink`].
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.telemetry = Some(Telemetry::new(sink));
        self
    }

    /// Validate the configuration and assemble the client.
    pub fn build(self) -> Result<ApiClient, ConfigError> {
        self.config.validate()?;
        let base = self.config.parsed_base_url()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));
        let credentials =
            self.credentials.unwrap_or_else(|| Arc::new(InMemoryCredentialStore::new()));
        let telemetry = Arc::new(self.telemetry.unwrap_or_else(|| Telemetry::new(NullSink)));

        let retry = RetryPolicy::new(self.config.retry.clone(), Arc::clone(&clock))?;
        let classifier = ErrorClassifier::new(retry.retryable_statuses());
        let cache = Arc::new(ResponseCache::with_capacity(
            Arc::clone(&clock),
            self.config.cache.max_entries,
        ));
        let events = Arc::new(EventBus::new());

        let (refresh_path, _) = signature::normalize(&self.config.auth.refresh_path, &RequestConfig::new());
        let auth = RefreshCoordinator::new(RefreshContext {
            transport: Arc::clone(&self.transport),
            credentials: Arc::clone(&credentials),
            cache: Arc::clone(&cache),
            events: Arc::clone(&events),
            telemetry: Arc::clone(&telemetry),
            classifier: classifier.clone(),
            refresh_url: config::endpoint(&base, &refresh_path, ""),
        });

        tracing::debug!(base_url = %base, "api client built");
        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                base,
                transport: self.transport,
                credentials,
                clock,
                sleeper,
                cache,
                inflight: InFlight::new(),
                retry,
                classifier,
                auth,
                events,
                telemetry,
                refresh_path,
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder").field("config", &self.config).finish_non_exhaustive()
    }
}

/// Resilient API client. Cheap to clone; clones share cache, in-flight table, refresh
/// state and subscribers.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    base: Url,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    cache: Arc<ResponseCache<Value>>,
    inflight: InFlight<Value>,
    retry: RetryPolicy,
    classifier: ErrorClassifier,
    auth: RefreshCoordinator,
    events: Arc<EventBus>,
    telemetry: Arc<Telemetry>,
    /// Normalized refresh endpoint path.
    refresh_path: String,
}

/// One logical call, fixed before the first attempt.
type CallFuture = BoxFuture<'static, Result<Value, ErrorRecord>>;

struct Call {
    method: Method,
    signature: RequestSignature,
    url: String,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    cache_ttl: Duration,
    authenticated: bool,
    /// Cache epoch when the call was prepared; a later `clear` makes its write stale.
    epoch: u64,
}

impl ApiClient {
    pub fn builder<T: Transport>(transport: T) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    /// Execute a request and decode the body into `T`.
    ///
    /// Empty bodies decode as JSON `null`, so `T = ()` or `Option<_>` work for them. A body
    /// that does not match `T` yields `UNKNOWN_ERROR` with the decode error in `details`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        config: RequestConfig,
        body: Option<Value>,
    ) -> Result<T, ErrorRecord> {
        let value = self.dispatch(method, path, config, body).await?;
        serde_json::from_value(value).map_err(|err| {
            ErrorRecord::new(ErrorKind::UnknownError, "response body could not be decoded")
                .with_details(json!({ "error": err.to_string() }))
        })
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        config: RequestConfig,
    ) -> Result<T, ErrorRecord> {
        self.execute(Method::Get, path, config, None).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B, config: RequestConfig) -> Result<T, ErrorRecord>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = encode_body(body)?;
        self.execute(Method::Post, path, config, Some(body)).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B, config: RequestConfig) -> Result<T, ErrorRecord>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = encode_body(body)?;
        self.execute(Method::Put, path, config, Some(body)).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B, config: RequestConfig) -> Result<T, ErrorRecord>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = encode_body(body)?;
        self.execute(Method::Patch, path, config, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        config: RequestConfig,
    ) -> Result<T, ErrorRecord> {
        self.execute(Method::Delete, path, config, None).await
    }

    /// Clear credentials and cached responses, then publish [`ClientEvent::Logout`].
    pub fn logout(&self) {
        self.inner.credentials.clear();
        self.inner.cache.clear();
        tracing::info!("session logged out");
        self.inner.events.emit(ClientEvent::Logout);
    }

    /// Drop one cached response. Returns whether it was cached.
    pub fn invalidate(&self, signature: &RequestSignature) -> bool {
        self.inner.cache.invalidate(signature)
    }

    /// Drop the cached response for the call these arguments describe.
    pub fn invalidate_path(&self, method: Method, path: &str, config: &RequestConfig) -> bool {
        self.invalidate(&RequestSignature::new(method, path, config, None))
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ClientEvent>) {
        self.inner.events.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Cached responses, including expired ones not yet read.
    pub fn cached_entries(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.auth.is_refreshing()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        config: RequestConfig,
        body: Option<Value>,
    ) -> Result<Value, ErrorRecord> {
        if config.is_cancelled() {
            return Err(ErrorRecord::cancelled());
        }

        let inner = &self.inner;
        let call = inner.prepare(method, path, &config, body);

        let cache_ttl = call.cache_ttl;
        let signature = call.signature.clone();
        let epoch = call.epoch;
        if !cache_ttl.is_zero() {
            if let Some(hit) = inner.cache.get(&signature) {
                tracing::debug!(signature = %signature, "cache hit");
                inner.telemetry.emit(DispatchEvent::CacheHit { signature: signature.to_string() }).await;
                return Ok(hit);
            }
        }

        // Attach or start before the first telemetry await, so an identical call
        // arriving meanwhile finds this one in the table.
        let (pending, attached): (CallFuture, bool) = if inner.config.dedupe {
            let owner = Arc::clone(inner);
            let (pending, attached) = inner.inflight.join(signature.clone(), move || owner.run(call));
            (pending.boxed(), attached)
        } else {
            (Arc::clone(inner).run(call).boxed(), false)
        };
        if !cache_ttl.is_zero() {
            inner.telemetry.emit(DispatchEvent::CacheMiss { signature: signature.to_string() }).await;
        }
        if attached {
            inner.telemetry.emit(DispatchEvent::Deduplicated { signature: signature.to_string() }).await;
        }

        let result = match config.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!(path, "caller cancelled request");
                    return Err(ErrorRecord::cancelled());
                }
                result = pending => result,
            },
            None => pending.await,
        };

        // The owning call may have run with a shorter or zero TTL.
        if attached && !cache_ttl.is_zero() {
            if let Ok(value) = &result {
                inner.cache.fill_in_epoch(signature, value.clone(), cache_ttl, epoch);
            }
        }
        result
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.config.base_url)
            .field("in_flight", &self.in_flight())
            .field("cached_entries", &self.cached_entries())
            .field("auth", &self.inner.auth)
            .finish()
    }
}

impl ClientInner {
    fn prepare(&self, method: Method, path: &str, config: &RequestConfig, body: Option<Value>) -> Call {
        let signature = RequestSignature::new(method, path, config, body.as_ref());
        let (normalized, query) = signature::normalize(path, config);

        let url = crate::config::endpoint(&self.base, &normalized, &signature::encode_query(&query));

        let mut headers = config.headers.clone();
        if body.is_some() {
            headers.entry("content-type".to_string()).or_insert_with(|| "application/json".to_string());
        }

        let cache_ttl = if self.config.cacheable_methods.contains(&method) {
            config.cache_ttl.unwrap_or(self.config.default_cache_ttl)
        } else {
            Duration::ZERO
        };

        Call {
            method,
            signature,
            url,
            headers,
            body,
            cache_ttl,
            authenticated: !config.skip_auth && normalized != self.refresh_path,
            epoch: self.cache.epoch(),
        }
    }

    async fn run(self: Arc<Self>, call: Call) -> Result<Value, ErrorRecord> {
        let started = self.clock.now_millis();
        let mut retry = RetryState::start(call.method, self.clock.as_ref());
        let mut replayed = false;

        loop {
            let error = match self.attempt(&call).await {
                Ok(value) => {
                    self.store(&call, &value);
                    let duration = self.elapsed_since(started);
                    self.telemetry
                        .emit(DispatchEvent::RequestSucceeded { signature: call.signature.to_string(), duration })
                        .await;
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.kind().is_auth_failure() && call.authenticated && !replayed {
                replayed = true;
                tracing::debug!(signature = %call.signature, kind = %error.kind(), "auth failure; awaiting refresh");
                match self.auth.handle_auth_failure().await {
                    Ok(()) => {
                        self.telemetry
                            .emit(DispatchEvent::Replayed { signature: call.signature.to_string() })
                            .await;
                        continue;
                    }
                    Err(refresh_error) => return self.fail(&call, started, refresh_error).await,
                }
            }

            match self.retry.should_retry(&error, &retry) {
                RetryDecision::Retry { delay } => {
                    retry.advance();
                    tracing::debug!(
                        signature = %call.signature,
                        attempt = retry.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request"
                    );
                    self.telemetry
                        .emit(DispatchEvent::RetryScheduled {
                            signature: call.signature.to_string(),
                            attempt: retry.attempt,
                            delay,
                        })
                        .await;
                    self.sleeper.sleep(delay).await;
                }
                RetryDecision::Stop => {
                    if retry.attempt > 0 && error.retryable() {
                        tracing::warn!(signature = %call.signature, retries = retry.attempt, error = %error, "retries exhausted");
                    }
                    return self.fail(&call, started, error).await;
                }
            }
        }
    }

    async fn attempt(&self, call: &Call) -> Result<Value, ErrorRecord> {
        let mut headers = call.headers.clone();
        if call.authenticated {
            if let Some(token) = self.credentials.access_token() {
                let auth = &self.config.auth;
                let value = if auth.scheme.is_empty() { token } else { format!("{} {}", auth.scheme, token) };
                headers.insert(auth.header.to_ascii_lowercase(), value);
            }
        }

        let request = TransportRequest {
            method: call.method,
            url: call.url.clone(),
            headers,
            body: call.body.clone(),
        };
        match self.transport.send(request).await {
            Ok(response) if response.is_success() => Ok(response.body),
            Ok(response) => Err(self
                .classifier
                .classify(RawFailure::Status { status: response.status, body: response.body })),
            Err(err) => Err(self.classifier.classify(RawFailure::Transport(err))),
        }
    }

    fn store(&self, call: &Call, value: &Value) {
        if !call.cache_ttl.is_zero() {
            self.cache.set_in_epoch(call.signature.clone(), value.clone(), call.cache_ttl, call.epoch);
        }
        if call.method.is_mutation() && self.config.invalidate_on_mutation {
            let path = call.signature.path();
            let dropped = self.cache.invalidate_where(|sig| sig.path_starts_with(path));
            if dropped > 0 {
                tracing::debug!(path, dropped, "invalidated cached reads after mutation");
            }
        }
    }

    async fn fail(&self, call: &Call, started: u64, error: ErrorRecord) -> Result<Value, ErrorRecord> {
        let duration = self.elapsed_since(started);
        tracing::debug!(signature = %call.signature, error = %error, "request failed");
        self.telemetry
            .emit(DispatchEvent::RequestFailed { signature: call.signature.to_string(), kind: error.kind(), duration })
            .await;
        Err(error)
    }

    fn elapsed_since(&self, started: u64) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(started))
    }
}

fn encode_body<B: Serialize + ?Sized>(body: &B) -> Result<Value, ErrorRecord> {
    serde_json::to_value(body).map_err(|err| {
        ErrorRecord::new(ErrorKind::ValidationError, format!("request body could not be encoded: {err}"))
    })
}
