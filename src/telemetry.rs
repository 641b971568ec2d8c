//! Telemetry for the client runtime.
//!
//! The dispatcher and the refresh coordinator describe what they do as [`DispatchEvent`]s.
//! Events flow into a `TelemetrySink`, which is a `tower::Service<DispatchEvent>`, so sinks
//! compose with ordinary tower combinators. Emission is best effort: a sink that is not
//! ready or fails never affects the request that produced the event.
//!
//! ```rust
//! use lifeline::telemetry::{DispatchEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(DispatchEvent::RefreshStarted).await.unwrap();
//! assert_eq!(sink.events(), vec![DispatchEvent::RefreshStarted]);
//! # }
//! ```

use crate::error::ErrorKind;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

/// Events emitted while executing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Served from the response cache without network activity.
    CacheHit { signature: String },
    CacheMiss { signature: String },
    /// Attached to an identical in-flight request.
    Deduplicated { signature: String },
    /// A retry is about to be made after `delay`.
    RetryScheduled { signature: String, attempt: usize, delay: Duration },
    /// An authenticated request was replayed after a refresh.
    Replayed { signature: String },
    RefreshStarted,
    RefreshSucceeded { waiters: usize },
    RefreshFailed { waiters: usize, kind: ErrorKind },
    RequestSucceeded { signature: String, duration: Duration },
    RequestFailed { signature: String, kind: ErrorKind, duration: Duration },
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::CacheHit { signature } => write!(f, "CacheHit({})", signature),
            DispatchEvent::CacheMiss { signature } => write!(f, "CacheMiss({})", signature),
            DispatchEvent::Deduplicated { signature } => write!(f, "Deduplicated({})", signature),
            DispatchEvent::RetryScheduled { signature, attempt, delay } => {
                write!(f, "RetryScheduled({}, #{}, delay={:?})", signature, attempt, delay)
            }
            DispatchEvent::Replayed { signature } => write!(f, "Replayed({})", signature),
            DispatchEvent::RefreshStarted => write!(f, "RefreshStarted"),
            DispatchEvent::RefreshSucceeded { waiters } => {
                write!(f, "RefreshSucceeded(waiters={})", waiters)
            }
            DispatchEvent::RefreshFailed { waiters, kind } => {
                write!(f, "RefreshFailed(waiters={}, kind={})", waiters, kind)
            }
            DispatchEvent::RequestSucceeded { signature, duration } => {
                write!(f, "RequestSucceeded({}, duration={:?})", signature, duration)
            }
            DispatchEvent::RequestFailed { signature, kind, duration } => {
                write!(f, "RequestFailed({}, kind={}, duration={:?})", signature, kind, duration)
            }
        }
    }
}

/// A telemetry sink that consumes dispatch events.
pub trait TelemetrySink:
    tower::Service<DispatchEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: DispatchEvent)
where
    S: tower::Service<DispatchEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DispatchEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DispatchEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events with `tracing` at DEBUG level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DispatchEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        tracing::debug!(event = %event, "dispatch_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Stores events in memory, evicting the oldest beyond `capacity`. Clones share storage.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<DispatchEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded at 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of stored events matching `predicate`.
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&DispatchEvent) -> bool,
    {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DispatchEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Adapts any sink into one that never fails; sink errors are logged and dropped.
#[derive(Clone, Debug)]
struct BestEffort<S> {
    inner: S,
}

impl<S> Service<DispatchEvent> for BestEffort<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        let sink = self.inner.clone();
        Box::pin(async move {
            if let Err(err) = sink.oneshot(event).await {
                tracing::debug!(error = %err, "telemetry sink failed");
            }
            Ok(())
        })
    }
}

/// Type-erased sink handle owned by a client.
pub(crate) struct Telemetry {
    sink: Mutex<BoxCloneService<DispatchEvent, (), Infallible>>,
}

impl Telemetry {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        Self { sink: Mutex::new(BoxCloneService::new(BestEffort { inner: sink })) }
    }

    pub(crate) async fn emit(&self, event: DispatchEvent) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        emit_best_effort(sink, event).await;
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").field("sink", &"<sink>").finish()
    }
}
