//! JSONL sink for `lifeline`. Writes one dispatch event per line.
//! Always appends; bring your own path.

use lifeline::telemetry::{DispatchEvent, TelemetrySink};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl tower_service::Service<DispatchEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(path = %path.display(), "wrote dispatch event");
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

fn event_to_json(event: &DispatchEvent) -> serde_json::Value {
    match event {
        DispatchEvent::CacheHit { signature } => json!({ "kind": "cache_hit", "signature": signature }),
        DispatchEvent::CacheMiss { signature } => json!({ "kind": "cache_miss", "signature": signature }),
        DispatchEvent::Deduplicated { signature } => {
            json!({ "kind": "deduplicated", "signature": signature })
        }
        DispatchEvent::RetryScheduled { signature, attempt, delay } => json!({
            "kind": "retry_scheduled",
            "signature": signature,
            "attempt": attempt,
            "delay_ms": delay.as_millis(),
        }),
        DispatchEvent::Replayed { signature } => json!({ "kind": "replayed", "signature": signature }),
        DispatchEvent::RefreshStarted => json!({ "kind": "refresh_started" }),
        DispatchEvent::RefreshSucceeded { waiters } => {
            json!({ "kind": "refresh_succeeded", "waiters": waiters })
        }
        DispatchEvent::RefreshFailed { waiters, kind } => {
            json!({ "kind": "refresh_failed", "waiters": waiters, "error": kind.code() })
        }
        DispatchEvent::RequestSucceeded { signature, duration } => json!({
            "kind": "request_success",
            "signature": signature,
            "duration_ms": duration.as_millis(),
        }),
        DispatchEvent::RequestFailed { signature, kind, duration } => json!({
            "kind": "request_failure",
            "signature": signature,
            "error": kind.code(),
            "duration_ms": duration.as_millis(),
        }),
    }
}
