//! In-flight request deduplication (single-flight per signature).
//!
//! The first caller for a signature starts the call as a spawned task and stores a
//! shared handle to it; later callers with the same signature attach to that handle.
//! The task removes its own table entry as the last step of its work, so by the time
//! any attached caller sees the result, a fresh call for the same signature starts a
//! new transport call instead of joining the settled one.
//!
//! Because the work runs on its own task, a caller that stops waiting only drops its
//! handle. The call, and every other attached caller, carries on. Requires a tokio
//! runtime.

use crate::error::{ErrorKind, ErrorRecord};
use crate::signature::RequestSignature;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared handle to a pending call.
pub type PendingRequest<T> = Shared<BoxFuture<'static, Result<T, ErrorRecord>>>;

type CallTable<T> = Arc<Mutex<HashMap<RequestSignature, PendingRequest<T>>>>;

/// Table of pending calls keyed by signature.
#[derive(Debug)]
pub struct InFlight<T> {
    calls: CallTable<T>,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self { calls: Arc::new(Mutex::new(HashMap::new())) }
    }
}

fn lock<T>(calls: &CallTable<T>) -> MutexGuard<'_, HashMap<RequestSignature, PendingRequest<T>>> {
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the pending call for `signature`, or start one with `factory`.
    pub fn dedupe<F, Fut>(&self, signature: RequestSignature, factory: F) -> PendingRequest<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ErrorRecord>> + Send + 'static,
    {
        self.join(signature, factory).0
    }

    /// Like [`dedupe`](Self::dedupe), also reporting whether the caller attached to an
    /// existing call (`true`) or started a new one.
    pub fn join<F, Fut>(&self, signature: RequestSignature, factory: F) -> (PendingRequest<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ErrorRecord>> + Send + 'static,
    {
        let mut calls = lock(&self.calls);
        if let Some(pending) = calls.get(&signature) {
            tracing::debug!(signature = %signature, "attached to in-flight request");
            return (pending.clone(), true);
        }

        let table = Arc::clone(&self.calls);
        let key = signature.clone();
        let work = factory();
        let task = tokio::spawn(async move {
            let result = work.await;
            lock(&table).remove(&key);
            result
        });
        let pending = async move {
            task.await.unwrap_or_else(|err| {
                Err(ErrorRecord::new(
                    ErrorKind::UnknownError,
                    format!("request task failed: {err}"),
                ))
            })
        }
        .boxed()
        .shared();

        calls.insert(signature, pending.clone());
        (pending, false)
    }

    /// Number of calls currently pending.
    pub fn len(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, signature: &RequestSignature) -> bool {
        lock(&self.calls).contains_key(signature)
    }
}
