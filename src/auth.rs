//! Single-flight token refresh.
//!
//! Any number of requests can fail with an expired token at the same moment. Each of them
//! calls [`RefreshCoordinator::handle_auth_failure`]; the first one starts the refresh,
//! every later one queues a waiter, and all of them observe the one outcome.
//!
//! Two critical sections carry the whole protocol, both under the same mutex and neither
//! containing an `.await`:
//!
//! - register-or-start: push a waiter, then either flip `is_refreshing` on (and spawn the
//!   refresh) or leave it alone because a refresh is already running;
//! - drain-and-flip: take every waiter and flip `is_refreshing` off.
//!
//! A waiter registered before the drain is settled by it; one registered after starts the
//! next refresh. The refresh itself runs on a spawned task, so a caller that gives up
//! waiting cannot strand the others.

use crate::cache::ResponseCache;
use crate::classify::{ErrorClassifier, RawFailure};
use crate::credentials::{CredentialStore, TokenPair};
use crate::error::{ErrorKind, ErrorRecord};
use crate::events::{ClientEvent, EventBus};
use crate::request::Method;
use crate::telemetry::{DispatchEvent, Telemetry};
use crate::transport::{Transport, TransportRequest};
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

type RefreshWaiter = oneshot::Sender<Result<(), ErrorRecord>>;

#[derive(Default)]
struct AuthState {
    is_refreshing: bool,
    waiters: Vec<RefreshWaiter>,
}

/// Everything the refresh task needs. Built once per client.
pub(crate) struct RefreshContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) cache: Arc<ResponseCache<Value>>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) telemetry: Arc<Telemetry>,
    pub(crate) classifier: ErrorClassifier,
    /// Absolute URL of the refresh endpoint.
    pub(crate) refresh_url: String,
}

struct Inner {
    state: Mutex<AuthState>,
    ctx: RefreshContext,
    refreshes: AtomicU64,
}

/// Coordinates token renewal for one client.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub(crate) fn new(ctx: RefreshContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(AuthState::default()),
                ctx,
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a refreshed credential, starting the refresh if none is running.
    ///
    /// Resolves `Ok(())` once the new token pair is stored. On failure every caller in
    /// the same window receives the same [`ErrorRecord`].
    pub async fn handle_auth_failure(&self) -> Result<(), ErrorRecord> {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut state = self.inner.lock();
            state.waiters.push(tx);
            !std::mem::replace(&mut state.is_refreshing, true)
        };

        if start {
            tracing::info!("starting token refresh");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.run());
        } else {
            tracing::debug!("waiting on in-progress token refresh");
        }

        rx.await.unwrap_or_else(|_| {
            Err(ErrorRecord::new(ErrorKind::UnknownError, "token refresh ended without a result"))
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.lock().is_refreshing
    }

    /// Requests currently queued behind a refresh.
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Refresh calls started over the coordinator's lifetime.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("is_refreshing", &self.is_refreshing())
            .field("refresh_url", &self.inner.ctx.refresh_url)
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.ctx.telemetry.emit(DispatchEvent::RefreshStarted).await;

        let outcome = AssertUnwindSafe(self.request_tokens())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ErrorRecord::new(ErrorKind::UnknownError, "token refresh task panicked"))
            });

        match &outcome {
            Ok(pair) => {
                self.ctx.credentials.set_tokens(pair.access_token.clone(), pair.refresh_token.clone());
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed; clearing session");
                self.ctx.credentials.clear();
                self.ctx.cache.clear();
                self.ctx.events.emit(ClientEvent::SessionExpired);
            }
        }

        let waiters = {
            let mut state = self.lock();
            state.is_refreshing = false;
            std::mem::take(&mut state.waiters)
        };
        let count = waiters.len();

        match outcome {
            Ok(_) => {
                tracing::info!(waiters = count, "token refresh succeeded");
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.ctx.telemetry.emit(DispatchEvent::RefreshSucceeded { waiters: count }).await;
            }
            Err(err) => {
                let kind = err.kind();
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                self.ctx.telemetry.emit(DispatchEvent::RefreshFailed { waiters: count, kind }).await;
            }
        }
    }

    async fn request_tokens(&self) -> Result<TokenPair, ErrorRecord> {
        let refresh_token = self
            .ctx
            .credentials
            .refresh_token()
            .ok_or_else(|| ErrorRecord::new(ErrorKind::Unauthorized, "no refresh token available"))?;

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let request = TransportRequest {
            method: Method::Post,
            url: self.ctx.refresh_url.clone(),
            headers,
            body: Some(json!({ "refresh_token": refresh_token })),
        };

        let response = self
            .ctx
            .transport
            .send(request)
            .await
            .map_err(|err| self.ctx.classifier.classify(RawFailure::Transport(err)))?;
        if !response.is_success() {
            return Err(self
                .ctx
                .classifier
                .classify(RawFailure::Status { status: response.status, body: response.body }));
        }

        let mut pair = parse_token_pair(&response.body).ok_or_else(|| {
            ErrorRecord::new(ErrorKind::UnknownError, "refresh response did not contain an access token")
                .with_status(response.status)
        })?;
        if pair.refresh_token.is_none() {
            pair.refresh_token = Some(refresh_token);
        }
        Ok(pair)
    }
}

/// Accepts snake or camel case keys, at the top level or under `data`.
fn parse_token_pair(body: &Value) -> Option<TokenPair> {
    let root = body.get("data").filter(|d| d.is_object()).unwrap_or(body);
    let field = |snake: &str, camel: &str| -> Option<String> {
        root.get(snake)
            .or_else(|| root.get(camel))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };
    let access_token = field("access_token", "accessToken")?;
    Some(TokenPair::new(access_token, field("refresh_token", "refreshToken")))
}
