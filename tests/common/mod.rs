#![allow(dead_code)]

use async_trait::async_trait;
use lifeline::{
    ApiClient, ClientConfig, CredentialStore, InMemoryCredentialStore, ManualClock, MemorySink,
    Method, TokenPair, TrackingSleeper, Transport, TransportError, TransportRequest,
    TransportResponse,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A scripted reply.
#[derive(Clone, Debug)]
pub enum Reply {
    Status(u16, Value),
    Error(TransportError),
}

pub fn ok(body: Value) -> Reply {
    Reply::Status(200, body)
}

pub type Handler = Arc<dyn Fn(&TransportRequest) -> Reply + Send + Sync>;

enum Route {
    /// Replies in order; the last one repeats.
    Queue(VecDeque<Reply>),
    Handler(Handler),
}

#[derive(Default)]
struct MockState {
    routes: Mutex<HashMap<(Method, String), Route>>,
    requests: Mutex<Vec<TransportRequest>>,
    delay: Mutex<Option<Duration>>,
}

/// Scripted transport keyed by method and path. Clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for `method path`.
    pub fn script(&self, method: Method, path: &str, replies: impl IntoIterator<Item = Reply>) -> &Self {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert((method, path.to_string()), Route::Queue(replies.into_iter().collect()));
        self
    }

    pub fn handle<F>(&self, method: Method, path: &str, handler: F) -> &Self
    where
        F: Fn(&TransportRequest) -> Reply + Send + Sync + 'static,
    {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert((method, path.to_string()), Route::Handler(Arc::new(handler)));
        self
    }

    /// Every call waits this long (on the tokio timer) before replying.
    pub fn with_delay(&self, delay: Duration) -> &Self {
        *self.state.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn calls(&self, method: Method, path: &str) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && path_of(&r.url) == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    fn reply_for(&self, request: &TransportRequest) -> Reply {
        let key = (request.method, path_of(&request.url).to_string());
        let mut routes = self.state.routes.lock().unwrap();
        match routes.get_mut(&key) {
            Some(Route::Queue(queue)) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(Route::Queue(queue)) => queue.front().cloned().unwrap_or(Reply::Status(404, Value::Null)),
            Some(Route::Handler(handler)) => {
                let handler = Arc::clone(handler);
                drop(routes);
                handler(request)
            }
            None => Reply::Status(404, serde_json::json!({"message": "no route"})),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.state.requests.lock().unwrap().push(request.clone());
        let delay = *self.state.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.reply_for(&request) {
            Reply::Status(status, body) => Ok(TransportResponse::new(status, body)),
            Reply::Error(err) => Err(err),
        }
    }
}

/// Path portion of an absolute URL, without query.
pub fn path_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
    path.split('?').next().unwrap_or(path)
}

/// Credential store that counts `clear` calls.
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: InMemoryCredentialStore,
    clears: AtomicUsize,
}

impl CountingStore {
    pub fn with_tokens(access: &str, refresh: Option<&str>) -> Self {
        Self {
            inner: InMemoryCredentialStore::with_tokens(TokenPair::new(access, refresh.map(str::to_owned))),
            clears: AtomicUsize::new(0),
        }
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl CredentialStore for CountingStore {
    fn access_token(&self) -> Option<String> {
        self.inner.access_token()
    }

    fn refresh_token(&self) -> Option<String> {
        self.inner.refresh_token()
    }

    fn set_tokens(&self, access_token: String, refresh_token: Option<String>) {
        self.inner.set_tokens(access_token, refresh_token)
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear()
    }
}

pub struct Harness {
    pub client: ApiClient,
    pub transport: MockTransport,
    pub clock: ManualClock,
    pub sleeper: Arc<TrackingSleeper>,
    pub store: Arc<CountingStore>,
    pub sink: MemorySink,
}

pub fn harness(config: ClientConfig) -> Harness {
    harness_with_store(config, CountingStore::with_tokens("stale", Some("refresh-1")))
}

pub fn harness_with_store(config: ClientConfig, store: CountingStore) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = MockTransport::new();
    let clock = ManualClock::new();
    let sleeper = Arc::new(TrackingSleeper::new());
    let store = Arc::new(store);
    let sink = MemorySink::new();
    let client = ApiClient::builder(transport.clone())
        .config(config)
        .credentials(store.clone())
        .clock(Arc::new(clock.clone()))
        .sleeper(sleeper.clone())
        .telemetry(sink.clone())
        .build()
        .expect("valid config");
    Harness { client, transport, clock, sleeper, store, sink }
}
