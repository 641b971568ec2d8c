mod common;

use common::{harness, ok, MockTransport, Reply};
use lifeline::{
    ApiClient, CancellationToken, ClientConfig, DispatchEvent, ErrorKind, Method, RequestConfig,
    TelemetrySink,
};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn concurrent_identical_requests_share_one_call() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(100));
    h.transport.script(Method::Get, "/pipelines/42/status", [ok(json!({"state": "running"}))]);

    let get = || h.client.get::<Value>("/pipelines/42/status", RequestConfig::new());
    let (a, b, c) = tokio::join!(get(), get(), get());

    assert_eq!(h.transport.total_calls(), 1);
    let a = a.unwrap();
    assert_eq!(a, b.unwrap());
    assert_eq!(a, c.unwrap());
    assert_eq!(h.client.in_flight(), 0);
    assert_eq!(h.sink.count(|e| matches!(e, DispatchEvent::Deduplicated { .. })), 2);
}

#[tokio::test(start_paused = true)]
async fn settled_call_is_not_reused() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(10));
    h.transport.script(Method::Get, "/pipelines/42/status", [ok(json!({"state": "running"}))]);

    let _: Value = h.client.get("/pipelines/42/status", RequestConfig::new()).await.unwrap();
    let _: Value = h.client.get("/pipelines/42/status", RequestConfig::new()).await.unwrap();
    assert_eq!(h.transport.total_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn identical_posts_are_deduplicated_too() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(50));
    h.transport.script(Method::Post, "/decisions", [ok(json!({"accepted": true}))]);

    let body = json!({"pipeline": 42, "action": "approve"});
    let post = || h.client.post::<Value, _>("/decisions", &body, RequestConfig::new());
    let (a, b) = tokio::join!(post(), post());

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.transport.total_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn different_bodies_are_different_requests() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(50));
    h.transport.script(Method::Post, "/decisions", [ok(json!({}))]);

    let body1 = json!({"id": 1});
    let body2 = json!({"id": 2});
    let (a, b) = tokio::join!(
        h.client.post::<Value, _>("/decisions", &body1, RequestConfig::new()),
        h.client.post::<Value, _>("/decisions", &body2, RequestConfig::new()),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.transport.total_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn dedupe_can_be_disabled() {
    let h = harness(ClientConfig { dedupe: false, ..Default::default() });
    h.transport.with_delay(Duration::from_millis(50));
    h.transport.script(Method::Get, "/files", [ok(json!([]))]);

    let get = || h.client.get::<Value>("/files", RequestConfig::new());
    let (a, b) = tokio::join!(get(), get());
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.transport.total_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelling_one_caller_leaves_the_others_attached() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(100));
    h.transport.script(Method::Get, "/pipelines", [ok(json!(["p1"]))]);

    let token = CancellationToken::new();
    let cached = RequestConfig::new().cache_ttl(Duration::from_secs(60));
    let cancelled = h.client.get::<Value>("/pipelines", cached.clone().cancel_with(token.clone()));
    let patient = h.client.get::<Value>("/pipelines", cached.clone());
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    };

    let (cancelled, patient, ()) = tokio::join!(cancelled, patient, trigger);
    assert_eq!(cancelled.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(patient.unwrap(), json!(["p1"]));
    assert_eq!(h.transport.total_calls(), 1);

    // The shared call still populated the cache, but a cancelled request is never served.
    assert_eq!(h.client.cached_entries(), 1);
    let again = h.client.get::<Value>("/pipelines", cached.cancel_with(token)).await;
    assert_eq!(again.unwrap_err().kind(), ErrorKind::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn sole_caller_cancelling_does_not_abort_the_call() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(100));
    h.transport.script(Method::Get, "/slow", [ok(json!(1))]);

    let token = CancellationToken::new();
    let request = h.client.get::<Value>("/slow", RequestConfig::new().cancel_with(token.clone()));
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(request, trigger);
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(h.client.in_flight(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.client.in_flight(), 0);
    assert_eq!(h.sink.count(|e| matches!(e, DispatchEvent::RequestSucceeded { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn anonymous_and_authenticated_calls_do_not_share() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(20));
    h.transport.handle(Method::Get, "/pipelines", |req| match req.bearer_token() {
        Some("fresh") => ok(json!(["private"])),
        _ => Reply::Status(401, json!({"error": {"code": "TOKEN_EXPIRED"}})),
    });
    h.transport.script(Method::Post, "/auth/refresh", [ok(json!({"access_token": "fresh"}))]);

    let (authed, anonymous) = tokio::join!(
        h.client.get::<Value>("/pipelines", RequestConfig::new()),
        h.client.get::<Value>("/pipelines", RequestConfig::new().without_auth()),
    );

    assert_eq!(authed.unwrap(), json!(["private"]));
    assert_eq!(anonymous.unwrap_err().kind(), ErrorKind::TokenExpired);
    assert_eq!(h.transport.calls(Method::Get, "/pipelines"), 3, "two first attempts plus one replay");
    assert_eq!(h.transport.calls(Method::Post, "/auth/refresh"), 1);
    let anonymous_sent = h.transport.requests().iter().filter(|r| r.bearer_token().is_none()).count();
    assert_eq!(anonymous_sent, 2, "anonymous GET and the refresh call");
    assert_eq!(h.sink.count(|e| matches!(e, DispatchEvent::Deduplicated { .. })), 0);
}

/// Sink that stalls on `Deduplicated` events.
#[derive(Clone)]
struct StallingSink;

impl tower::Service<DispatchEvent> for StallingSink {
    type Response = ();
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        Box::pin(async move {
            if matches!(event, DispatchEvent::Deduplicated { .. }) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        })
    }
}

impl TelemetrySink for StallingSink {
    type SinkError = Infallible;
}

#[tokio::test(start_paused = true)]
async fn slow_telemetry_does_not_split_a_shared_call() {
    let transport = MockTransport::new();
    transport.with_delay(Duration::from_millis(10));
    transport.script(Method::Get, "/pipelines", [ok(json!(["p1"]))]);
    let client = ApiClient::builder(transport.clone()).telemetry(StallingSink).build().unwrap();

    let get = || client.get::<Value>("/pipelines", RequestConfig::new());
    let (a, b) = tokio::join!(get(), get());

    assert_eq!(a.unwrap(), json!(["p1"]));
    assert_eq!(b.unwrap(), json!(["p1"]));
    assert_eq!(transport.total_calls(), 1);
}
