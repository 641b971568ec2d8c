mod common;

use common::{harness, ok};
use lifeline::{ClientConfig, DispatchEvent, Method, RequestConfig};
use serde_json::{json, Value};
use std::time::Duration;

fn cached(ms: u64) -> RequestConfig {
    RequestConfig::new().cache_ttl(Duration::from_millis(ms))
}

#[tokio::test]
async fn cached_value_is_served_until_ttl_elapses() {
    let h = harness(ClientConfig::default());
    h.transport.script(Method::Get, "/pipelines", [ok(json!([{"id": 1}]))]);

    let first: Value = h.client.get("/pipelines", cached(5000)).await.unwrap();
    assert_eq!(h.transport.total_calls(), 1);

    h.clock.advance(Duration::from_millis(2000));
    let second: Value = h.client.get("/pipelines", cached(5000)).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(h.transport.total_calls(), 1, "served from cache");

    h.clock.advance(Duration::from_millis(4000));
    let _: Value = h.client.get("/pipelines", cached(5000)).await.unwrap();
    assert_eq!(h.transport.total_calls(), 2, "expired entry triggers one fresh call");

    assert_eq!(h.sink.count(|e| matches!(e, DispatchEvent::CacheHit { .. })), 1);
}

#[tokio::test]
async fn default_ttl_applies_only_to_cacheable_methods() {
    let config = ClientConfig { default_cache_ttl: Duration::from_secs(30), ..Default::default() };
    let h = harness(config);
    h.transport.script(Method::Get, "/files", [ok(json!(["a.csv"]))]);
    h.transport.script(Method::Post, "/decisions", [ok(json!({"accepted": true}))]);

    for _ in 0..2 {
        let _: Value = h.client.get("/files", RequestConfig::new()).await.unwrap();
        let _: Value = h.client.post("/decisions", &json!({"id": 3}), RequestConfig::new()).await.unwrap();
    }
    assert_eq!(h.transport.calls(Method::Get, "/files"), 1);
    assert_eq!(h.transport.calls(Method::Post, "/decisions"), 2);
}

#[tokio::test]
async fn query_order_and_trace_headers_share_a_cache_entry() {
    let h = harness(ClientConfig::default());
    h.transport.script(Method::Get, "/monitoring", [ok(json!({"cpu": 0.4}))]);

    let _: Value = h
        .client
        .get("/monitoring?window=1h&host=a", cached(60_000).header("x-trace-id", "one"))
        .await
        .unwrap();
    let _: Value = h
        .client
        .get("/monitoring", cached(60_000).query("host", "a").query("window", "1h").header("x-trace-id", "two"))
        .await
        .unwrap();

    assert_eq!(h.transport.total_calls(), 1);
}

#[tokio::test]
async fn successful_mutation_invalidates_cached_reads_of_the_path() {
    let h = harness(ClientConfig::default());
    h.transport.script(Method::Get, "/pipelines/7", [ok(json!({"state": "idle"}))]);
    h.transport.script(Method::Put, "/pipelines/7", [ok(Value::Null)]);

    let _: Value = h.client.get("/pipelines/7", cached(60_000)).await.unwrap();
    assert_eq!(h.client.cached_entries(), 1);

    let _: () = h.client.put("/pipelines/7", &json!({"state": "running"}), RequestConfig::new()).await.unwrap();
    assert_eq!(h.client.cached_entries(), 0);

    let _: Value = h.client.get("/pipelines/7", cached(60_000)).await.unwrap();
    assert_eq!(h.transport.calls(Method::Get, "/pipelines/7"), 2);
}

#[tokio::test]
async fn mutation_invalidation_can_be_disabled() {
    let config = ClientConfig { invalidate_on_mutation: false, ..Default::default() };
    let h = harness(config);
    h.transport.script(Method::Get, "/pipelines/7", [ok(json!({}))]);
    h.transport.script(Method::Delete, "/pipelines/7", [ok(Value::Null)]);

    let _: Value = h.client.get("/pipelines/7", cached(60_000)).await.unwrap();
    let _: () = h.client.delete("/pipelines/7", RequestConfig::new()).await.unwrap();
    assert_eq!(h.client.cached_entries(), 1);
}

#[tokio::test]
async fn bounded_cache_evicts_oldest_entry() {
    let mut config = ClientConfig::default();
    config.cache.max_entries = Some(2);
    let h = harness(config);
    for path in ["/a", "/b", "/c"] {
        h.transport.script(Method::Get, path, [ok(json!(path))]);
        let _: Value = h.client.get(path, cached(60_000)).await.unwrap();
    }
    assert_eq!(h.client.cached_entries(), 2);

    let _: Value = h.client.get("/a", cached(60_000)).await.unwrap();
    assert_eq!(h.transport.calls(Method::Get, "/a"), 2);
    let _: Value = h.client.get("/c", cached(60_000)).await.unwrap();
    assert_eq!(h.transport.calls(Method::Get, "/c"), 1);
}

#[tokio::test]
async fn explicit_invalidation_and_clear() {
    let h = harness(ClientConfig::default());
    h.transport.script(Method::Get, "/files", [ok(json!([]))]);
    h.transport.script(Method::Get, "/recommendations", [ok(json!([]))]);

    let _: Value = h.client.get("/files", cached(60_000)).await.unwrap();
    let _: Value = h.client.get("/recommendations", cached(60_000)).await.unwrap();

    assert!(h.client.invalidate_path(Method::Get, "/files", &RequestConfig::new()));
    assert!(!h.client.invalidate_path(Method::Get, "/files", &RequestConfig::new()));
    assert_eq!(h.client.cached_entries(), 1);

    h.client.clear_cache();
    assert_eq!(h.client.cached_entries(), 0);
}

#[tokio::test]
async fn failures_are_never_cached() {
    let h = harness(ClientConfig { retry: lifeline::RetryConfig::disabled(), ..Default::default() });
    h.transport.script(
        Method::Get,
        "/files",
        [common::Reply::Status(500, json!({"message": "boom"})), ok(json!(["x"]))],
    );

    assert!(h.client.get::<Value>("/files", cached(60_000)).await.is_err());
    let value: Value = h.client.get("/files", cached(60_000)).await.unwrap();
    assert_eq!(value, json!(["x"]));
}

#[tokio::test(start_paused = true)]
async fn response_landing_after_logout_is_not_cached() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(100));
    h.transport.script(Method::Get, "/pipelines", [ok(json!(["p1"]))]);

    let logout = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.client.logout();
    };
    let (value, ()) = tokio::join!(h.client.get::<Value>("/pipelines", cached(60_000)), logout);

    assert_eq!(value.unwrap(), json!(["p1"]));
    assert_eq!(h.client.cached_entries(), 0);
    let _: Value = h.client.get("/pipelines", cached(60_000)).await.unwrap();
    assert_eq!(h.transport.total_calls(), 2, "the next read goes to the backend");
}

#[tokio::test(start_paused = true)]
async fn response_landing_after_failed_refresh_is_not_cached() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(100));
    h.transport.script(Method::Get, "/pipelines", [ok(json!(["p1"]))]);
    h.transport.script(
        Method::Get,
        "/private",
        [common::Reply::Status(401, json!({"error": {"code": "TOKEN_EXPIRED"}}))],
    );
    h.transport.script(
        Method::Post,
        "/auth/refresh",
        [common::Reply::Status(401, json!({"message": "refresh token revoked"}))],
    );

    // The read starts while the refresh is running and lands after it failed.
    let late_read = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.client.get::<Value>("/pipelines", cached(60_000)).await
    };
    let (private, read) = tokio::join!(h.client.get::<Value>("/private", RequestConfig::new()), late_read);

    assert!(private.is_err());
    assert_eq!(read.unwrap(), json!(["p1"]));
    assert_eq!(h.store.clears(), 1);
    assert_eq!(h.client.cached_entries(), 0);
}

#[tokio::test(start_paused = true)]
async fn attached_caller_with_a_ttl_fills_the_cache() {
    let h = harness(ClientConfig::default());
    h.transport.with_delay(Duration::from_millis(50));
    h.transport.script(Method::Get, "/pipelines", [ok(json!(["p1"]))]);

    let (owner, attached) = tokio::join!(
        h.client.get::<Value>("/pipelines", RequestConfig::new()),
        h.client.get::<Value>("/pipelines", cached(60_000)),
    );
    assert_eq!(owner.unwrap(), attached.unwrap());
    assert_eq!(h.transport.total_calls(), 1);
    assert_eq!(h.client.cached_entries(), 1);

    let again: Value = h.client.get("/pipelines", cached(60_000)).await.unwrap();
    assert_eq!(again, json!(["p1"]));
    assert_eq!(h.transport.total_calls(), 1, "served from the attached caller's entry");
}
