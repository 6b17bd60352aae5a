//! End-to-end run against the live mock server.
//!
//! # Design
//! Starts the mock server on a random port, then drives the client over real
//! HTTP through `UreqTransport`. Server-side hit counts (`/_hits`) tell us
//! which calls actually reached the network.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use api_client_core::{
    params, ApiClient, ClientConfig, ErrorCategory, Params, Registry, RequestOptions, RetryPolicy,
    TokenSource, UreqTransport,
};
use serde_json::{json, Value};

const REGISTRY: &str = r#"{
    "issues": {
        "endpoints": {
            "list":   { "path": "/issues", "method": "GET" },
            "detail": { "path": "/issues/{id}", "method": "GET" },
            "create": { "path": "/issues", "method": "POST" },
            "update": { "path": "/issues/{id}", "method": "PATCH" }
        }
    },
    "ops": {
        "endpoints": {
            "unstable": { "path": "/unstable/{name}", "method": "GET" },
            "private":  { "path": "/private", "method": "GET", "requiresAuth": true }
        }
    }
}"#;

struct Token;

impl TokenSource for Token {
    fn token(&self) -> Option<String> {
        Some("integration".to_string())
    }
}

fn start_server() -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });

    addr
}

fn client(addr: SocketAddr) -> ApiClient {
    let config = ClientConfig::new(&format!("http://{addr}"))
        .with_retry(RetryPolicy::default().with_base_delay(Duration::from_millis(5)))
        .with_request_timeout(Some(Duration::from_secs(5)));
    let registry = Registry::from_json(REGISTRY).unwrap();
    let transport = Arc::new(UreqTransport::from_config(&config));
    ApiClient::new(config, registry, transport).with_token_source(Arc::new(Token))
}

async fn hits(client: &ApiClient) -> HashMap<String, u64> {
    let value = client
        .get("/_hits", &Params::new(), RequestOptions::new().bypass_cache())
        .await
        .unwrap();
    serde_json::from_value(value).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_and_revalidated_reads() {
    let client = client(start_server());

    let created = client
        .call_endpoint(
            "issues",
            "create",
            &Params::new(),
            &Params::new(),
            Some(&json!({ "title": "Flaky build" })),
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(created["state"], "open");
    let id = params([("id", created["id"].to_string())]);

    // First read reaches the server, second is served from the cache.
    let first = client
        .call_endpoint("issues", "detail", &id, &Params::new(), None, RequestOptions::new())
        .await
        .unwrap();
    let second = client
        .call_endpoint("issues", "detail", &id, &Params::new(), None, RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(hits(&client).await["/issues/1"], 1);

    // Bypassing the cache revalidates with the stored ETag and gets a 304.
    let revalidated = client
        .call_endpoint("issues", "detail", &id, &Params::new(), None, RequestOptions::new().bypass_cache())
        .await
        .unwrap();
    assert_eq!(revalidated, first);
    assert_eq!(hits(&client).await["/issues/1"], 2);

    let stats = client.cache_stats();
    let entry = &stats.entries["/issues/1"];
    assert!(entry.has_etag);
    // max-age from the server wins over the default TTL.
    assert_eq!(entry.ttl_ms, 60_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn mutation_invalidates_cached_read() {
    let client = client(start_server());
    client
        .post("/issues", Some(&json!({ "title": "Docs" })), RequestOptions::new())
        .await
        .unwrap();

    let before = client.get("/issues/1", &Params::new(), RequestOptions::new()).await.unwrap();
    assert_eq!(before["state"], "open");

    let id = params([("id", "1")]);
    client
        .call_endpoint(
            "issues",
            "update",
            &id,
            &Params::new(),
            Some(&json!({ "state": "closed" })),
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert!(client.cache_stats().entries.get("/issues/1").is_none());

    let after = client.get("/issues/1", &Params::new(), RequestOptions::new()).await.unwrap();
    assert_eq!(after["state"], "closed");
    assert_eq!(hits(&client).await["/issues/1"], 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried() {
    let client = client(start_server());
    let name = params([("name", "search")]);
    let query = params([("fail", "2"), ("status", "503")]);

    let value = client
        .call_endpoint("ops", "unstable", &name, &query, None, RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(value, json!({ "name": "search", "attempts": 3 }));
    assert_eq!(hits(&client).await["/unstable/search"], 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_surface_server_error() {
    let client = client(start_server());
    let err = client
        .get(
            "/unstable/index",
            &params([("fail", "10"), ("status", "502")]),
            RequestOptions::new().with_max_retries(1),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Server);
    assert_eq!(err.status, Some(502));
    assert!(err.retryable);
    assert_eq!(err.message, "index is unavailable");
    assert_eq!(hits(&client).await["/unstable/index"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_errors_are_classified_and_not_retried() {
    let client = client(start_server());

    let err = client
        .post("/issues", Some(&json!({ "title": "" })), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Validation);
    assert_eq!(err.status, Some(422));
    assert_eq!(err.message, "title must not be empty");

    let err = client
        .get("/issues/404", &Params::new(), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Client);
    assert_eq!(err.message, "no such issue");
    assert!(!err.retryable);

    let err = client
        .get("/private", &Params::new(), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Auth);
    assert_eq!(err.metadata["body"], json!({ "error": "unauthorized" }));

    let hits = hits(&client).await;
    assert_eq!(hits["/issues"], 1);
    assert_eq!(hits["/issues/404"], 1);
    assert_eq!(hits["/private"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_endpoint_sends_bearer_token() {
    let client = client(start_server());
    let value: Value = client
        .call_endpoint("ops", "private", &Params::new(), &Params::new(), None, RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(value, json!({ "secret": true }));
}

#[tokio::test(flavor = "multi_thread")]
async fn per_attempt_timeout_is_enforced() {
    let client = client(start_server());
    let err = client
        .get(
            "/slow/2000",
            &Params::new(),
            RequestOptions::new()
                .with_timeout(Duration::from_millis(100))
                .with_max_retries(0),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Network);
    assert_eq!(err.metadata["timeout"], json!(true));
}
