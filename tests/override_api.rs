//! HTTP surface tests: wire formats, error bodies, auth, and the override
//! CRUD driven end to end against a served router.

use std::sync::Arc;

use serde_json::Value;
use serde_json::json;

use turnstile::cluster::membership::Membership;
use turnstile::cluster::rpc::PeerClient;
use turnstile::cluster::types::Member;
use turnstile::cluster::types::NodeId;
use turnstile::config::CacheConfig;
use turnstile::config::RatelimitConfig;
use turnstile::counter::CounterMap;
use turnstile::overrides::admin::OverrideAdmin;
use turnstile::overrides::resolver::OverrideResolver;
use turnstile::overrides::store::MemoryPrimaryStore;
use turnstile::ratelimit::batch::BatchFlusher;
use turnstile::ratelimit::breaker::BreakerConfig;
use turnstile::ratelimit::breaker::CircuitBreaker;
use turnstile::ratelimit::service::RatelimitService;
use turnstile::ratelimit::types::CoordinatorStats;
use turnstile::server::AppState;
use turnstile::server::StaticAuthorizer;
use turnstile::server::build_router;
use turnstile::time::SystemTimeProvider;
use turnstile::time::TimeProvider;

struct Api {
    base_url: String,
    client: reqwest::Client,
    _flusher: BatchFlusher,
}

impl Api {
    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> (u16, Value) {
        let mut request = self.client.post(format!("{}{path}", self.base_url)).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap();
        (status, body)
    }
}

async fn serve_api() -> Api {
    let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let member = Member {
        node_id: NodeId::new("api-test"),
        advertise_addr: "127.0.0.1".to_string(),
        rpc_port: 0,
        gossip_port: 0,
        joined_at_ms: 0,
    };
    let membership = Arc::new(Membership::new(member, 0));
    let store = Arc::new(MemoryPrimaryStore::new());
    let resolver = Arc::new(OverrideResolver::with_memory_cache(
        store.clone(),
        &CacheConfig::default(),
        time.clone(),
    ));
    let counters = Arc::new(CounterMap::new());
    let client = Arc::new(PeerClient::new(50));
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::from(&RatelimitConfig::default())));
    let stats = Arc::new(CoordinatorStats::default());
    let flusher = BatchFlusher::spawn(
        64,
        1 << 20,
        50,
        membership.clone(),
        client.clone(),
        counters.clone(),
        breaker.clone(),
        stats.clone(),
        time.clone(),
    );
    let service = Arc::new(RatelimitService::new(
        membership,
        counters,
        resolver.clone(),
        client,
        flusher.queue(),
        breaker,
        stats,
        time.clone(),
        String::new(),
    ));
    let state = AppState {
        service,
        admin: Arc::new(OverrideAdmin::new(store, resolver, time)),
        authorizer: Arc::new(StaticAuthorizer::from_entries(&["root_test=ws_1".to_string()])),
        node_id: "api-test".to_string(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, build_router(state)).await;
    });

    Api {
        base_url,
        client: reqwest::Client::new(),
        _flusher: flusher,
    }
}

fn limit_body(identifier: &str, limit: u64) -> Value {
    json!({
        "namespace": "email.send",
        "identifier": identifier,
        "limit": limit,
        "duration": 60_000,
    })
}

#[tokio::test]
async fn limit_response_carries_wire_exact_fields() {
    let api = serve_api().await;
    let (status, body) = api.post("/v1/ratelimit.limit", Some("root_test"), limit_body("user", 10)).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["limit"], json!(10));
    assert_eq!(body["remaining"], json!(9));
    assert!(body["reset"].as_u64().unwrap() > 0);
    assert_eq!(body["overrideId"], json!(""));
}

#[tokio::test]
async fn missing_credentials_yield_unauthorized_error_body() {
    let api = serve_api().await;
    let (status, body) = api.post("/v1/ratelimit.limit", None, limit_body("user", 10)).await;
    assert_eq!(status, 401);
    assert_eq!(body["code"], json!("UNAUTHORIZED"));
    assert!(body["docs_url"].as_str().unwrap().ends_with("/unauthorized"));
    assert!(body["request_id"].as_str().unwrap().starts_with("req_"));
    assert!(body.get("success").is_none(), "error bodies never carry success fields");
}

#[tokio::test]
async fn out_of_range_parameters_are_bad_requests() {
    let api = serve_api().await;

    let (status, body) = api
        .post(
            "/v1/ratelimit.limit",
            Some("root_test"),
            json!({"namespace": "n", "identifier": "i", "limit": 0, "duration": 60_000}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], json!("BAD_REQUEST"));

    let (status, _) = api
        .post(
            "/v1/ratelimit.limit",
            Some("root_test"),
            json!({"namespace": "n", "identifier": "i", "limit": 5, "duration": 999}),
        )
        .await;
    assert_eq!(status, 400);

    // Malformed JSON types are caught by the extractor, same taxonomy.
    let (status, body) = api
        .post(
            "/v1/ratelimit.limit",
            Some("root_test"),
            json!({"namespace": "n", "identifier": "i", "limit": "ten", "duration": 60_000}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], json!("BAD_REQUEST"));
}

#[tokio::test]
async fn wildcard_precedence_end_to_end() {
    let api = serve_api().await;

    let (status, _) = api
        .post(
            "/v1/ratelimit.setOverride",
            Some("root_test"),
            json!({
                "namespace": "email.send",
                "identifier": "*@acme.com",
                "limit": 100,
                "duration": 60_000,
            }),
        )
        .await;
    assert_eq!(status, 200);
    let (status, _) = api
        .post(
            "/v1/ratelimit.setOverride",
            Some("root_test"),
            json!({
                "namespace": "email.send",
                "identifier": "ceo@acme.com",
                "limit": 10,
                "duration": 60_000,
            }),
        )
        .await;
    assert_eq!(status, 200);

    // Exact literal beats the wildcard.
    let (_, body) = api
        .post("/v1/ratelimit.limit", Some("root_test"), limit_body("ceo@acme.com", 7))
        .await;
    assert_eq!(body["limit"], json!(10));
    assert_ne!(body["overrideId"], json!(""));

    // Wildcard applies to other addresses in the domain.
    let (_, body) = api
        .post("/v1/ratelimit.limit", Some("root_test"), limit_body("eng@acme.com", 7))
        .await;
    assert_eq!(body["limit"], json!(100));

    // Unmatched identifiers use the request defaults.
    let (_, body) = api
        .post("/v1/ratelimit.limit", Some("root_test"), limit_body("ceo@other.com", 7))
        .await;
    assert_eq!(body["limit"], json!(7));
    assert_eq!(body["overrideId"], json!(""));
}

#[tokio::test]
async fn override_crud_roundtrip() {
    let api = serve_api().await;

    let (status, created) = api
        .post(
            "/v1/ratelimit.setOverride",
            Some("root_test"),
            json!({
                "namespace": "api.calls",
                "identifier": "user_*",
                "limit": 50,
                "duration": 30_000,
                "async": true,
                "sharding": "edge",
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(created["identifier"], json!("user_*"));
    assert_eq!(created["limit"], json!(50));
    assert_eq!(created["async"], json!(true));
    assert_eq!(created["sharding"], json!("edge"));

    // get returns the same parameters.
    let (status, fetched) = api
        .post(
            "/v1/ratelimit.getOverride",
            Some("root_test"),
            json!({"namespace": "api.calls", "identifier": "user_*"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(fetched["overrideId"], created["overrideId"]);
    assert_eq!(fetched["duration"], json!(30_000));

    // Addressing by namespaceId works too.
    let (status, by_id) = api
        .post(
            "/v1/ratelimit.getOverride",
            Some("root_test"),
            json!({"namespaceId": created["namespaceId"], "identifier": "user_*"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(by_id["overrideId"], created["overrideId"]);

    // delete then get is NOT_FOUND.
    let (status, _) = api
        .post(
            "/v1/ratelimit.deleteOverride",
            Some("root_test"),
            json!({"namespace": "api.calls", "identifier": "user_*"}),
        )
        .await;
    assert_eq!(status, 200);
    let (status, body) = api
        .post(
            "/v1/ratelimit.getOverride",
            Some("root_test"),
            json!({"namespace": "api.calls", "identifier": "user_*"}),
        )
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn list_overrides_paginates_with_cursor() {
    let api = serve_api().await;
    for identifier in ["a", "b", "c", "d", "e"] {
        let (status, _) = api
            .post(
                "/v1/ratelimit.setOverride",
                Some("root_test"),
                json!({
                    "namespace": "pages",
                    "identifier": identifier,
                    "limit": 1,
                    "duration": 60_000,
                }),
            )
            .await;
        assert_eq!(status, 200);
    }

    let (status, page1) = api
        .post(
            "/v1/ratelimit.listOverrides",
            Some("root_test"),
            json!({"namespace": "pages", "limit": 2}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(page1["overrides"].as_array().unwrap().len(), 2);
    let cursor = page1["cursor"].as_str().unwrap().to_string();

    let (_, page2) = api
        .post(
            "/v1/ratelimit.listOverrides",
            Some("root_test"),
            json!({"namespace": "pages", "limit": 2, "cursor": cursor}),
        )
        .await;
    let identifiers: Vec<&str> = page2["overrides"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["identifier"].as_str().unwrap())
        .collect();
    assert_eq!(identifiers, ["c", "d"]);
}

#[tokio::test]
async fn unknown_namespace_is_not_found() {
    let api = serve_api().await;
    let (status, body) = api
        .post(
            "/v1/ratelimit.getOverride",
            Some("root_test"),
            json!({"namespace": "never-created", "identifier": "x"}),
        )
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn health_reports_node_and_counters() {
    let api = serve_api().await;
    let response = api.client.get(format!("{}/health", api.base_url)).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["node"], json!("api-test"));
}
