//! End-to-end window behavior on a single node, on a manual clock pinned to
//! a window boundary so every expectation is exact.

mod common;

use common::EPOCH_MS;
use common::TestCluster;
use turnstile::time::TimeProvider;

#[tokio::test]
async fn burst_within_one_window() {
    let cluster = TestCluster::spawn(1).await;
    let node = &cluster.nodes[0];

    let mut expected_remaining = (0..10u64).rev();
    for call in 0..12 {
        let response = node.limit("burst", 10, 60_000, 1, false).await.unwrap();
        cluster.time.advance(80); // 12 calls spread inside one second

        if call < 10 {
            assert!(response.success, "call {call} should pass");
            assert_eq!(response.remaining, expected_remaining.next().unwrap());
        } else {
            assert!(!response.success, "call {call} should be denied");
            assert_eq!(response.remaining, 0);
        }
        // Reset lands at the end of the current window.
        let now = cluster.time.now_unix_ms();
        assert!(response.reset_at_ms > now);
        assert!(response.reset_at_ms <= EPOCH_MS + 60_000);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn sliding_edge_decays_previous_window() {
    let cluster = TestCluster::spawn(1).await;
    let node = &cluster.nodes[0];

    // Fill the first one-second window completely.
    for _ in 0..10 {
        assert!(node.limit("edge", 10, 1_000, 1, false).await.unwrap().success);
    }
    // Same window, half elapsed: still full.
    cluster.time.advance(500);
    assert!(!node.limit("edge", 10, 1_000, 1, false).await.unwrap().success);

    // Next window, half elapsed: previous weighs 0.5 → effective 5.
    cluster.time.set(EPOCH_MS + 1_500);
    for call in 0..5 {
        let response = node.limit("edge", 10, 1_000, 1, false).await.unwrap();
        assert!(response.success, "call {call} at t=1500 should pass");
    }
    // Headroom exhausted: 5 (decayed) + 5 (current) + 1 > 10.
    assert!(!node.limit("edge", 10, 1_000, 1, false).await.unwrap().success);

    cluster.shutdown().await;
}

#[tokio::test]
async fn window_rolls_exactly_at_second_boundaries() {
    let cluster = TestCluster::spawn(1).await;
    let node = &cluster.nodes[0];

    node.limit("roll", 1, 1_000, 1, false).await.unwrap();
    cluster.time.set(EPOCH_MS + 999);
    assert!(!node.limit("roll", 1, 1_000, 1, false).await.unwrap().success);

    // Two windows later both windows are empty again.
    cluster.time.set(EPOCH_MS + 2_000);
    assert!(node.limit("roll", 1, 1_000, 1, false).await.unwrap().success);

    cluster.shutdown().await;
}

#[tokio::test]
async fn cost_boundaries() {
    let cluster = TestCluster::spawn(1).await;
    let node = &cluster.nodes[0];

    // cost = limit exactly fills the window.
    let fill = node.limit("bounds", 10, 60_000, 10, false).await.unwrap();
    assert!(fill.success);
    assert_eq!(fill.remaining, 0);

    // cost = limit + 1 always denies, even on a fresh counter.
    let over = node.limit("bounds-fresh", 10, 60_000, 11, false).await.unwrap();
    assert!(!over.success);

    // cost = 0 peeks without mutating.
    let peek = node.limit("bounds", 10, 60_000, 0, false).await.unwrap();
    assert!(peek.success);
    assert_eq!(peek.remaining, 0);
    let peek_fresh = node.limit("bounds-untouched", 10, 60_000, 0, false).await.unwrap();
    assert!(peek_fresh.success);
    assert_eq!(peek_fresh.remaining, 10);

    cluster.shutdown().await;
}

#[tokio::test]
async fn remaining_plus_used_never_exceeds_limit() {
    let cluster = TestCluster::spawn(1).await;
    let node = &cluster.nodes[0];

    let limit = 20u64;
    let mut admitted = 0u64;
    for cost in [1u64, 3, 2, 5, 4, 7, 1, 1] {
        let response = node.limit("bound-check", limit, 60_000, cost, false).await.unwrap();
        if response.success {
            admitted += cost;
        }
        assert!(
            response.remaining + admitted <= limit,
            "remaining {} + admitted {admitted} exceeds limit",
            response.remaining
        );
        cluster.time.advance(10);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_auto_create_yields_single_namespace() {
    let cluster = TestCluster::spawn(1).await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let service = cluster.nodes[0].service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .limit(
                    &turnstile::ratelimit::types::RatelimitRequest {
                        workspace_id: "ws".to_string(),
                        namespace: "ns".to_string(),
                        identifier: format!("creator-{i}"),
                        limit: 10,
                        duration_ms: 60_000,
                        cost: 1,
                        async_mode: false,
                    },
                    true,
                )
                .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    // Exactly one live namespace row despite the race.
    let namespace_id = cluster.namespace_id().await;
    assert!(!namespace_id.is_empty());

    cluster.shutdown().await;
}
