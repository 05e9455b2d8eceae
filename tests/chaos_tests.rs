// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, lost items, or duplicated deliveries.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{eventually, props, Author};
use distribution_engine::package::{is_compressed, maybe_decompress};
use distribution_engine::{
    circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError},
    DistributionError, DistributionPackage, DistributionRequest, DistributionRequestType, DistributionSettings,
    ContentRepository, ItemState, SettingsStore,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Corrupted Package Handling
// =============================================================================

/// Test: Corrupted zstd data doesn't panic
#[tokio::test]
async fn corrupted_zstd_no_panic() {
    // Various corrupted payloads with zstd magic header
    let corrupted_payloads: &[&[u8]] = &[
        // Just magic header, no content
        &[0x28, 0xB5, 0x2F, 0xFD],
        // Magic header with garbage
        &[0x28, 0xB5, 0x2F, 0xFD, 0x00, 0x00, 0x00, 0x00],
        // Magic header with random bytes
        &[0x28, 0xB5, 0x2F, 0xFD, 0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE],
        // Magic header with truncated frame header
        &[0x28, 0xB5, 0x2F, 0xFD, 0x20],
    ];

    for (i, payload) in corrupted_payloads.iter().enumerate() {
        let result = maybe_decompress(payload);
        assert!(result.is_err(), "Corrupted payload {} should return error, got Ok", i);

        let decoded = DistributionPackage::from_bytes(payload);
        assert!(
            matches!(decoded, Err(DistributionError::MalformedPackage(_))),
            "Corrupted payload {} should be a malformed package, got {:?}",
            i,
            decoded
        );
    }
}

/// Test: A truncated compressed package is rejected
#[tokio::test]
async fn truncated_package_rejected() {
    let author = Author::new(&[]).await;
    author
        .registry
        .create_agent_config("reverse", &props(&[("type", "reverse")]))
        .await
        .unwrap();
    // Large enough to cross the compression threshold
    let body = "lorem ipsum ".repeat(2000);
    author.write_page("/content/big", &body).await;

    let bytes = author
        .registry
        .export("reverse", DistributionRequestType::Add, &["/content/big".to_string()])
        .await
        .unwrap()
        .remove(0);
    assert!(is_compressed(&bytes));

    for cut in [4, bytes.len() / 2, bytes.len() - 1] {
        let result = DistributionPackage::from_bytes(&bytes[..cut]);
        assert!(result.is_err(), "Truncation at {} should be rejected", cut);
    }

    author.registry.shutdown_all().await;
}

/// Test: Importing garbage through an agent fails cleanly and is logged
#[tokio::test]
async fn import_garbage_is_malformed() {
    let author = Author::new(&[]).await;
    author
        .registry
        .create_agent_config("reverse", &props(&[("type", "reverse")]))
        .await
        .unwrap();

    let garbage: &[&[u8]] = &[&[], b"{", b"{\"id\":1}", b"not json at all", &[0xFF; 64]];
    for (i, bytes) in garbage.iter().enumerate() {
        let result = author.registry.import("reverse", bytes).await;
        assert!(
            matches!(result, Err(DistributionError::MalformedPackage(_))),
            "Garbage {} should be malformed, got {:?}",
            i,
            result
        );
    }
    assert!(!author.registry.get_agent_log("reverse").unwrap().entries.is_empty());

    author.registry.shutdown_all().await;
}

// =============================================================================
// Endpoint Outages
// =============================================================================

/// Test: A dead endpoint opens its circuit, and delivery resumes after recovery
#[tokio::test]
async fn endpoint_outage_opens_circuit_then_recovers() {
    let mut settings = DistributionSettings::for_testing();
    settings.delivery.circuit_failure_threshold = 2;
    settings.delivery.max_attempts = 50;
    let author = Author::build(&["publish1"], None, settings).await;
    author
        .registry
        .create_agent_config(
            "publish",
            &props(&[("type", "forward"), ("endpoints", &author.endpoints_option())]),
        )
        .await
        .unwrap();

    let endpoint = author.endpoints[0].clone();
    endpoint.set_down(true);
    author.write_page("/content/outage", "Outage").await;
    author
        .registry
        .distribute("publish", &DistributionRequest::add("/content/outage"))
        .await
        .unwrap();

    let agent = author.registry.agent("publish").unwrap();
    let probe = agent.clone();
    assert!(
        eventually(WAIT, move || {
            let probe = probe.clone();
            async move { probe.circuits().rejections() > 0 }
        })
        .await,
        "circuit should open while the endpoint is down"
    );

    // Rejections do not consume attempts, so the item is still deliverable
    let queue = author.registry.get_queue("publish", "endpoint1").await.unwrap();
    assert_eq!(queue.items_count, 1);
    assert_ne!(queue.items[0].state, ItemState::Error);
    println!(
        "Circuit open after {} attempts, {} rejections",
        queue.items[0].attempts,
        agent.circuits().rejections()
    );

    endpoint.set_down(false);
    let target = endpoint.repository().clone();
    assert!(
        eventually(WAIT, move || {
            let target = target.clone();
            async move { target.exists("/content/outage").await.unwrap() }
        })
        .await,
        "delivery should resume once the endpoint recovers"
    );

    author.registry.shutdown_all().await;
}

/// Test: One endpoint flapping never delays or duplicates the other
#[tokio::test]
async fn flapping_endpoint_isolated() {
    let author = Author::new(&["stable", "flaky"]).await;
    author
        .registry
        .create_agent_config(
            "fanout",
            &props(&[("type", "multiple-endpoint"), ("endpoints", &author.endpoints_option())]),
        )
        .await
        .unwrap();

    let stable = author.endpoints[0].clone();
    let flaky = author.endpoints[1].clone();
    flaky.fail_next(2);

    for i in 0..10 {
        let path = format!("/content/page{}", i);
        author.write_page(&path, "Page").await;
        author
            .registry
            .distribute("fanout", &DistributionRequest::add(path))
            .await
            .unwrap();
    }

    let (s, f) = (stable.clone(), flaky.clone());
    assert!(eventually(WAIT, move || {
        let (s, f) = (s.clone(), f.clone());
        async move { s.delivered_count() == 10 && f.delivered_count() == 10 }
    })
    .await);

    // Stable endpoint never saw a retry
    assert_eq!(stable.call_count(), 10);
    let ids: HashSet<String> = stable.calls().into_iter().map(|c| c.package_id).collect();
    assert_eq!(ids.len(), 10, "no package delivered twice");

    author.registry.shutdown_all().await;
}

// =============================================================================
// Concurrency
// =============================================================================

/// Test: Concurrent PULLs partition a passive queue with no duplicates
#[tokio::test]
async fn concurrent_pulls_no_duplicates() {
    let author = Author::new(&[]).await;
    author
        .registry
        .create_agent_config("reverse", &props(&[("type", "reverse")]))
        .await
        .unwrap();

    const ITEMS: usize = 50;
    for i in 0..ITEMS {
        author
            .registry
            .distribute("reverse", &DistributionRequest::delete(format!("/content/gone{}", i)))
            .await
            .unwrap();
    }

    let agent = author.registry.agent("reverse").unwrap();
    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let agent = agent.clone();
        tasks.spawn(async move { agent.pull(None).await });
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    while let Some(result) = tasks.join_next().await {
        for package in result.unwrap().unwrap() {
            total += 1;
            assert!(seen.insert(package.id.clone()), "package {} pulled twice", package.id);
        }
    }

    assert_eq!(total, ITEMS, "every item handed out exactly once");
    assert_eq!(agent.queue("default").unwrap().items_count().await, 0);

    author.registry.shutdown_all().await;
}

/// Test: Concurrent distribute calls keep one item per request per queue
#[tokio::test]
async fn concurrent_distribute_all_delivered() {
    let author = Author::new(&["publish1", "publish2"]).await;
    author
        .registry
        .create_agent_config(
            "fanout",
            &props(&[("type", "multiple-endpoint"), ("endpoints", &author.endpoints_option())]),
        )
        .await
        .unwrap();

    const REQUESTS: usize = 40;
    for i in 0..REQUESTS {
        author.write_page(&format!("/content/c{}", i), "Concurrent").await;
    }

    let agent = author.registry.agent("fanout").unwrap();
    let mut tasks = JoinSet::new();
    for i in 0..REQUESTS {
        let agent = agent.clone();
        tasks.spawn(async move { agent.distribute(&DistributionRequest::add(format!("/content/c{}", i))).await });
    }

    let mut package_ids = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        let response = result.unwrap().unwrap();
        assert!(response.all_queued());
        assert!(package_ids.insert(response.package_id.unwrap()));
    }

    let endpoints = author.endpoints.clone();
    assert!(eventually(WAIT, move || {
        let endpoints = endpoints.clone();
        async move { endpoints.iter().all(|e| e.delivered_count() == REQUESTS) }
    })
    .await);

    for endpoint in &author.endpoints {
        let delivered: HashSet<String> = endpoint.calls().into_iter().map(|c| c.package_id).collect();
        assert_eq!(delivered, package_ids);
        for i in 0..REQUESTS {
            assert!(endpoint.repository().exists(&format!("/content/c{}", i)).await.unwrap());
        }
    }

    author.registry.shutdown_all().await;
}

// =============================================================================
// Settings Store Failures
// =============================================================================

/// Test: A failing settings store leaves no half-created agent behind
#[tokio::test]
async fn settings_write_failure_leaves_no_agent() {
    let author = Author::new(&["publish1"]).await;
    let root = author.registry.settings().resources.settings_root.clone();
    author.settings_store.fail_writes_under(root.clone()).await;

    let options = props(&[("type", "forward"), ("endpoints", &author.endpoints_option())]);
    let result = author.registry.create_agent_config("publish", &options).await;
    assert!(matches!(result, Err(DistributionError::Settings(_))), "got {:?}", result);
    assert!(author.registry.list_agents().items.is_empty());
    assert!(matches!(
        author.registry.get_agent_config("publish"),
        Err(DistributionError::NotFound { .. })
    ));
    assert!(author.settings_store.is_empty().await);

    // Once the store recovers the same request goes through
    author.settings_store.clear_failures().await;
    author.registry.create_agent_config("publish", &options).await.unwrap();
    assert_eq!(author.registry.list_agents().items, vec!["publish".to_string()]);
    assert!(author
        .settings_store
        .read(&author.registry.settings().resources.settings_path("publish"))
        .await
        .unwrap()
        .is_some());

    author.registry.shutdown_all().await;
}

// =============================================================================
// Circuit Breaker Stress
// =============================================================================

/// Test: Circuit breaker with rapid failure/success cycles
#[tokio::test]
async fn circuit_breaker_rapid_cycles() {
    let circuit = CircuitBreaker::new(
        "rapid-cycle",
        CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        },
    );

    for cycle in 0..5 {
        // Fail twice to open
        for _ in 0..2 {
            let _: Result<(), CircuitError<&str>> = circuit.call(|| async { Err("fail") }).await;
        }

        sleep(Duration::from_millis(15)).await;

        let result: Result<i32, CircuitError<&str>> = circuit.call(|| async { Ok(42) }).await;
        assert!(result.is_ok(), "Cycle {} should succeed after recovery", cycle);
    }

    println!("Completed 5 rapid failure/recovery cycles");
}

/// Test: Concurrent circuit breaker access
#[tokio::test]
async fn circuit_breaker_concurrent_access() {
    let circuit = Arc::new(CircuitBreaker::new(
        "concurrent",
        CircuitConfig {
            failure_threshold: 100,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        },
    ));

    let mut tasks = JoinSet::new();
    let success_count = Arc::new(AtomicU32::new(0));

    for _ in 0..100 {
        let c = circuit.clone();
        let sc = success_count.clone();
        tasks.spawn(async move {
            let result: Result<(), CircuitError<&str>> = c.call(|| async { Ok(()) }).await;
            if result.is_ok() {
                sc.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    while let Some(r) = tasks.join_next().await {
        r.unwrap();
    }

    assert_eq!(success_count.load(Ordering::Relaxed), 100, "All concurrent calls should succeed");
    assert_eq!(circuit.successes(), 100);
}
