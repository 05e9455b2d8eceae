// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Queue depth and enqueue outcomes
//! - Delivery attempts, retries and failures
//! - Export, import and pull activity
//! - Endpoint circuit breaker rejections
//! - Agent lifecycle and configuration changes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `distribution_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use distribution_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_enqueue("publish", "endpoint1", true);
//! metrics::record_delivery("publish", "endpoint1", "delivered", Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Queue Metrics
// =============================================================================

/// Record an enqueue attempt into an agent queue.
pub fn record_enqueue(agent: &str, queue: &str, accepted: bool) {
    let status = if accepted { "queued" } else { "rejected" };
    counter!(
        "distribution_enqueued_total",
        "agent" => agent.to_string(),
        "queue" => queue.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Set the number of QUEUED + IN_PROGRESS + ERROR items in a queue.
pub fn set_queue_depth(agent: &str, queue: &str, depth: usize) {
    gauge!("distribution_queue_depth", "agent" => agent.to_string(), "queue" => queue.to_string())
        .set(depth as f64);
}

/// Record items removed by a purge.
pub fn record_purge(agent: &str, queue: &str, removed: usize) {
    counter!("distribution_purged_items_total", "agent" => agent.to_string(), "queue" => queue.to_string())
        .increment(removed as u64);
}

/// Record packages released by a PULL.
pub fn record_pull(agent: &str, queue: &str, count: usize) {
    counter!("distribution_pulls_total", "agent" => agent.to_string(), "queue" => queue.to_string()).increment(1);
    counter!("distribution_pulled_packages_total", "agent" => agent.to_string(), "queue" => queue.to_string())
        .increment(count as u64);
}

// =============================================================================
// Delivery Metrics
// =============================================================================

/// Record a delivery attempt outcome (`delivered`, `noop`, `retrying`, `failed`).
pub fn record_delivery(agent: &str, queue: &str, outcome: &str, duration: Duration) {
    counter!(
        "distribution_delivery_attempts_total",
        "agent" => agent.to_string(),
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("distribution_delivery_duration_seconds", "agent" => agent.to_string())
        .record(duration.as_secs_f64());
}

/// Record an endpoint circuit rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("distribution_circuit_rejections_total", "circuit" => circuit_name.to_string()).increment(1);
}

// =============================================================================
// Package Metrics
// =============================================================================

/// Record a package export.
pub fn record_export(exporter: &str, kind: &str, success: bool, nodes: usize) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "distribution_exports_total",
        "exporter" => exporter.to_string(),
        "type" => kind.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        histogram!("distribution_package_nodes", "type" => kind.to_string()).record(nodes as f64);
    }
}

/// Record a synchronous import (`applied`, `noop`, `failed`).
pub fn record_import(kind: &str, outcome: &str) {
    counter!("distribution_imports_total", "type" => kind.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record encoded package size.
pub fn record_package_bytes(bytes: usize, compressed: bool) {
    histogram!("distribution_package_bytes", "compressed" => if compressed { "true" } else { "false" })
        .record(bytes as f64);
}

// =============================================================================
// Agent Metrics
// =============================================================================

/// Gauge for the number of running agents.
pub fn set_agents(count: usize) {
    gauge!("distribution_agents").set(count as f64);
}

/// Gauge for agent state.
pub fn set_agent_state(agent: &str, state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "Stopping" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("distribution_agent_state", "agent" => agent.to_string()).set(value);
}

/// Record an agent configuration change (`create`, `update`, `delete`).
pub fn record_config_change(agent: &str, operation: &str) {
    counter!(
        "distribution_config_changes_total",
        "agent" => agent.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record errors by type.
pub fn record_error(agent: &str, error_type: &str) {
    counter!(
        "distribution_errors_total",
        "agent" => agent.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a queue store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("distribution_store_retries_total", "operation" => operation.to_string()).increment(1);
}
