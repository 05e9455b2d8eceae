// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-endpoint circuit breakers.
//!
//! Each active queue delivers to exactly one endpoint, and each endpoint gets
//! its own breaker so a dead publish instance cannot slow down delivery to the
//! healthy ones. Built on the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, imports pass through
//! - **Open**: Endpoint unhealthy, imports are skipped without an attempt
//! - **HalfOpen**: Probing whether the endpoint recovered
//!
//! A rejection is not a delivery attempt: the queue item keeps its attempt
//! count and the worker waits for the circuit to reset.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use distribution_engine::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # async fn example() {
//! let circuit = CircuitBreaker::new("publish/endpoint1", CircuitConfig::default());
//!
//! match circuit.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* imported */ }
//!     Err(CircuitError::Rejected) => { /* endpoint circuit open, wait */ }
//!     Err(CircuitError::Inner(e)) => { /* import failed */ }
//! }
//! # }
//! ```

use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Successful probes in half-open needed to close it again.
    pub success_threshold: u32,
    /// How long to wait before probing (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing.
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        // Trips only when every call in a window of `failure_threshold` failed,
        // i.e. that many failures in a row.
        let window = config.failure_threshold.max(1);
        let error_rate = (window as f32 - 0.5) / window as f32;
        let recloser = Recloser::custom()
            .error_rate(error_rate)
            .closed_len(window as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future so nothing runs when the circuit
    /// is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Endpoint circuit open, import skipped");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Endpoint import failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// The circuits of one agent, keyed by endpoint name.
pub struct EndpointCircuits {
    agent: String,
    config: CircuitConfig,
    circuits: DashMap<String, Arc<CircuitBreaker>>,
}

impl EndpointCircuits {
    pub fn new(agent: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            agent: agent.into(),
            config,
            circuits: DashMap::new(),
        }
    }

    /// Circuit for `endpoint`, created on first use.
    pub fn for_endpoint(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.circuits
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("{}/{}", self.agent, endpoint),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Total rejections across endpoints.
    pub fn rejections(&self) -> u64 {
        self.circuits.iter().map(|c| c.value().rejections()).sum()
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }
}
