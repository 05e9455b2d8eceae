// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery workers: one task per active queue.
//!
//! Each worker:
//! 1. Waits for the queue head to be ready (parks on the queue's notifier)
//! 2. Marks it IN_PROGRESS
//! 3. Imports it through the endpoint's circuit breaker
//! 4. Acks on success, records a failure otherwise
//! 5. Backs off before retrying the same head item
//!
//! Delivery within a queue is strictly FIFO: a failing head item is retried
//! (or moved to ERROR) before anything behind it is attempted.
//!
//! # Graceful Shutdown
//!
//! The worker uses `tokio::select!` to respond to the shutdown signal while
//! idle, throttled by the rate limiter, or backing off. An import that already started is allowed to finish
//! so its outcome is recorded.
//!
//! # Circuit Breaker
//!
//! When the endpoint circuit is open, the import is skipped, the item goes
//! back to QUEUED without spending an attempt, and the worker waits for the
//! circuit's recovery interval.

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::config::EndpointConfig;
use crate::endpoint::PackageImporter;
use crate::error::DistributionError;
use crate::log::AgentLog;
use crate::metrics;
use crate::queue::{DistributionQueue, FailOutcome, QueueItem};
use crate::repository::ImportOutcome;
use crate::resilience::{RateLimiter, RetryConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Everything a worker needs to deliver one queue.
#[derive(Clone)]
pub struct DeliveryContext {
    pub queue: Arc<DistributionQueue>,
    pub endpoint: EndpointConfig,
    pub importer: Arc<dyn PackageImporter>,
    pub circuit: Arc<CircuitBreaker>,
    pub retry: RetryConfig,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub log: Arc<AgentLog>,
    /// How long to wait after the circuit rejected an import.
    pub circuit_wait: Duration,
}

/// What one pass over the queue head did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Delivered(ImportOutcome),
    Retrying { attempts: u32, delay: Duration },
    Failed { attempts: u32 },
    CircuitOpen,
    /// The item changed underneath the worker (purged, removed, retried).
    Skipped,
}

/// Run the delivery worker for a single active queue until shutdown.
pub async fn run_delivery_worker(ctx: DeliveryContext, mut shutdown_rx: watch::Receiver<bool>) {
    let span = tracing::info_span!(
        "delivery",
        agent = %ctx.queue.agent(),
        queue = %ctx.queue.name(),
        endpoint = %ctx.endpoint.uri
    );

    async move {
        info!("Starting delivery worker");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let item = tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received while idle");
                        break;
                    }
                    continue;
                }

                item = ctx.queue.next_ready() => item,
            };

            if let Some(ref limiter) = ctx.rate_limiter {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received while throttled");
                            break;
                        }
                        continue;
                    }
                    _ = limiter.acquire() => {}
                }
            }

            let wait = match attempt_delivery(&ctx, &item).await {
                AttemptResult::Retrying { delay, .. } => Some(delay),
                AttemptResult::CircuitOpen => Some(ctx.circuit_wait),
                _ => None,
            };

            if let Some(delay) = wait {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received during backoff");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!("Delivery worker stopped");
    }
    .instrument(span)
    .await
}

/// Attempt delivery of `item`, the current queue head.
///
/// Rate limiting is the caller's job; this imports immediately.
pub async fn attempt_delivery(ctx: &DeliveryContext, item: &QueueItem) -> AttemptResult {
    let agent = ctx.queue.agent();
    let queue = ctx.queue.name();

    let item = match ctx.queue.begin_attempt(&item.id).await {
        Ok(item) => item,
        Err(e) => {
            debug!(item_id = %item.id, error = %e, "Item no longer deliverable");
            return AttemptResult::Skipped;
        }
    };

    let started = Instant::now();
    let importer = Arc::clone(&ctx.importer);
    let package = Arc::clone(&item.package);
    let result = ctx
        .circuit
        .call(|| async move { importer.import(&package).await })
        .await;
    let elapsed = started.elapsed();

    match result {
        Ok(outcome) => {
            match ctx.queue.ack(&item.id).await {
                Ok(true) => {}
                Ok(false) => debug!(item_id = %item.id, "Item removed while its import was in flight"),
                Err(e) => {
                    // The import landed but the ack did not persist; retrying is
                    // safe because imports are idempotent.
                    error!(item_id = %item.id, error = %e, "Failed to ack delivered item");
                    if let Err(e) = ctx.queue.release(&item.id).await {
                        error!(item_id = %item.id, error = %e, "Failed to release item");
                    }
                    return AttemptResult::Retrying {
                        attempts: item.attempts,
                        delay: ctx.retry.initial_delay,
                    };
                }
            }

            let label = match outcome {
                ImportOutcome::Applied => "delivered",
                ImportOutcome::NoOp => "noop",
            };
            metrics::record_delivery(agent, queue, label, elapsed);
            info!(
                item_id = %item.id,
                package_id = %item.package.id,
                duration_ms = elapsed.as_millis() as u64,
                outcome = label,
                "Package delivered"
            );
            ctx.log.info(format!(
                "package {} ({} {:?}) delivered to {} [{}]",
                item.package.id,
                item.package.kind,
                item.package.paths,
                ctx.endpoint.name,
                label
            ));
            AttemptResult::Delivered(outcome)
        }
        Err(CircuitError::Rejected) => {
            metrics::record_circuit_rejection(ctx.circuit.name());
            if let Err(e) = ctx.queue.release(&item.id).await {
                error!(item_id = %item.id, error = %e, "Failed to release item after circuit rejection");
            }
            ctx.log.warn(format!(
                "endpoint {} circuit open, delivery of package {} postponed",
                ctx.endpoint.name, item.package.id
            ));
            AttemptResult::CircuitOpen
        }
        Err(CircuitError::Inner(e)) => record_failure(ctx, &item, &e, elapsed).await,
    }
}

async fn record_failure(
    ctx: &DeliveryContext,
    item: &QueueItem,
    err: &DistributionError,
    elapsed: Duration,
) -> AttemptResult {
    let agent = ctx.queue.agent();
    let queue = ctx.queue.name();
    let permanent = !err.is_retryable();
    metrics::record_error(agent, err.kind_label());

    let outcome = match ctx.queue.fail(&item.id, &err.to_string(), permanent).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(item_id = %item.id, error = %e, "Could not record failure");
            return AttemptResult::Skipped;
        }
    };

    match outcome {
        FailOutcome::Retry { attempts } => {
            let delay = ctx.retry.delay_for_attempt(attempts);
            metrics::record_delivery(agent, queue, "retrying", elapsed);
            warn!(
                item_id = %item.id,
                error = %err,
                attempts,
                backoff_ms = delay.as_millis() as u64,
                "Delivery failed, backing off"
            );
            ctx.log.warn(format!(
                "delivery of package {} to {} failed (attempt {}): {}",
                item.package.id, ctx.endpoint.name, attempts, err
            ));
            AttemptResult::Retrying { attempts, delay }
        }
        FailOutcome::Exhausted { attempts } => {
            metrics::record_delivery(agent, queue, "failed", elapsed);
            let exhausted = DistributionError::RetryExhausted {
                item_id: item.id.clone(),
                attempts,
            };
            error!(item_id = %item.id, error = %err, permanent, "{}", exhausted);
            ctx.log.error(format!(
                "package {} moved to ERROR on {}: {} (last error: {})",
                item.package.id, ctx.endpoint.name, exhausted, err
            ));
            AttemptResult::Failed { attempts }
        }
    }
}
