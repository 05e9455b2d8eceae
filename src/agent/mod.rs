// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distribution agent.
//!
//! Ties together, for one configured replication relationship:
//! - Package export from the local repository via [`crate::repository::export`]
//! - One [`DistributionQueue`] per endpoint plus any passive queues
//! - One delivery worker per active queue via [`crate::worker`]
//! - A circuit breaker per endpoint via [`EndpointCircuits`]
//! - The operator-facing [`AgentLog`]
//!
//! # Topologies
//!
//! | Kind | Active queues | Passive queues |
//! |------|---------------|----------------|
//! | `forward` | 0 or 1 | configured |
//! | `multiple-endpoint` / `sync` | one per endpoint | configured |
//! | `reverse` | none | configured, else `default` |
//!
//! Fan-out endpoints are independent failure domains: each has its own
//! queue, worker, circuit, and retry state, all carrying the same package.

mod types;

pub use types::{AgentState, DeliveryOutcome, DistributionResponse};

use crate::circuit_breaker::EndpointCircuits;
use crate::config::{AgentConfig, DistributionSettings, EndpointConfig};
use crate::endpoint::{EndpointResolver, PackageImporter};
use crate::error::{DistributionError, Result};
use crate::log::AgentLog;
use crate::metrics;
use crate::package::{DistributionPackage, DistributionRequest, DistributionRequestType};
use crate::queue::DistributionQueue;
use crate::repository::{self, ContentRepository};
use crate::resilience::{RateLimiter, RetryConfig};
use crate::store::QueueStore;
use crate::worker::{run_delivery_worker, DeliveryContext};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A running replication relationship.
///
/// Built from an [`AgentConfig`]; queues exist from construction so requests
/// are accepted before [`start()`](Self::start), but nothing is delivered
/// until the workers run.
pub struct DistributionAgent {
    name: String,

    /// Current config. Only non-topology fields change after construction.
    config: RwLock<AgentConfig>,

    state_tx: watch::Sender<AgentState>,
    state_rx: watch::Receiver<AgentState>,

    /// Local repository packages are exported from.
    source: Arc<dyn ContentRepository>,

    /// Queues in delivery order: active first, then passive.
    queues: Vec<Arc<DistributionQueue>>,

    /// Delivery target of each active queue, keyed by queue name.
    endpoints: HashMap<String, (EndpointConfig, Arc<dyn PackageImporter>)>,

    circuits: Arc<EndpointCircuits>,
    retry: RetryConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
    log: Arc<AgentLog>,
    circuit_wait: Duration,
    drain_timeout: Duration,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributionAgent {
    /// Build an agent and its queues.
    ///
    /// Every endpoint must resolve; an unknown endpoint is a configuration
    /// error rather than a delivery failure discovered later.
    pub fn new(
        config: AgentConfig,
        settings: &DistributionSettings,
        source: Arc<dyn ContentRepository>,
        resolver: &dyn EndpointResolver,
        store: Option<Arc<QueueStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let capacity = config.queue_capacity.or(settings.queue.default_capacity);
        let max_attempts = settings.delivery.max_attempts;

        let mut queues = Vec::new();
        let mut endpoints = HashMap::new();
        for spec in config.queue_specs() {
            if let Some(endpoint) = spec.endpoint {
                let importer = resolver.resolve(&endpoint).map_err(|e| {
                    DistributionError::Config(format!(
                        "agent {}: endpoint {} ({}) cannot be resolved: {}",
                        config.name, endpoint.name, endpoint.uri, e
                    ))
                })?;
                endpoints.insert(spec.name.clone(), (endpoint, importer));
            }

            let mut queue =
                DistributionQueue::new(config.name.clone(), spec.name, spec.mode, capacity, max_attempts);
            if let Some(ref store) = store {
                queue = queue.with_store(Arc::clone(store));
            }
            queues.push(Arc::new(queue));
        }

        let circuit_config = settings.delivery.circuit_config();
        let circuit_wait = circuit_config.recovery_timeout;
        let rate_limiter = settings
            .delivery
            .rate_limit_config()
            .map(|c| Arc::new(RateLimiter::new(c)));

        let (state_tx, state_rx) = watch::channel(AgentState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        metrics::set_agent_state(&config.name, "Created");

        Ok(Self {
            circuits: Arc::new(EndpointCircuits::new(config.name.clone(), circuit_config)),
            retry: settings.delivery.retry_config(),
            rate_limiter,
            log: Arc::new(AgentLog::new(config.name.clone(), settings.log.capacity)),
            circuit_wait,
            drain_timeout: settings.delivery.drain_timeout_duration(),
            name: config.name.clone(),
            config: RwLock::new(config),
            state_tx,
            state_rx,
            source,
            queues,
            endpoints,
            shutdown_tx,
            shutdown_rx,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> AgentConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in a config that differs only in non-topology fields
    /// (exporter, mirroring, extra options).
    pub fn update_config(&self, config: AgentConfig) -> Result<()> {
        let mut current = self.config.write().unwrap_or_else(|e| e.into_inner());
        if current.name != config.name || !current.same_topology(&config) {
            return Err(DistributionError::Validation(format!(
                "agent {}: queue topology cannot change in place",
                self.name
            )));
        }
        *current = config;
        Ok(())
    }

    pub fn state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == AgentState::Running
    }

    pub fn queues(&self) -> &[Arc<DistributionQueue>] {
        &self.queues
    }

    pub fn queue(&self, name: &str) -> Option<&Arc<DistributionQueue>> {
        self.queues.iter().find(|q| q.name() == name)
    }

    pub fn log(&self) -> &Arc<AgentLog> {
        &self.log
    }

    pub fn circuits(&self) -> &Arc<EndpointCircuits> {
        &self.circuits
    }

    fn set_state(&self, state: AgentState) {
        let _ = self.state_tx.send(state);
        metrics::set_agent_state(&self.name, &state.to_string());
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Restore persisted queue items and spawn one worker per active queue.
    pub async fn start(&self) -> Result<()> {
        let current = self.state();
        if current != AgentState::Created {
            return Err(DistributionError::InvalidState {
                expected: AgentState::Created.to_string(),
                actual: current.to_string(),
            });
        }

        info!(agent = %self.name, kind = %self.config().kind, queues = self.queues.len(), "Starting distribution agent");

        for queue in &self.queues {
            let restored = queue.restore().await?;
            if restored > 0 {
                info!(agent = %self.name, queue = %queue.name(), restored, "Restored queue items");
                self.log
                    .info(format!("restored {} items in queue {}", restored, queue.name()));
            }
        }

        let mut workers = self.workers.lock().await;
        for queue in &self.queues {
            let Some((endpoint, importer)) = self.endpoints.get(queue.name()) else {
                continue;
            };
            let ctx = DeliveryContext {
                queue: Arc::clone(queue),
                endpoint: endpoint.clone(),
                importer: Arc::clone(importer),
                circuit: self.circuits.for_endpoint(&endpoint.name),
                retry: self.retry.clone(),
                rate_limiter: self.rate_limiter.clone(),
                log: Arc::clone(&self.log),
                circuit_wait: self.circuit_wait,
            };
            workers.push(tokio::spawn(run_delivery_worker(ctx, self.shutdown_rx.clone())));
        }
        let worker_count = workers.len();
        drop(workers);

        self.set_state(AgentState::Running);
        self.log.info(format!(
            "agent {} started with {} queues ({} active)",
            self.name,
            self.queues.len(),
            worker_count
        ));
        info!(agent = %self.name, workers = worker_count, "Distribution agent running");
        Ok(())
    }

    /// Signal every worker and wait for it to stop.
    ///
    /// Waits up to the configured drain timeout per worker; an import already
    /// in flight is allowed to finish so its outcome is recorded.
    pub async fn shutdown(&self) {
        if self.state() == AgentState::Stopped {
            return;
        }
        info!(agent = %self.name, "Shutting down distribution agent");
        self.set_state(AgentState::Stopping);

        // A request that passed the state check before this point may still
        // be exporting; closed queues turn its enqueue into `Shutdown`.
        for queue in &self.queues {
            queue.close().await;
        }
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        let count = handles.len();
        if count > 0 {
            info!(agent = %self.name, workers = count, "Waiting for delivery workers to drain");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(self.drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(agent = %self.name, worker = i, "Delivery worker completed");
                }
                Ok(Err(e)) => {
                    warn!(agent = %self.name, worker = i, error = %e, "Delivery worker panicked");
                }
                Err(_) => {
                    warn!(
                        agent = %self.name,
                        worker = i,
                        timeout_ms = self.drain_timeout.as_millis() as u64,
                        "Delivery worker timed out during shutdown"
                    );
                }
            }
        }

        self.set_state(AgentState::Stopped);
        self.log.info(format!("agent {} stopped", self.name));
        info!(agent = %self.name, "Distribution agent stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════════════

    /// Execute a distribution request.
    ///
    /// ADD/DELETE fail with the first queue rejection; enqueues that
    /// succeeded on other queues stay queued. Use
    /// [`distribute_all()`](Self::distribute_all) to get every per-queue
    /// outcome instead.
    pub async fn distribute(&self, request: &DistributionRequest) -> Result<DistributionResponse> {
        let (response, first_error) = self.execute(request).await?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(response),
        }
    }

    /// Like [`distribute()`](Self::distribute), but queue rejections are
    /// reported only as [`DeliveryOutcome::Rejected`] entries.
    pub async fn distribute_all(&self, request: &DistributionRequest) -> Result<DistributionResponse> {
        let (response, _) = self.execute(request).await?;
        Ok(response)
    }

    async fn execute(
        &self,
        request: &DistributionRequest,
    ) -> Result<(DistributionResponse, Option<DistributionError>)> {
        if matches!(self.state(), AgentState::Stopping | AgentState::Stopped) {
            return Err(DistributionError::Shutdown);
        }
        request.validate()?;

        match request.kind {
            DistributionRequestType::Pull => {
                let pulled = self.pull(None).await?;
                Ok((
                    DistributionResponse {
                        pulled,
                        ..Default::default()
                    },
                    None,
                ))
            }
            DistributionRequestType::Test => Ok((self.test_queues().await?, None)),
            DistributionRequestType::Add | DistributionRequestType::Delete => {
                self.fan_out(request).await
            }
        }
    }

    fn require_queues(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(DistributionError::Config(format!(
                "agent {} has no queues configured",
                self.name
            )));
        }
        Ok(())
    }

    fn exporter_name(&self) -> String {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .package_exporter
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    /// Export once and enqueue the package into every queue.
    async fn fan_out(
        &self,
        request: &DistributionRequest,
    ) -> Result<(DistributionResponse, Option<DistributionError>)> {
        self.require_queues()?;

        let kind = request.kind.to_string();
        let started = Instant::now();
        let package = match repository::export(self.source.as_ref(), request).await {
            Ok(package) => package,
            Err(e) => {
                metrics::record_export(&self.exporter_name(), &kind, false, 0);
                metrics::record_error(&self.name, e.kind_label());
                warn!(agent = %self.name, kind = %kind, paths = ?request.paths, error = %e, "Export failed");
                self.log.error(format!("export of {} {:?} failed: {}", kind, request.paths, e));
                return Err(e);
            }
        };
        metrics::record_export(&self.exporter_name(), &kind, true, package.node_count());
        debug!(
            agent = %self.name,
            package_id = %package.id,
            duration_ms = started.elapsed().as_millis() as u64,
            "Exported package"
        );

        let package: Arc<DistributionPackage> = Arc::new(package);
        let mut outcomes = Vec::with_capacity(self.queues.len());
        let mut first_error = None;

        for queue in &self.queues {
            match queue.enqueue(Arc::clone(&package)).await {
                Ok(item) => {
                    outcomes.push((
                        queue.name().to_string(),
                        DeliveryOutcome::Queued {
                            item_id: Some(item.id),
                        },
                    ));
                }
                Err(e) => {
                    metrics::record_error(&self.name, e.kind_label());
                    warn!(agent = %self.name, queue = %queue.name(), package_id = %package.id, error = %e, "Enqueue rejected");
                    self.log.warn(format!(
                        "package {} not queued in {}: {}",
                        package.id,
                        queue.name(),
                        e
                    ));
                    outcomes.push((
                        queue.name().to_string(),
                        DeliveryOutcome::Rejected {
                            reason: e.to_string(),
                        },
                    ));
                    first_error.get_or_insert(e);
                }
            }
        }

        let accepted = outcomes.iter().filter(|(_, o)| o.is_queued()).count();
        info!(
            agent = %self.name,
            package_id = %package.id,
            kind = %kind,
            queued = accepted,
            rejected = outcomes.len() - accepted,
            "Distribution request queued"
        );
        self.log.info(format!(
            "request {} {:?} exported as package {}, queued in {}/{} queues",
            kind,
            package.paths,
            package.id,
            accepted,
            outcomes.len()
        ));

        Ok((
            DistributionResponse {
                package_id: Some(package.id.clone()),
                outcomes,
                pulled: Vec::new(),
            },
            first_error,
        ))
    }

    /// Report, per queue, whether an item would be accepted right now.
    async fn test_queues(&self) -> Result<DistributionResponse> {
        self.require_queues()?;

        let mut outcomes = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            let outcome = match queue.check_accepts().await {
                Ok(()) => DeliveryOutcome::Queued { item_id: None },
                Err(e) => DeliveryOutcome::Rejected {
                    reason: e.to_string(),
                },
            };
            outcomes.push((queue.name().to_string(), outcome));
        }
        self.log.info("test request checked");
        Ok(DistributionResponse {
            outcomes,
            ..Default::default()
        })
    }

    /// Drain a passive queue, oldest package first.
    ///
    /// `None` addresses the first passive queue. Draining an active queue is
    /// an [`InvalidState`](DistributionError::InvalidState) error.
    pub async fn pull(&self, queue_name: Option<&str>) -> Result<Vec<Arc<DistributionPackage>>> {
        let queue = match queue_name {
            Some(name) => self
                .queue(name)
                .ok_or_else(|| DistributionError::not_found("queue", format!("{}/{}", self.name, name)))?,
            None => self.queues.iter().find(|q| q.is_passive()).ok_or_else(|| {
                DistributionError::not_found("queue", format!("{}/<passive>", self.name))
            })?,
        };

        let drained = match queue.drain().await {
            Ok(drained) => drained,
            Err(e) => {
                error!(agent = %self.name, queue = %queue.name(), error = %e, "Pull failed");
                return Err(e);
            }
        };
        if !drained.is_empty() {
            self.log
                .info(format!("pulled {} packages from {}", drained.len(), queue.name()));
        }
        Ok(drained.into_iter().map(|item| item.package).collect())
    }
}

impl std::fmt::Debug for DistributionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionAgent")
            .field("name", &self.name)
            .field("kind", &self.config().kind)
            .field("state", &self.state())
            .field("queues", &self.queues.len())
            .finish()
    }
}
