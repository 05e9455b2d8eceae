//! Mock delivery endpoint for testing.
//!
//! Applies packages to its own in-memory repository and records every
//! import call. Failures can be injected: a number of transient failures,
//! a permanent rejection, or an outage that lasts until cleared.

use distribution_engine::endpoint::{ImportFuture, PackageImporter};
use distribution_engine::repository::{self, InMemoryRepository};
use distribution_engine::{DistributionError, DistributionPackage, ImportOutcome};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A recorded import() call.
#[derive(Debug, Clone)]
pub struct ImportCall {
    pub package_id: String,
    #[allow(dead_code)]
    pub paths: Vec<String>,
    pub succeeded: bool,
}

/// Mock implementation of PackageImporter that records all calls.
///
/// # Example
/// ```rust,ignore
/// let endpoint = MockEndpoint::new("endpoint1");
/// endpoint.fail_next(2);
///
/// // Use in tests...
///
/// assert_eq!(endpoint.call_count(), 3);
/// assert!(endpoint.repository().exists("/content/a").await.unwrap());
/// ```
pub struct MockEndpoint {
    name: String,
    repo: Arc<InMemoryRepository>,
    calls: Mutex<Vec<ImportCall>>,
    /// Transient failures still to inject
    fail_remaining: AtomicUsize,
    /// Fail every import with a transport error until cleared
    down: AtomicBool,
    /// Reject every import permanently
    rejecting: AtomicBool,
    /// Artificial import latency
    delay_ms: AtomicUsize,
}

impl MockEndpoint {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            repo: Arc::new(InMemoryRepository::new()),
            calls: Mutex::new(Vec::new()),
            fail_remaining: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            rejecting: AtomicBool::new(false),
            delay_ms: AtomicUsize::new(0),
        })
    }

    /// URI this endpoint is registered under.
    pub fn uri(&self) -> String {
        format!("mock://{}", self.name)
    }

    pub fn repository(&self) -> &Arc<InMemoryRepository> {
        &self.repo
    }

    /// Fail the next `n` imports with a retryable transport error.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ImportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn delivered_count(&self) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.succeeded).count()
    }

    fn injected_failure(&self, package: &DistributionPackage) -> Option<DistributionError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Some(DistributionError::ImportRejected {
                package_id: package.id.clone(),
                message: "rejected by mock endpoint".to_string(),
            });
        }
        if self.down.load(Ordering::SeqCst) {
            return Some(self.transport_error("endpoint down"));
        }
        let took = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        took.then(|| self.transport_error("injected failure"))
    }

    fn transport_error(&self, message: &str) -> DistributionError {
        DistributionError::Transport {
            endpoint: self.name.clone(),
            message: message.to_string(),
        }
    }

    fn record(&self, package: &DistributionPackage, succeeded: bool) {
        self.calls.lock().unwrap().push(ImportCall {
            package_id: package.id.clone(),
            paths: package.paths.clone(),
            succeeded,
        });
    }
}

impl PackageImporter for MockEndpoint {
    fn import<'a>(&'a self, package: &'a DistributionPackage) -> ImportFuture<'a> {
        Box::pin(async move {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }

            if let Some(err) = self.injected_failure(package) {
                self.record(package, false);
                return Err(err);
            }

            let result = repository::import(self.repo.as_ref(), package).await;
            self.record(package, result.is_ok());
            result
        })
    }
}

/// Outcome helper for tests that only care about applied vs no-op.
#[allow(dead_code)]
pub fn is_applied(outcome: &ImportOutcome) -> bool {
    matches!(outcome, ImportOutcome::Applied)
}
