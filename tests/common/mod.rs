//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A mock delivery endpoint with failure injection
//! - An author-side registry fixture wired to mock endpoints
//! - Polling helpers for asynchronous delivery

pub mod mock_endpoint;

pub use mock_endpoint::*;

use distribution_engine::package::ContentNode;
use distribution_engine::{
    AgentRegistry, ContentRepository, DistributionSettings, InMemoryRepository, InMemorySettingsStore,
    QueueStore, StaticEndpointResolver,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An author instance with a local repository and mock publish endpoints.
#[allow(dead_code)]
pub struct Author {
    pub registry: AgentRegistry,
    pub repo: Arc<InMemoryRepository>,
    pub settings_store: Arc<InMemorySettingsStore>,
    pub endpoints: Vec<Arc<MockEndpoint>>,
}

#[allow(dead_code)]
impl Author {
    pub async fn new(endpoint_names: &[&str]) -> Self {
        Self::with_store(endpoint_names, None).await
    }

    pub async fn with_store(endpoint_names: &[&str], store: Option<Arc<QueueStore>>) -> Self {
        Self::build(endpoint_names, store, DistributionSettings::for_testing()).await
    }

    pub async fn build(
        endpoint_names: &[&str],
        store: Option<Arc<QueueStore>>,
        settings: DistributionSettings,
    ) -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let resolver = Arc::new(StaticEndpointResolver::new());
        let endpoints: Vec<Arc<MockEndpoint>> = endpoint_names.iter().map(|n| MockEndpoint::new(n)).collect();
        for endpoint in &endpoints {
            resolver.register(endpoint.uri(), endpoint.clone());
        }
        let settings_store = Arc::new(InMemorySettingsStore::new());
        let registry = AgentRegistry::new(settings, repo.clone(), resolver, settings_store.clone(), store);
        Self {
            registry,
            repo,
            settings_store,
            endpoints,
        }
    }

    /// `endpoints` option value naming every mock endpoint.
    pub fn endpoints_option(&self) -> String {
        self.endpoints
            .iter()
            .enumerate()
            .map(|(i, e)| format!("endpoint{}={}", i + 1, e.uri()))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub async fn write_page(&self, path: &str, title: &str) {
        self.repo
            .write(path, ContentNode::new().with_property("jcr:title", title))
            .await
            .unwrap();
    }
}

/// Build an option map from pairs.
#[allow(dead_code)]
pub fn props(pairs: &[(&str, &str)]) -> distribution_engine::settings::Properties {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Poll `check` until it returns true or `timeout` elapses.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
