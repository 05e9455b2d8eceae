// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery endpoints.
//!
//! An endpoint is anything that can apply a package: a remote repository
//! behind a transport, or a local repository in the same process. Agents hold
//! one [`PackageImporter`] per configured endpoint and resolve them from
//! configuration through an [`EndpointResolver`].

use crate::config::EndpointConfig;
use crate::error::{DistributionError, Result};
use crate::package::DistributionPackage;
use crate::repository::{self, ContentRepository, ImportOutcome};
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by importers.
pub type ImportFuture<'a> = Pin<Box<dyn Future<Output = Result<ImportOutcome>> + Send + 'a>>;

/// Applies packages on a delivery target.
pub trait PackageImporter: Send + Sync + 'static {
    /// Apply `package` to the target. Must be idempotent.
    fn import<'a>(&'a self, package: &'a DistributionPackage) -> ImportFuture<'a>;
}

/// Imports into a [`ContentRepository`] in the same process.
pub struct RepositoryImporter<R: ContentRepository> {
    repo: Arc<R>,
}

impl<R: ContentRepository> RepositoryImporter<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }
}

impl<R: ContentRepository> PackageImporter for RepositoryImporter<R> {
    fn import<'a>(&'a self, package: &'a DistributionPackage) -> ImportFuture<'a> {
        Box::pin(async move { repository::import(self.repo.as_ref(), package).await })
    }
}

/// Turns endpoint configuration into importers.
pub trait EndpointResolver: Send + Sync + 'static {
    fn resolve(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn PackageImporter>>;
}

/// Resolver over a fixed table of endpoint URIs.
///
/// The transport binding lives outside this crate; hosts register one
/// importer per URI they can reach.
#[derive(Default)]
pub struct StaticEndpointResolver {
    importers: DashMap<String, Arc<dyn PackageImporter>>,
}

impl StaticEndpointResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the importer serving `uri`, replacing any previous one.
    pub fn register(&self, uri: impl Into<String>, importer: Arc<dyn PackageImporter>) {
        self.importers.insert(uri.into(), importer);
    }

    pub fn len(&self) -> usize {
        self.importers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.importers.is_empty()
    }
}

impl EndpointResolver for StaticEndpointResolver {
    fn resolve(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn PackageImporter>> {
        self.importers
            .get(&endpoint.uri)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DistributionError::not_found("endpoint", endpoint.uri.clone()))
    }
}
