// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content repository integration.
//!
//! Defines the interface to the content tree storage and the package
//! export/import operations built on it. The storage itself is an external
//! collaborator; [`InMemoryRepository`] is provided for standalone mode and
//! tests.
//!
//! # Export / Import Contract
//!
//! - [`export()`] is read-only on the source. ADD snapshots every requested
//!   subtree and fails with `NotFound` for a missing path; DELETE emits a
//!   deletion marker without reading.
//! - [`import()`] is idempotent. ADD overwrites divergent state at the path;
//!   DELETE of an absent path is a no-op, not an error.

use crate::error::{DistributionError, Result};
use crate::package::{
    ContentNode, DistributionPackage, DistributionRequest, DistributionRequestType, PackagePayload,
    SnapshotEntry,
};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Result type for repository operations.
pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RepoResult<T>> + Send + 'a>>;

/// Error reported by a content repository.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// Storage temporarily unavailable; the operation may succeed later.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    /// The repository refused the change (access control, validation).
    #[error("repository rejected change: {0}")]
    Rejected(String),
}

/// Outcome of applying a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The target changed.
    Applied,
    /// The target already matched the package.
    NoOp,
}

/// What the engine needs from a content repository.
///
/// Implementations are assumed safe for concurrent operations on
/// independent paths; no multi-path transactions are required.
pub trait ContentRepository: Send + Sync + 'static {
    /// Read the subtree rooted at `path`.
    fn read(&self, path: &str) -> BoxFuture<'_, Option<ContentNode>>;

    /// Replace the subtree at `path`, creating missing ancestors.
    fn write(&self, path: &str, node: ContentNode) -> BoxFuture<'_, ()>;

    /// Remove the subtree at `path`. Returns `false` if it was absent.
    fn remove(&self, path: &str) -> BoxFuture<'_, bool>;

    /// Check whether a node exists at `path`.
    fn exists(&self, path: &str) -> BoxFuture<'_, bool> {
        let path = path.to_string();
        Box::pin(async move { Ok(self.read(&path).await?.is_some()) })
    }
}

/// Split an absolute path into its segments.
fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A content tree held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    root: RwLock<ContentNode>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the tree, excluding the root.
    pub async fn node_count(&self) -> usize {
        self.root.read().await.node_count() - 1
    }
}

impl ContentRepository for InMemoryRepository {
    fn read(&self, path: &str) -> BoxFuture<'_, Option<ContentNode>> {
        let path = path.to_string();
        Box::pin(async move {
            let root = self.root.read().await;
            let mut node = &*root;
            for segment in segments(&path) {
                match node.children.get(segment) {
                    Some(child) => node = child,
                    None => return Ok(None),
                }
            }
            Ok(Some(node.clone()))
        })
    }

    fn write(&self, path: &str, content: ContentNode) -> BoxFuture<'_, ()> {
        let path = path.to_string();
        Box::pin(async move {
            let mut root = self.root.write().await;
            let parts = segments(&path);
            let Some((last, parents)) = parts.split_last() else {
                *root = content;
                return Ok(());
            };
            let mut node = &mut *root;
            for segment in parents {
                node = node.children.entry((*segment).to_string()).or_default();
            }
            node.children.insert((*last).to_string(), content);
            trace!(path = %path, "In-memory write");
            Ok(())
        })
    }

    fn remove(&self, path: &str) -> BoxFuture<'_, bool> {
        let path = path.to_string();
        Box::pin(async move {
            let mut root = self.root.write().await;
            let parts = segments(&path);
            let Some((last, parents)) = parts.split_last() else {
                let had_content = !root.children.is_empty() || !root.properties.is_empty();
                *root = ContentNode::default();
                return Ok(had_content);
            };
            let mut node = &mut *root;
            for segment in parents {
                match node.children.get_mut(*segment) {
                    Some(child) => node = child,
                    None => return Ok(false),
                }
            }
            Ok(node.children.remove(*last).is_some())
        })
    }
}

fn export_error(path: &str, e: RepositoryError) -> DistributionError {
    DistributionError::Export {
        path: path.to_string(),
        message: e.to_string(),
    }
}

fn import_error(package_id: &str, e: RepositoryError) -> DistributionError {
    match e {
        RepositoryError::Unavailable(message) => DistributionError::Import {
            package_id: package_id.to_string(),
            message,
        },
        RepositoryError::Rejected(message) => DistributionError::ImportRejected {
            package_id: package_id.to_string(),
            message,
        },
    }
}

/// Build a package from the current state of `repo`.
pub async fn export<R>(repo: &R, request: &DistributionRequest) -> Result<DistributionPackage>
where
    R: ContentRepository + ?Sized,
{
    request.validate()?;

    let payload = match request.kind {
        DistributionRequestType::Add => {
            let mut entries = Vec::with_capacity(request.paths.len());
            for path in &request.paths {
                let node = repo
                    .read(path)
                    .await
                    .map_err(|e| export_error(path, e))?
                    .ok_or_else(|| DistributionError::not_found("path", path.clone()))?;
                entries.push(SnapshotEntry {
                    path: path.clone(),
                    node,
                });
            }
            PackagePayload::Snapshot { entries }
        }
        DistributionRequestType::Delete => PackagePayload::Deletion,
        DistributionRequestType::Test => PackagePayload::Empty,
        DistributionRequestType::Pull => {
            return Err(DistributionError::Validation(
                "PULL requests are served from passive queues, not exported".to_string(),
            ));
        }
    };

    let package = DistributionPackage::new(request.kind, request.paths.clone(), payload)?;
    debug!(
        package_id = %package.id,
        kind = %package.kind,
        paths = ?package.paths,
        nodes = package.node_count(),
        "Exported package"
    );
    Ok(package)
}

/// Apply a package to `repo`.
pub async fn import<R>(repo: &R, package: &DistributionPackage) -> Result<ImportOutcome>
where
    R: ContentRepository + ?Sized,
{
    package.verify()?;

    let mut changed = false;
    match (&package.kind, &package.payload) {
        (DistributionRequestType::Add, PackagePayload::Snapshot { entries }) => {
            for entry in entries {
                let current = repo
                    .read(&entry.path)
                    .await
                    .map_err(|e| import_error(&package.id, e))?;
                if current.as_ref() == Some(&entry.node) {
                    continue;
                }
                repo.write(&entry.path, entry.node.clone())
                    .await
                    .map_err(|e| import_error(&package.id, e))?;
                changed = true;
            }
        }
        (DistributionRequestType::Delete, PackagePayload::Deletion) => {
            for path in &package.paths {
                let removed = repo
                    .remove(path)
                    .await
                    .map_err(|e| import_error(&package.id, e))?;
                changed |= removed;
            }
        }
        (DistributionRequestType::Test, PackagePayload::Empty) => {}
        (kind, _) => {
            return Err(DistributionError::MalformedPackage(format!(
                "package {} has type {} with a mismatched payload",
                package.id, kind
            )));
        }
    }

    let outcome = if changed {
        ImportOutcome::Applied
    } else {
        ImportOutcome::NoOp
    };
    debug!(package_id = %package.id, kind = %package.kind, ?outcome, "Imported package");
    Ok(outcome)
}
