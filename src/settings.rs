// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence of agent settings resources.
//!
//! The host decides where settings actually live; the engine only needs to
//! write, read, and delete a flat property map at a path. Agent configs are
//! written to `<settings_root>/<name>` and, when `etc.enabled` is set, also
//! mirrored to `<mirror_root>/<name>`.

use crate::error::{DistributionError, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;
use tracing::debug;

/// Flat property map of a settings resource.
pub type Properties = BTreeMap<String, String>;

/// Boxed future returned by settings stores.
pub type SettingsFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Where agent settings are persisted.
pub trait SettingsStore: Send + Sync + 'static {
    /// Properties stored at `path`, if any.
    fn read(&self, path: &str) -> SettingsFuture<'_, Option<Properties>>;

    /// Create or replace the properties at `path`.
    fn write(&self, path: &str, properties: Properties) -> SettingsFuture<'_, ()>;

    /// Delete `path`. Returns `false` if nothing was there.
    fn delete(&self, path: &str) -> SettingsFuture<'_, bool>;

    /// Names of the direct children of `parent`, sorted.
    fn list(&self, parent: &str) -> SettingsFuture<'_, Vec<String>>;
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Properties>,
    /// Writes under these prefixes fail.
    failing: Vec<String>,
}

/// Settings held in memory.
///
/// Supports failure injection so partial config writes can be exercised.
#[derive(Default)]
pub struct InMemorySettingsStore {
    inner: RwLock<Inner>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write under `prefix` fail until cleared.
    pub async fn fail_writes_under(&self, prefix: impl Into<String>) {
        self.inner.write().await.failing.push(prefix.into());
    }

    pub async fn clear_failures(&self) {
        self.inner.write().await.failing.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn trim_path(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

impl SettingsStore for InMemorySettingsStore {
    fn read(&self, path: &str) -> SettingsFuture<'_, Option<Properties>> {
        let path = trim_path(path);
        Box::pin(async move { Ok(self.inner.read().await.entries.get(&path).cloned()) })
    }

    fn write(&self, path: &str, properties: Properties) -> SettingsFuture<'_, ()> {
        let path = trim_path(path);
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            if inner.failing.iter().any(|prefix| path.starts_with(prefix.as_str())) {
                return Err(DistributionError::Settings(format!("write to {} failed", path)));
            }
            debug!(path = %path, properties = properties.len(), "Settings written");
            inner.entries.insert(path, properties);
            Ok(())
        })
    }

    fn delete(&self, path: &str) -> SettingsFuture<'_, bool> {
        let path = trim_path(path);
        Box::pin(async move { Ok(self.inner.write().await.entries.remove(&path).is_some()) })
    }

    fn list(&self, parent: &str) -> SettingsFuture<'_, Vec<String>> {
        let prefix = format!("{}/", trim_path(parent));
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .entries
                .keys()
                .filter_map(|key| key.strip_prefix(prefix.as_str()))
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
                .collect())
        })
    }
}
