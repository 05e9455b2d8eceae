// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Agent registry.
//!
//! The administrative surface of the engine. Owns every configured
//! [`DistributionAgent`] and exposes config CRUD, distribution, package
//! export/import, and queue/log inspection as transport-agnostic calls.
//!
//! # Config Writes
//!
//! A config write persists the agent's properties at
//! `<settings_root>/<name>` and, with `etc.enabled`, mirrors them at
//! `<mirror_root>/<name>`. The two writes are kept in lockstep: if the mirror
//! write fails the primary is restored to what it was before.
//!
//! Config changes serialize through one admin lock. Requests against agents
//! (distribute, pull, queue admin) do not take it.

use crate::agent::{DistributionAgent, DistributionResponse};
use crate::config::{AgentConfig, ConfigLoader, DistributionSettings, EngineConfig};
use crate::endpoint::EndpointResolver;
use crate::error::{DistributionError, Result};
use crate::metrics;
use crate::package::{is_compressed, DistributionPackage, DistributionRequest, DistributionRequestType};
use crate::queue::DistributionQueue;
use crate::repository::{self, ContentRepository, ImportOutcome};
use crate::resources::{AgentListResource, LogResource, QueueItemView, QueueResource, SettingResource};
use crate::settings::{Properties, SettingsStore};
use crate::store::QueueStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Registry of the agents running on this instance.
pub struct AgentRegistry {
    agents: DashMap<String, Arc<DistributionAgent>>,

    /// Serializes config create/update/delete.
    admin: Mutex<()>,

    repository: Arc<dyn ContentRepository>,
    resolver: Arc<dyn EndpointResolver>,
    settings_store: Arc<dyn SettingsStore>,
    queue_store: Option<Arc<QueueStore>>,
    settings: DistributionSettings,
}

impl AgentRegistry {
    pub fn new(
        settings: DistributionSettings,
        repository: Arc<dyn ContentRepository>,
        resolver: Arc<dyn EndpointResolver>,
        settings_store: Arc<dyn SettingsStore>,
        queue_store: Option<Arc<QueueStore>>,
    ) -> Self {
        Self {
            agents: DashMap::new(),
            admin: Mutex::new(()),
            repository,
            resolver,
            settings_store,
            queue_store,
            settings,
        }
    }

    /// Build a registry from loaded configuration and start its agents.
    ///
    /// Agents named in `config` are created first; agents persisted in the
    /// settings store by earlier runtime writes are loaded after them.
    pub async fn bootstrap(
        config: EngineConfig,
        repository: Arc<dyn ContentRepository>,
        resolver: Arc<dyn EndpointResolver>,
        settings_store: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        ConfigLoader::validate(&config)?;

        let queue_store = if config.store.enabled {
            Some(QueueStore::from_config(&config.store).await?)
        } else {
            None
        };

        info!(
            node_id = %config.node_id,
            role = ?config.role,
            agents = config.agents.len(),
            persistent_queues = queue_store.is_some(),
            "Bootstrapping distribution engine"
        );

        let registry = Self::new(config.settings, repository, resolver, settings_store, queue_store);
        {
            let _guard = registry.admin.lock().await;
            for agent_config in config.agents {
                registry.install(agent_config, true).await?;
            }
        }
        registry.load_persisted().await?;
        Ok(registry)
    }

    /// Start agents whose configs exist in the settings store but are not
    /// running yet. Returns how many were started.
    ///
    /// A persisted config that no longer parses is skipped with a warning.
    pub async fn load_persisted(&self) -> Result<usize> {
        let _guard = self.admin.lock().await;
        let root = self.settings.resources.settings_root.clone();
        let mut loaded = 0;

        for name in self.settings_store.list(&root).await? {
            if self.agents.contains_key(&name) {
                continue;
            }
            let path = self.settings.resources.settings_path(&name);
            let Some(properties) = self.settings_store.read(&path).await? else {
                continue;
            };
            let config = match AgentConfig::from_options(&name, &properties) {
                Ok(config) => config,
                Err(e) => {
                    warn!(agent = %name, path = %path, error = %e, "Skipping unreadable persisted agent config");
                    continue;
                }
            };
            self.install(config, false).await?;
            loaded += 1;
        }

        if loaded > 0 {
            info!(agents = loaded, "Loaded persisted agent configs");
        }
        Ok(loaded)
    }

    pub fn settings(&self) -> &DistributionSettings {
        &self.settings
    }

    pub fn queue_store(&self) -> Option<&Arc<QueueStore>> {
        self.queue_store.as_ref()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agent(&self, name: &str) -> Result<Arc<DistributionAgent>> {
        self.agents
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DistributionError::not_found("agent", name))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Config resources
    // ═══════════════════════════════════════════════════════════════════════════

    /// Create and start an agent. Fails with `Conflict` if the name is taken.
    pub async fn create_agent_config(&self, name: &str, options: &Properties) -> Result<SettingResource> {
        let _guard = self.admin.lock().await;
        if self.agents.contains_key(name) {
            return Err(DistributionError::Conflict(name.to_string()));
        }

        let config = AgentConfig::from_options(name, options)?;
        let agent = self.install(config, true).await?;
        Ok(setting_resource(&agent.config()))
    }

    pub fn get_agent_config(&self, name: &str) -> Result<SettingResource> {
        Ok(setting_resource(&self.agent(name)?.config()))
    }

    /// Merge `updates` into an agent's config.
    ///
    /// Changes that keep the queue topology (exporter, mirroring, extra
    /// options) apply in place. Anything else rebuilds the agent: the old
    /// workers are joined and surviving queues keep their items.
    pub async fn update_agent_config(&self, name: &str, updates: &Properties) -> Result<SettingResource> {
        let _guard = self.admin.lock().await;
        let current = self.agent(name)?;
        let old_config = current.config();
        let new_config = old_config.merged_with(updates)?;

        if old_config.same_topology(&new_config) {
            self.persist(&new_config, Some(&old_config)).await?;
            current.update_config(new_config.clone())?;
            metrics::record_config_change(name, "update");
            current.log().info("agent config updated");
            info!(agent = %name, "Agent config updated in place");
            return Ok(setting_resource(&new_config));
        }

        // Build before touching anything so a bad endpoint leaves the old agent running.
        let replacement = Arc::new(self.build(new_config.clone())?);
        self.persist(&new_config, Some(&old_config)).await?;
        current.shutdown().await;

        for old_queue in current.queues() {
            match replacement.queue(old_queue.name()) {
                Some(new_queue) => {
                    if self.queue_store.is_none() {
                        new_queue.adopt(old_queue.list_items().await).await;
                    }
                }
                None => {
                    let dropped = old_queue.purge(usize::MAX).await?;
                    if dropped > 0 {
                        warn!(agent = %name, queue = %old_queue.name(), dropped, "Queue removed by config update, items dropped");
                    }
                }
            }
        }

        self.agents.insert(name.to_string(), Arc::clone(&replacement));
        replacement.start().await?;

        metrics::record_config_change(name, "update");
        replacement.log().info("agent rebuilt after topology change");
        info!(agent = %name, queues = replacement.queues().len(), "Agent rebuilt for new topology");
        Ok(setting_resource(&new_config))
    }

    /// Stop an agent and discard its config and queues.
    ///
    /// Workers are joined before any queue state is dropped.
    pub async fn delete_agent_config(&self, name: &str) -> Result<()> {
        let _guard = self.admin.lock().await;
        let (_, agent) = self
            .agents
            .remove(name)
            .ok_or_else(|| DistributionError::not_found("agent", name))?;

        agent.shutdown().await;
        self.remove_settings(&agent.config()).await?;
        if let Some(store) = &self.queue_store {
            let rows = store.delete_agent(name).await?;
            debug!(agent = %name, rows, "Deleted persisted queue items");
        }

        metrics::record_config_change(name, "delete");
        metrics::set_agents(self.agents.len());
        info!(agent = %name, "Agent deleted");
        Ok(())
    }

    pub fn list_agents(&self) -> AgentListResource {
        let mut names: Vec<String> = self.agents.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        AgentListResource::new(names)
    }

    fn build(&self, config: AgentConfig) -> Result<DistributionAgent> {
        DistributionAgent::new(
            config,
            &self.settings,
            Arc::clone(&self.repository),
            self.resolver.as_ref(),
            self.queue_store.clone(),
        )
    }

    /// Build, persist, and start an agent. Caller holds the admin lock.
    async fn install(&self, config: AgentConfig, persist: bool) -> Result<Arc<DistributionAgent>> {
        let name = config.name.clone();
        let agent = Arc::new(self.build(config.clone())?);

        if persist {
            self.persist(&config, None).await?;
        }
        if let Err(e) = agent.start().await {
            error!(agent = %name, error = %e, "Agent failed to start");
            agent.shutdown().await;
            if persist {
                if let Err(cleanup) = self.remove_settings(&config).await {
                    warn!(agent = %name, error = %cleanup, "Failed to remove settings of agent that did not start");
                }
            }
            return Err(e);
        }

        self.agents.insert(name.clone(), Arc::clone(&agent));
        metrics::record_config_change(&name, "create");
        metrics::set_agents(self.agents.len());
        info!(agent = %name, kind = %config.kind, "Agent created");
        Ok(agent)
    }

    /// Write the primary settings resource and its mirror as one unit.
    async fn persist(&self, config: &AgentConfig, previous: Option<&AgentConfig>) -> Result<()> {
        let roots = &self.settings.resources;
        let primary = roots.settings_path(&config.name);
        let properties = config.to_properties();

        let prior = self.settings_store.read(&primary).await?;
        self.settings_store.write(&primary, properties.clone()).await?;

        let mirror = roots.mirror_path(&config.name);
        if config.etc_enabled {
            if let Err(e) = self.settings_store.write(&mirror, properties).await {
                warn!(agent = %config.name, mirror = %mirror, error = %e, "Mirror write failed, rolling back primary");
                let rollback = match prior {
                    Some(prior) => self.settings_store.write(&primary, prior).await,
                    None => self.settings_store.delete(&primary).await.map(|_| ()),
                };
                if let Err(rollback_err) = rollback {
                    error!(agent = %config.name, error = %rollback_err, "Rollback of primary settings failed");
                }
                return Err(e);
            }
        } else if previous.is_some_and(|p| p.etc_enabled) {
            self.settings_store.delete(&mirror).await?;
        }
        Ok(())
    }

    async fn remove_settings(&self, config: &AgentConfig) -> Result<()> {
        let roots = &self.settings.resources;
        self.settings_store.delete(&roots.settings_path(&config.name)).await?;
        if config.etc_enabled {
            self.settings_store.delete(&roots.mirror_path(&config.name)).await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Distribution
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn distribute(&self, agent: &str, request: &DistributionRequest) -> Result<DistributionResponse> {
        self.agent(agent)?.distribute(request).await
    }

    /// Export packages as wire bytes.
    ///
    /// ADD/DELETE/TEST export the local repository directly and enqueue
    /// nothing. PULL drains a passive queue; `exporter` is either an agent
    /// name (its first passive queue) or `<agent>-<queue>`.
    pub async fn export(
        &self,
        exporter: &str,
        kind: DistributionRequestType,
        paths: &[String],
    ) -> Result<Vec<Vec<u8>>> {
        if kind == DistributionRequestType::Pull {
            let (agent, queue) = self.resolve_exporter(exporter)?;
            let packages = agent.pull(queue.as_deref()).await?;
            return packages.iter().map(|p| encode(p)).collect();
        }

        self.agent(exporter)?;
        let request = DistributionRequest::new(kind, paths.iter().cloned());
        let package = match repository::export(self.repository.as_ref(), &request).await {
            Ok(package) => package,
            Err(e) => {
                metrics::record_export(exporter, &kind.to_string(), false, 0);
                return Err(e);
            }
        };
        metrics::record_export(exporter, &kind.to_string(), true, package.node_count());
        Ok(vec![encode(&package)?])
    }

    /// Apply a package received for `agent` to the local repository.
    pub async fn import(&self, agent: &str, bytes: &[u8]) -> Result<ImportOutcome> {
        let agent = self.agent(agent)?;

        let package = match DistributionPackage::from_bytes(bytes) {
            Ok(package) => package,
            Err(e) => {
                metrics::record_import("unknown", "malformed");
                agent.log().error(format!("received package could not be decoded: {}", e));
                return Err(e);
            }
        };
        metrics::record_package_bytes(bytes.len(), is_compressed(bytes));

        let kind = package.kind.to_string();
        match repository::import(self.repository.as_ref(), &package).await {
            Ok(outcome) => {
                let label = match outcome {
                    ImportOutcome::Applied => "applied",
                    ImportOutcome::NoOp => "noop",
                };
                metrics::record_import(&kind, label);
                agent
                    .log()
                    .info(format!("package {} ({} {:?}) imported [{}]", package.id, kind, package.paths, label));
                Ok(outcome)
            }
            Err(e) => {
                metrics::record_import(&kind, "failed");
                agent.log().error(format!("import of package {} failed: {}", package.id, e));
                Err(e)
            }
        }
    }

    /// Resolve an exporter name to an agent and optional queue.
    fn resolve_exporter(&self, exporter: &str) -> Result<(Arc<DistributionAgent>, Option<String>)> {
        if let Ok(agent) = self.agent(exporter) {
            return Ok((agent, None));
        }
        // Longest agent name first: "publish-reverse-default" prefers agent
        // "publish-reverse" over "publish".
        let splits: Vec<usize> = exporter.match_indices('-').map(|(i, _)| i).collect();
        for idx in splits.into_iter().rev() {
            let (agent_name, queue_name) = (&exporter[..idx], &exporter[idx + 1..]);
            if let Ok(agent) = self.agent(agent_name) {
                if agent.queue(queue_name).is_some() {
                    return Ok((agent, Some(queue_name.to_string())));
                }
            }
        }
        Err(DistributionError::not_found("exporter", exporter))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queues and logs
    // ═══════════════════════════════════════════════════════════════════════════

    fn queue(&self, agent: &str, queue: &str) -> Result<(Arc<DistributionAgent>, Arc<DistributionQueue>)> {
        let agent = self.agent(agent)?;
        let queue = agent
            .queue(queue)
            .cloned()
            .ok_or_else(|| DistributionError::not_found("queue", format!("{}/{}", agent.name(), queue)))?;
        Ok((agent, queue))
    }

    pub async fn get_queue(&self, agent: &str, queue: &str) -> Result<QueueResource> {
        let (_, queue) = self.queue(agent, queue)?;
        Ok(QueueResource::snapshot(&queue).await)
    }

    /// Delete up to `limit` oldest items.
    pub async fn purge_queue(&self, agent: &str, queue: &str, limit: usize) -> Result<usize> {
        let (agent, queue) = self.queue(agent, queue)?;
        let removed = queue.purge(limit).await?;
        agent
            .log()
            .info(format!("purged {} items from queue {}", removed, queue.name()));
        Ok(removed)
    }

    /// Move an ERROR item back to QUEUED.
    pub async fn retry_queue_item(&self, agent: &str, queue: &str, item_id: &str) -> Result<QueueItemView> {
        let (agent, queue) = self.queue(agent, queue)?;
        let item = queue.retry(item_id).await?;
        agent
            .log()
            .info(format!("item {} in queue {} re-queued", item_id, queue.name()));
        Ok(QueueItemView::from(&item))
    }

    pub async fn remove_queue_item(&self, agent: &str, queue: &str, item_id: &str) -> Result<QueueItemView> {
        let (agent, queue) = self.queue(agent, queue)?;
        let item = queue.remove(item_id).await?;
        agent
            .log()
            .info(format!("item {} removed from queue {}", item_id, queue.name()));
        Ok(QueueItemView::from(&item))
    }

    pub fn get_agent_log(&self, agent: &str) -> Result<LogResource> {
        let agent = self.agent(agent)?;
        Ok(LogResource::new(agent.name(), agent.log().entries()))
    }

    /// Stop every agent and close the queue store.
    pub async fn shutdown_all(&self) {
        let _guard = self.admin.lock().await;
        let agents: Vec<Arc<DistributionAgent>> = self.agents.iter().map(|e| Arc::clone(e.value())).collect();
        info!(agents = agents.len(), "Shutting down all agents");

        for agent in agents {
            agent.shutdown().await;
        }
        if let Some(store) = &self.queue_store {
            if let Err(e) = store.checkpoint().await {
                warn!(error = %e, "Queue store checkpoint failed");
            }
            store.close().await;
        }
    }
}

fn setting_resource(config: &AgentConfig) -> SettingResource {
    SettingResource::new(config.name.clone(), config.to_properties())
}

fn encode(package: &DistributionPackage) -> Result<Vec<u8>> {
    let bytes = package.to_bytes()?;
    metrics::record_package_bytes(bytes.len(), is_compressed(&bytes));
    Ok(bytes)
}
