// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the distribution engine.
//!
//! This module defines all configuration types needed to run the engine.
//! Configuration can be constructed programmatically, loaded in layers with
//! [`ConfigLoader`], or built from the flat option maps the agent
//! configuration resource receives ([`AgentConfig::from_options()`]).
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── node_id: String              # This instance's ID
//! ├── role: Option<String>         # "author" / "publish" (informational)
//! ├── settings: DistributionSettings
//! │   ├── delivery: DeliveryConfig # retry, backoff, circuit, rate limit
//! │   ├── queue: QueueSettings     # default capacity
//! │   ├── log: LogSettings         # agent log ring size
//! │   └── resources: ResourceRoots # settings and mirror locations
//! ├── agents: Vec<AgentConfig>     # agents created at bootstrap
//! └── store: StoreConfig           # SQLite queue persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "author-1"
//! role: author
//!
//! settings:
//!   delivery:
//!     max_attempts: 5
//!     initial_backoff: "500ms"
//!     max_backoff: "5m"
//!
//! agents:
//!   - name: publish
//!     type: forward
//!     endpoints:
//!       - name: publish
//!         uri: "repo://publish"
//!   - name: publish-reverse
//!     type: reverse
//!
//! store:
//!   enabled: true
//!   sqlite_path: "/var/lib/distribution/queues.db"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{DistributionError, Result};
use crate::queue::{QueueMode, QueueSpec};
use crate::resilience::{RateLimitConfig, RetryConfig};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `AgentRegistry::bootstrap()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The identity of the instance running this engine.
    pub node_id: String,

    /// Deployment role the bundled agents were loaded for.
    #[serde(default)]
    pub role: Option<String>,

    /// Tunable parameters shared by all agents.
    #[serde(default)]
    pub settings: DistributionSettings,

    /// Agents to create at bootstrap.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    /// Queue persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.node.default".to_string(),
            role: None,
            settings: DistributionSettings::default(),
            agents: Vec::new(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            role: None,
            settings: DistributionSettings::for_testing(),
            agents: Vec::new(),
            store: StoreConfig::default(),
        }
    }
}

/// General settings shared by all agents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DistributionSettings {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub resources: ResourceRoots,
}

impl DistributionSettings {
    /// Fast retries and short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            delivery: DeliveryConfig::for_testing(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeliveryConfig: retry policy for delivery workers
// ═══════════════════════════════════════════════════════════════════════════════

/// Delivery worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts before an item moves to the ERROR state.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt, as a duration string (e.g., "500ms").
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,

    /// Backoff ceiling.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// How long agent shutdown waits for each worker to finish.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Consecutive endpoint failures before its circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long an open circuit waits before probing the endpoint again.
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (thundering herd prevention)
    // ─────────────────────────────────────────────────────────────────────────

    /// Limit import calls per agent.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained imports per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst allowance above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> String {
    "500ms".to_string()
}

fn default_max_backoff() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: "500ms".to_string(),
            max_backoff: "5m".to_string(),
            backoff_factor: 2.0,
            drain_timeout: "10s".to_string(),
            circuit_failure_threshold: 5,
            circuit_reset_timeout: "30s".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

/// Parse a duration string, falling back when it is malformed.
fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

impl DeliveryConfig {
    /// Fast-fail delivery for tests.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: "10ms".to_string(),
            max_backoff: "50ms".to_string(),
            backoff_factor: 2.0,
            drain_timeout: "2s".to_string(),
            circuit_failure_threshold: 50,
            circuit_reset_timeout: "50ms".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }

    /// Retry policy for delivery workers.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: parse_duration_or(&self.initial_backoff, Duration::from_millis(500)),
            max_delay: parse_duration_or(&self.max_backoff, Duration::from_secs(300)),
            backoff_factor: self.backoff_factor,
        }
    }

    /// Circuit breaker settings for each endpoint.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: 1,
            recovery_timeout: parse_duration_or(&self.circuit_reset_timeout, Duration::from_secs(30)),
        }
    }

    /// Parse the drain timeout, defaulting to 10 seconds.
    pub fn drain_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.drain_timeout, Duration::from_secs(10))
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DistributionError::Config(
                "delivery.max_attempts cannot be 0".to_string(),
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(DistributionError::Config(format!(
                "delivery.backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        let retry = self.retry_config();
        if retry.initial_delay > retry.max_delay {
            return Err(DistributionError::Config(format!(
                "delivery.initial_backoff ({}) exceeds delivery.max_backoff ({})",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

/// Queue defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueSettings {
    /// Capacity for queues whose agent sets none. `None` = unbounded.
    #[serde(default)]
    pub default_capacity: Option<usize>,
}

/// Agent log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Entries kept per agent before the oldest are dropped.
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
}

fn default_log_capacity() -> usize {
    1000
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Where agent settings resources live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRoots {
    /// Primary location of agent settings.
    #[serde(default = "default_settings_root")]
    pub settings_root: String,

    /// Shared location mirrored when `etc.enabled` is set.
    #[serde(default = "default_mirror_root")]
    pub mirror_root: String,
}

fn default_settings_root() -> String {
    "/libs/distribution/settings/agents".to_string()
}

fn default_mirror_root() -> String {
    "/etc/distribution".to_string()
}

impl Default for ResourceRoots {
    fn default() -> Self {
        Self {
            settings_root: default_settings_root(),
            mirror_root: default_mirror_root(),
        }
    }
}

impl ResourceRoots {
    pub fn settings_path(&self, agent: &str) -> String {
        format!("{}/{}", self.settings_root.trim_end_matches('/'), agent)
    }

    pub fn mirror_path(&self, agent: &str) -> String {
        format!("{}/{}", self.mirror_root.trim_end_matches('/'), agent)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: queue persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue persistence configuration.
///
/// When enabled, every queue mutation is written through to SQLite so queued
/// items survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Path to SQLite database for queue storage.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_sqlite_path() -> String {
    "distribution_queues.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            enabled: true,
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    /// Persist to the given file.
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            enabled: true,
            sqlite_path: path.into(),
            wal_mode: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AgentConfig: one entry per agent
// ═══════════════════════════════════════════════════════════════════════════════

/// Option keys understood by [`AgentConfig::from_options()`].
pub mod keys {
    pub const NAME: &str = "name";
    pub const TYPE: &str = "type";
    pub const PACKAGE_EXPORTER: &str = "packageExporter";
    pub const ETC_ENABLED: &str = "etc.enabled";
    pub const ENDPOINTS: &str = "endpoints";
    pub const PASSIVE_QUEUES: &str = "passiveQueues";
    pub const QUEUE_CAPACITY: &str = "queue.capacity";
}

/// Replication topology of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// One-to-one push.
    Forward,
    /// Content waits in passive queues for a downstream PULL.
    Reverse,
    /// Push to every endpoint of a synchronized group.
    Sync,
    /// One-to-many push with independent failure domains.
    #[serde(alias = "publish-multiple")]
    MultipleEndpoint,
}

impl AgentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "forward" => Some(Self::Forward),
            "reverse" => Some(Self::Reverse),
            "sync" => Some(Self::Sync),
            "multiple-endpoint" | "publish-multiple" => Some(Self::MultipleEndpoint),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
            Self::Sync => "sync",
            Self::MultipleEndpoint => "multiple-endpoint",
        }
    }

    /// Whether this topology pushes to its endpoints.
    pub fn pushes(&self) -> bool {
        !matches!(self, Self::Reverse)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name; also the name of its queue.
    pub name: String,
    /// Locator the [`EndpointResolver`](crate::endpoint::EndpointResolver) understands.
    pub uri: String,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
        }
    }
}

/// Name of the passive queue reverse agents get when none is configured.
pub const DEFAULT_PASSIVE_QUEUE: &str = "default";

/// Configuration for a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: AgentKind,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Queues that only release content on an explicit PULL.
    #[serde(default)]
    pub passive_queues: Vec<String>,

    /// Exporter locator, informational to this engine.
    #[serde(default)]
    pub package_exporter: Option<String>,

    /// Mirror the settings under the shared mirror root.
    #[serde(default)]
    pub etc_enabled: bool,

    /// Capacity of each queue of this agent. `None` = settings default.
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Unrecognized options, kept verbatim.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(DistributionError::Validation(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoints: Vec::new(),
            passive_queues: Vec::new(),
            package_exporter: None,
            etc_enabled: false,
            queue_capacity: None,
            options: BTreeMap::new(),
        }
    }

    /// Builder-style endpoint setter.
    pub fn with_endpoint(mut self, name: impl Into<String>, uri: impl Into<String>) -> Self {
        self.endpoints.push(EndpointConfig::new(name, uri));
        self
    }

    /// Builder-style passive queue setter.
    pub fn with_passive_queue(mut self, name: impl Into<String>) -> Self {
        self.passive_queues.push(name.into());
        self
    }

    /// Build from the flat option map of a config resource write.
    ///
    /// `type` is required. `endpoints` is a comma list of `name=uri`
    /// entries; a bare `uri` is named `endpoint<N>` (1-based).
    pub fn from_options(name: &str, options: &BTreeMap<String, String>) -> Result<Self> {
        if let Some(given) = options.get(keys::NAME) {
            if given != name {
                return Err(DistributionError::Validation(format!(
                    "name option {:?} does not match agent {:?}",
                    given, name
                )));
            }
        }

        let kind_str = options
            .get(keys::TYPE)
            .ok_or_else(|| DistributionError::Validation("missing option: type".to_string()))?;
        let kind = AgentKind::parse(kind_str).ok_or_else(|| {
            DistributionError::Validation(format!("unknown agent type: {}", kind_str))
        })?;

        let mut config = Self::new(name, kind);

        for (key, value) in options {
            match key.as_str() {
                keys::NAME | keys::TYPE => {}
                keys::PACKAGE_EXPORTER => config.package_exporter = Some(value.clone()),
                keys::ETC_ENABLED => config.etc_enabled = parse_bool(key, value)?,
                keys::ENDPOINTS => {
                    for (i, entry) in split_list(value).enumerate() {
                        let endpoint = match entry.split_once('=') {
                            Some((ep_name, uri)) => EndpointConfig::new(ep_name.trim(), uri.trim()),
                            None => EndpointConfig::new(format!("endpoint{}", i + 1), entry),
                        };
                        config.endpoints.push(endpoint);
                    }
                }
                keys::PASSIVE_QUEUES => {
                    config.passive_queues = split_list(value).map(str::to_string).collect();
                }
                keys::QUEUE_CAPACITY => {
                    let capacity = value.trim().parse::<usize>().map_err(|_| {
                        DistributionError::Validation(format!(
                            "{} must be a non-negative integer, got {:?}",
                            key, value
                        ))
                    })?;
                    config.queue_capacity = Some(capacity);
                }
                _ => {
                    config.options.insert(key.clone(), value.clone());
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Flatten to the option map a config resource exposes.
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = self.options.clone();
        props.insert(keys::NAME.to_string(), self.name.clone());
        props.insert(keys::TYPE.to_string(), self.kind.as_str().to_string());
        if let Some(exporter) = &self.package_exporter {
            props.insert(keys::PACKAGE_EXPORTER.to_string(), exporter.clone());
        }
        if self.etc_enabled {
            props.insert(keys::ETC_ENABLED.to_string(), "true".to_string());
        }
        if !self.endpoints.is_empty() {
            let joined = self
                .endpoints
                .iter()
                .map(|e| format!("{}={}", e.name, e.uri))
                .collect::<Vec<_>>()
                .join(",");
            props.insert(keys::ENDPOINTS.to_string(), joined);
        }
        if !self.passive_queues.is_empty() {
            props.insert(keys::PASSIVE_QUEUES.to_string(), self.passive_queues.join(","));
        }
        if let Some(capacity) = self.queue_capacity {
            props.insert(keys::QUEUE_CAPACITY.to_string(), capacity.to_string());
        }
        props
    }

    /// Apply an option update on top of this config.
    pub fn merged_with(&self, updates: &BTreeMap<String, String>) -> Result<Self> {
        let mut options = self.to_properties();
        for (key, value) in updates {
            options.insert(key.clone(), value.clone());
        }
        Self::from_options(&self.name, &options)
    }

    /// Whether two configs would build the same queues and workers.
    pub fn same_topology(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.endpoints == other.endpoints
            && self.passive_queues == other.passive_queues
            && self.queue_capacity == other.queue_capacity
    }

    /// Queues an agent with this config owns, in delivery order.
    ///
    /// Pushing topologies get one active queue per endpoint followed by the
    /// passive queues. Reverse agents only get passive queues.
    pub fn queue_specs(&self) -> Vec<QueueSpec> {
        let mut specs = Vec::new();
        if self.kind.pushes() {
            for endpoint in &self.endpoints {
                specs.push(QueueSpec {
                    name: endpoint.name.clone(),
                    mode: QueueMode::Active,
                    endpoint: Some(endpoint.clone()),
                });
            }
        }
        for name in &self.passive_queues {
            specs.push(QueueSpec {
                name: name.clone(),
                mode: QueueMode::Passive,
                endpoint: None,
            });
        }
        if self.kind == AgentKind::Reverse && self.passive_queues.is_empty() {
            specs.push(QueueSpec {
                name: DEFAULT_PASSIVE_QUEUE.to_string(),
                mode: QueueMode::Passive,
                endpoint: None,
            });
        }
        specs
    }

    /// Check names and topology constraints.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DistributionError::Validation("agent name cannot be empty".to_string()));
        }
        if self.name.contains('/') {
            return Err(DistributionError::Validation(format!(
                "agent name cannot contain '/': {}",
                self.name
            )));
        }
        if self.kind == AgentKind::Forward && self.endpoints.len() > 1 {
            return Err(DistributionError::Validation(format!(
                "forward agent {} has {} endpoints; use multiple-endpoint",
                self.name,
                self.endpoints.len()
            )));
        }

        let mut seen = HashSet::new();
        for spec in self.queue_specs() {
            if spec.name.is_empty() || spec.name.contains('/') {
                return Err(DistributionError::Validation(format!(
                    "invalid queue name {:?} in agent {}",
                    spec.name, self.name
                )));
            }
            if !seen.insert(spec.name.clone()) {
                return Err(DistributionError::Validation(format!(
                    "duplicate queue name {:?} in agent {}",
                    spec.name, self.name
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConfigLoader: layered loading
// ═══════════════════════════════════════════════════════════════════════════════

/// Environment variable prefix for overrides (`DISTRIBUTION_SETTINGS__DELIVERY__MAX_ATTEMPTS=3`).
pub const ENV_PREFIX: &str = "DISTRIBUTION_";

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. The YAML file at `path`
    /// 3. Environment variables (`DISTRIBUTION_*`, `__` separates levels)
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DistributionError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(EngineConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Load the bundled agents for a deployment role from `<dir>/<role>.yaml`.
    pub fn load_role(dir: impl AsRef<Path>, role: &str) -> Result<EngineConfig> {
        let mut config = Self::load_from_file(dir.as_ref().join(format!("{}.yaml", role)))?;
        config.role.get_or_insert_with(|| role.to_string());
        Ok(config)
    }

    /// Load from a YAML string on top of the defaults (no environment layer).
    pub fn load_from_str(yaml: &str) -> Result<EngineConfig> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(EngineConfig::default()))
                .merge(Yaml::string(yaml)),
        )
    }

    fn extract(figment: Figment) -> Result<EngineConfig> {
        let config: EngineConfig = figment
            .extract()
            .map_err(|e| DistributionError::Config(format!("failed to load configuration: {}", e)))?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &EngineConfig) -> Result<()> {
        if config.node_id.trim().is_empty() {
            return Err(DistributionError::Config("node_id cannot be empty".to_string()));
        }
        config.settings.delivery.validate()?;
        if config.settings.log.capacity == 0 {
            return Err(DistributionError::Config("log.capacity cannot be 0".to_string()));
        }
        if config.store.enabled && config.store.sqlite_path.is_empty() {
            return Err(DistributionError::Config("store.sqlite_path cannot be empty".to_string()));
        }

        let mut names = HashSet::new();
        for agent in &config.agents {
            agent
                .validate()
                .map_err(|e| DistributionError::Config(e.to_string()))?;
            if !names.insert(agent.name.as_str()) {
                return Err(DistributionError::Config(format!(
                    "duplicate agent name: {}",
                    agent.name
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_delivery_config_default() {
        let config = DeliveryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_backoff, "500ms");
        assert_eq!(config.max_backoff, "5m");
        assert!(!config.rate_limit_enabled);
        assert!(config.rate_limit_config().is_none());
    }

    #[test]
    fn test_retry_config_parsing() {
        let config = DeliveryConfig {
            initial_backoff: "2s".to_string(),
            max_backoff: "1m".to_string(),
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_secs(2));
        assert_eq!(retry.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let config = DeliveryConfig {
            drain_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.drain_timeout_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_rate_limit_config() {
        let config = DeliveryConfig {
            rate_limit_enabled: true,
            rate_limit_per_sec: 50,
            rate_limit_burst: 5,
            ..Default::default()
        };
        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 50);
        assert_eq!(rate.burst_size, 5);
    }

    #[test]
    fn test_agent_kind_parse() {
        assert_eq!(AgentKind::parse("forward"), Some(AgentKind::Forward));
        assert_eq!(AgentKind::parse("Reverse"), Some(AgentKind::Reverse));
        assert_eq!(AgentKind::parse("sync"), Some(AgentKind::Sync));
        assert_eq!(AgentKind::parse("publish-multiple"), Some(AgentKind::MultipleEndpoint));
        assert_eq!(AgentKind::parse("multiple-endpoint"), Some(AgentKind::MultipleEndpoint));
        assert_eq!(AgentKind::parse("queue"), None);
        assert!(!AgentKind::Reverse.pushes());
        assert!(AgentKind::Forward.pushes());
    }

    #[test]
    fn test_from_options_minimal_forward() {
        let config =
            AgentConfig::from_options("sample1", &opts(&[("name", "sample1"), ("type", "forward")])).unwrap();
        assert_eq!(config.name, "sample1");
        assert_eq!(config.kind, AgentKind::Forward);
        assert!(config.endpoints.is_empty());
        assert!(!config.etc_enabled);
        assert!(config.queue_specs().is_empty());
    }

    #[test]
    fn test_from_options_full() {
        let config = AgentConfig::from_options(
            "publish-multiple",
            &opts(&[
                ("type", "publish-multiple"),
                ("endpoints", "endpoint1=repo://p1, endpoint2=repo://p2"),
                ("passiveQueues", "passivequeue1"),
                ("packageExporter", "exporters/local/default"),
                ("etc.enabled", "true"),
                ("queue.capacity", "25"),
                ("custom.flag", "x"),
            ]),
        )
        .unwrap();

        assert_eq!(config.kind, AgentKind::MultipleEndpoint);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[1], EndpointConfig::new("endpoint2", "repo://p2"));
        assert_eq!(config.passive_queues, vec!["passivequeue1"]);
        assert_eq!(config.package_exporter.as_deref(), Some("exporters/local/default"));
        assert!(config.etc_enabled);
        assert_eq!(config.queue_capacity, Some(25));
        assert_eq!(config.options.get("custom.flag").map(String::as_str), Some("x"));

        let specs = config.queue_specs();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["endpoint1", "endpoint2", "passivequeue1"]);
        assert_eq!(specs[2].mode, QueueMode::Passive);
    }

    #[test]
    fn test_from_options_bare_endpoint_names() {
        let config = AgentConfig::from_options(
            "m",
            &opts(&[("type", "multiple-endpoint"), ("endpoints", "repo://a,repo://b")]),
        )
        .unwrap();
        assert_eq!(config.endpoints[0].name, "endpoint1");
        assert_eq!(config.endpoints[1].name, "endpoint2");
    }

    #[test]
    fn test_from_options_errors() {
        assert!(AgentConfig::from_options("a", &opts(&[])).is_err());
        assert!(AgentConfig::from_options("a", &opts(&[("type", "teleport")])).is_err());
        assert!(AgentConfig::from_options("a", &opts(&[("type", "forward"), ("name", "b")])).is_err());
        assert!(AgentConfig::from_options("a", &opts(&[("type", "forward"), ("etc.enabled", "maybe")])).is_err());
        assert!(AgentConfig::from_options("a", &opts(&[("type", "forward"), ("queue.capacity", "-1")])).is_err());
        // Forward agents push to a single endpoint
        assert!(AgentConfig::from_options(
            "a",
            &opts(&[("type", "forward"), ("endpoints", "repo://a,repo://b")])
        )
        .is_err());
        // Queue names must be unique
        assert!(AgentConfig::from_options(
            "a",
            &opts(&[("type", "sync"), ("endpoints", "q=repo://a"), ("passiveQueues", "q")])
        )
        .is_err());
    }

    #[test]
    fn test_properties_roundtrip() {
        let config = AgentConfig::new("publish", AgentKind::Forward)
            .with_endpoint("publish", "repo://publish");
        let props = config.to_properties();
        assert_eq!(props.get("type").map(String::as_str), Some("forward"));
        assert_eq!(props.get("endpoints").map(String::as_str), Some("publish=repo://publish"));

        let parsed = AgentConfig::from_options("publish", &props).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_merged_with_package_exporter() {
        let config = AgentConfig::new("a", AgentKind::Forward);
        let updated = config
            .merged_with(&opts(&[("packageExporter", "exporters/remote/updated")]))
            .unwrap();
        assert_eq!(updated.package_exporter.as_deref(), Some("exporters/remote/updated"));
        assert!(config.same_topology(&updated));

        let retargeted = config
            .merged_with(&opts(&[("endpoints", "publish=repo://p")]))
            .unwrap();
        assert!(!config.same_topology(&retargeted));
    }

    #[test]
    fn test_reverse_default_passive_queue() {
        let config = AgentConfig::new("reverse", AgentKind::Reverse).with_endpoint("ignored", "repo://x");
        let specs = config.queue_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, DEFAULT_PASSIVE_QUEUE);
        assert_eq!(specs[0].mode, QueueMode::Passive);
    }

    #[test]
    fn test_resource_roots_paths() {
        let roots = ResourceRoots::default();
        assert_eq!(roots.settings_path("publish"), "/libs/distribution/settings/agents/publish");
        assert_eq!(roots.mirror_path("publish"), "/etc/distribution/publish");
    }

    #[test]
    fn test_store_config_presets() {
        assert!(!StoreConfig::default().enabled);
        let mem = StoreConfig::in_memory();
        assert!(mem.enabled);
        assert_eq!(mem.sqlite_path, ":memory:");
        assert!(!mem.wal_mode);
    }

    #[test]
    fn test_load_from_str() {
        let yaml = r#"
node_id: author-1
role: author
settings:
  delivery:
    max_attempts: 7
    initial_backoff: "1s"
agents:
  - name: publish
    type: forward
    endpoints:
      - name: publish
        uri: "repo://publish"
  - name: publish-reverse
    type: reverse
"#;
        let config = ConfigLoader::load_from_str(yaml).unwrap();
        assert_eq!(config.node_id, "author-1");
        assert_eq!(config.role.as_deref(), Some("author"));
        assert_eq!(config.settings.delivery.max_attempts, 7);
        assert_eq!(config.settings.delivery.max_backoff, "5m");
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].kind, AgentKind::Reverse);
        assert!(!config.store.enabled);
    }

    #[test]
    fn test_load_rejects_duplicate_agents() {
        let yaml = r#"
node_id: n
agents:
  - name: a
    type: forward
  - name: a
    type: reverse
"#;
        let err = ConfigLoader::load_from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate agent name"));
    }

    #[test]
    fn test_load_rejects_bad_backoff() {
        let yaml = r#"
node_id: n
settings:
  delivery:
    initial_backoff: "10m"
    max_backoff: "1s"
"#;
        assert!(ConfigLoader::load_from_str(yaml).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigLoader::load_from_file("/nonexistent/distribution.yaml").unwrap_err();
        assert!(matches!(err, DistributionError::Config(_)));
    }

    #[test]
    fn test_default_config_serializes() {
        let config = EngineConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("local.dev.node.default"));
    }

    #[test]
    fn test_for_testing_config() {
        let config = EngineConfig::for_testing("test-node-1");
        assert_eq!(config.node_id, "test-node-1");
        assert_eq!(config.settings.delivery.max_attempts, 3);
        assert!(ConfigLoader::validate(&config).is_ok());
    }
}
