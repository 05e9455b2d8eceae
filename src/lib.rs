//! # Distribution Engine
//!
//! Content distribution agents: replicate content-tree changes (ADD, DELETE,
//! PULL) from an author repository to one or more publish repositories.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           distribution-engine                            │
//! │                                                                          │
//! │  DistributionRequest                                                     │
//! │        │                                                                 │
//! │        ▼                                                                 │
//! │  ┌────────────┐  export   ┌─────────────────┐                            │
//! │  │ Agent      │──────────►│ Local repository│                            │
//! │  │ (registry) │           └─────────────────┘                            │
//! │  └────────────┘                                                          │
//! │        │ same package, one item per queue                                │
//! │        ├──────────────────┬───────────────────┐                          │
//! │        ▼                  ▼                   ▼                          │
//! │  ┌──────────┐       ┌──────────┐        ┌──────────────┐                 │
//! │  │ Queue    │       │ Queue    │        │ Passive queue│◄── PULL         │
//! │  │ endpoint1│       │ endpoint2│        │ (no worker)  │                 │
//! │  └──────────┘       └──────────┘        └──────────────┘                 │
//! │        │ worker           │ worker                                       │
//! │        ▼                  ▼                                              │
//! │  circuit + retry    circuit + retry ──► import on endpoint (idempotent)  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! Delivery is at-least-once: an item leaves its queue only after its import
//! succeeded. Imports are idempotent, so redelivery after a crash or a lost
//! ack converges to the same state. Within a queue delivery is strictly FIFO;
//! there is no ordering across queues.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use distribution_engine::{
//!     AgentRegistry, ConfigLoader, DistributionRequest, InMemoryRepository,
//!     InMemorySettingsStore, StaticEndpointResolver,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> distribution_engine::Result<()> {
//!     let config = ConfigLoader::load_role("config", "author")?;
//!
//!     let registry = AgentRegistry::bootstrap(
//!         config,
//!         Arc::new(InMemoryRepository::new()),
//!         Arc::new(StaticEndpointResolver::new()),
//!         Arc::new(InMemorySettingsStore::new()),
//!     )
//!     .await?;
//!
//!     registry
//!         .distribute("publish-reverse", &DistributionRequest::delete("/content/site/page"))
//!         .await?;
//!
//!     registry.shutdown_all().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod circuit_breaker;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod log;
pub mod metrics;
pub mod package;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod resilience;
pub mod resources;
pub mod settings;
pub mod store;
pub mod worker;

// Re-exports for convenience
pub use agent::{AgentState, DeliveryOutcome, DistributionAgent, DistributionResponse};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, EndpointCircuits};
pub use config::{AgentConfig, AgentKind, ConfigLoader, DeliveryConfig, DistributionSettings, EndpointConfig, EngineConfig};
pub use endpoint::{EndpointResolver, PackageImporter, RepositoryImporter, StaticEndpointResolver};
pub use error::{DistributionError, Result};
pub use log::{AgentLog, LogEntry, LogLevel};
pub use package::{DistributionPackage, DistributionRequest, DistributionRequestType, PackagePayload};
pub use queue::{DistributionQueue, ItemState, QueueItem, QueueMode};
pub use registry::AgentRegistry;
pub use repository::{ContentRepository, ImportOutcome, InMemoryRepository};
pub use resources::{AgentListResource, LogResource, QueueResource, SettingResource};
pub use settings::{InMemorySettingsStore, SettingsStore};
pub use store::QueueStore;
