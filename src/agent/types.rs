// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Agent state and request outcome types.
//!
//! # State Transitions
//!
//! ```text
//!            start()
//! Created ───────────→ Running
//!    │                    │
//!    │ shutdown()         │ shutdown()
//!    │                    ↓
//!    │              Stopping   (workers signalled, joined)
//!    │                    │
//!    └──────────────→ Stopped
//! ```

use crate::package::DistributionPackage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle of a distribution agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Built, queues restored on start.
    Created,
    /// Workers running; requests accepted.
    Running,
    /// Workers signalled; waiting for in-flight imports.
    Stopping,
    /// Workers joined. Safe to drop.
    Stopped,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Created => write!(f, "Created"),
            AgentState::Running => write!(f, "Running"),
            AgentState::Stopping => write!(f, "Stopping"),
            AgentState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What happened to a request on one queue.
///
/// Fan-out reports one outcome per queue so a failure on one endpoint is
/// never folded into the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Accepted. `item_id` is `None` for TEST requests, which enqueue nothing.
    Queued {
        #[serde(rename = "itemId")]
        item_id: Option<String>,
    },
    /// Not accepted (queue full, store failure).
    Rejected { reason: String },
}

impl DeliveryOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, DeliveryOutcome::Queued { .. })
    }
}

/// Response to a distribution request.
#[derive(Debug, Clone, Default)]
pub struct DistributionResponse {
    /// Id of the exported package (ADD/DELETE).
    pub package_id: Option<String>,
    /// Per-queue outcomes, in queue order.
    pub outcomes: Vec<(String, DeliveryOutcome)>,
    /// Packages handed off by a PULL, oldest first.
    pub pulled: Vec<Arc<DistributionPackage>>,
}

impl DistributionResponse {
    pub fn outcome(&self, queue: &str) -> Option<&DeliveryOutcome> {
        self.outcomes.iter().find(|(name, _)| name == queue).map(|(_, outcome)| outcome)
    }

    /// Whether every queue accepted the request.
    pub fn all_queued(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_queued())
    }
}
