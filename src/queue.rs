// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distribution queues.
//!
//! A queue holds the packages waiting for one endpoint of one agent, in
//! enqueue order. Every mutation serializes through the queue's own async
//! mutex, including the write-through to the [`QueueStore`] when one is
//! attached, so memory and disk never disagree about which items exist.
//!
//! # Item Lifecycle
//!
//! ```text
//! enqueue ──► QUEUED ──begin_attempt──► IN_PROGRESS ──ack──► (removed)
//!               ▲                            │
//!               └───────fail (Retry)─────────┤
//!                                            └──fail (Exhausted)──► ERROR
//! ERROR ──retry (admin)──► QUEUED
//! ```
//!
//! ERROR items stay listed and counted but are never attempted again until
//! an administrator retries or removes them.
//!
//! # Modes
//!
//! - [`QueueMode::Active`]: a delivery worker drains the queue continuously.
//!   Delivery is strictly FIFO: [`DistributionQueue::peek_next()`] only ever
//!   offers the oldest non-ERROR item.
//! - [`QueueMode::Passive`]: items accumulate until a PULL calls
//!   [`DistributionQueue::drain()`], which hands off everything present at
//!   that moment under the queue lock.

use crate::config::EndpointConfig;
use crate::error::{DistributionError, Result};
use crate::metrics;
use crate::package::DistributionPackage;
use crate::store::QueueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Whether a queue is drained by a worker or by PULL requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Active,
    Passive,
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Passive => write!(f, "passive"),
        }
    }
}

/// What an agent config says a queue should be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub mode: QueueMode,
    /// Delivery target; `None` for passive queues.
    pub endpoint: Option<EndpointConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Queued,
    InProgress,
    Error,
    /// Handed off by a drain or purge; only seen on returned copies.
    Removed,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Error => "ERROR",
            Self::Removed => "REMOVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "IN_PROGRESS" => Some(Self::InProgress),
            "ERROR" => Some(Self::Error),
            "REMOVED" => Some(Self::Removed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package waiting in one queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: String,
    pub queue: String,
    pub package: Arc<DistributionPackage>,
    pub attempts: u32,
    pub state: ItemState,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(queue: impl Into<String>, package: Arc<DistributionPackage>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.into(),
            package,
            attempts: 0,
            state: ItemState::Queued,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
        }
    }
}

/// Result of recording a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in QUEUED; the worker backs off and tries again.
    Retry { attempts: u32 },
    /// Moved to ERROR; no further attempts.
    Exhausted { attempts: u32 },
}

/// An ordered holding area for packages bound to one endpoint.
pub struct DistributionQueue {
    agent: String,
    name: String,
    mode: QueueMode,
    capacity: Option<usize>,
    max_attempts: u32,
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
    store: Option<Arc<QueueStore>>,
    /// Set under the items lock once the owning agent shuts down.
    closed: AtomicBool,
}

impl DistributionQueue {
    pub fn new(
        agent: impl Into<String>,
        name: impl Into<String>,
        mode: QueueMode,
        capacity: Option<usize>,
        max_attempts: u32,
    ) -> Self {
        Self {
            agent: agent.into(),
            name: name.into(),
            mode,
            capacity,
            max_attempts: max_attempts.max(1),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            store: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Attach durable storage. Call [`restore()`](Self::restore) afterwards.
    pub fn with_store(mut self, store: Arc<QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load persisted items. Returns how many were restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_queue(&self.agent, &self.name).await?;
        let count = loaded.len();

        let mut items = self.items.lock().await;
        items.clear();
        items.extend(loaded);
        self.report_depth(items.len());
        drop(items);

        if count > 0 {
            self.notify.notify_one();
        }
        Ok(count)
    }

    /// Take over items from a queue being replaced, ahead of anything
    /// already queued here. IN_PROGRESS items come back as QUEUED.
    ///
    /// In-memory only: with a store attached the rows already exist and
    /// [`restore()`](Self::restore) picks them up.
    pub async fn adopt(&self, adopted: Vec<QueueItem>) -> usize {
        let count = adopted.len();
        if count == 0 {
            return 0;
        }

        let mut items = self.items.lock().await;
        for mut item in adopted.into_iter().rev() {
            item.queue = self.name.clone();
            if item.state == ItemState::InProgress {
                item.state = ItemState::Queued;
            }
            items.push_front(item);
        }
        self.report_depth(items.len());
        drop(items);

        self.notify.notify_one();
        count
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn is_passive(&self) -> bool {
        self.mode == QueueMode::Passive
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// `agent/queue`, used in logs and errors.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.agent, self.name)
    }

    fn report_depth(&self, depth: usize) {
        metrics::set_queue_depth(&self.agent, &self.name, depth);
    }

    fn check_capacity(&self, len: usize) -> Result<()> {
        match self.capacity {
            Some(capacity) if len >= capacity => Err(DistributionError::QueueFull {
                queue: self.qualified_name(),
                capacity,
            }),
            _ => Ok(()),
        }
    }

    /// Stop accepting packages. Existing items stay until purged or drained.
    ///
    /// Taken under the items lock, so an enqueue either finished before the
    /// close or observes it.
    pub async fn close(&self) {
        let _items = self.items.lock().await;
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Append a package. All-or-nothing: on error nothing was added.
    ///
    /// Fails with `Shutdown` once the queue is closed.
    pub async fn enqueue(&self, package: Arc<DistributionPackage>) -> Result<QueueItem> {
        let mut items = self.items.lock().await;
        if self.is_closed() {
            metrics::record_enqueue(&self.agent, &self.name, false);
            return Err(DistributionError::Shutdown);
        }
        if let Err(e) = self.check_capacity(items.len()) {
            metrics::record_enqueue(&self.agent, &self.name, false);
            return Err(e);
        }

        let item = QueueItem::new(self.name.clone(), package);
        if let Some(store) = &self.store {
            store.insert(&self.agent, &item).await?;
        }
        items.push_back(item.clone());
        self.report_depth(items.len());
        drop(items);

        metrics::record_enqueue(&self.agent, &self.name, true);
        debug!(
            agent = %self.agent,
            queue = %self.name,
            item_id = %item.id,
            package_id = %item.package.id,
            "Enqueued package"
        );
        self.notify.notify_one();
        Ok(item)
    }

    /// Whether an enqueue would currently be accepted.
    pub async fn check_accepts(&self) -> Result<()> {
        let items = self.items.lock().await;
        if self.is_closed() {
            return Err(DistributionError::Shutdown);
        }
        self.check_capacity(items.len())
    }

    /// Oldest item still eligible for delivery, if it is ready.
    ///
    /// Returns `None` when the queue has no QUEUED item, or when the oldest
    /// non-ERROR item is already IN_PROGRESS.
    pub async fn peek_next(&self) -> Option<QueueItem> {
        let items = self.items.lock().await;
        items
            .iter()
            .find(|item| item.state != ItemState::Error)
            .filter(|item| item.state == ItemState::Queued)
            .cloned()
    }

    /// Wait until an item is ready for delivery.
    ///
    /// Parks on the queue's notifier while there is nothing to do; enqueue
    /// and retry wake it.
    pub async fn next_ready(&self) -> QueueItem {
        loop {
            if let Some(item) = self.peek_next().await {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Wake a waiting worker without changing any item.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Mark an item IN_PROGRESS before an import attempt.
    pub async fn begin_attempt(&self, item_id: &str) -> Result<QueueItem> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|item| item.id == item_id)
            .ok_or_else(|| DistributionError::not_found("item", item_id))?;

        if item.state != ItemState::Queued {
            return Err(DistributionError::InvalidState {
                expected: ItemState::Queued.to_string(),
                actual: item.state.to_string(),
            });
        }

        item.state = ItemState::InProgress;
        item.last_attempt_at = Some(Utc::now());
        let snapshot = item.clone();
        if let Some(store) = &self.store {
            store.update(&snapshot).await?;
        }
        Ok(snapshot)
    }

    /// Return an IN_PROGRESS item to QUEUED without counting an attempt.
    ///
    /// Used when the import never ran (endpoint circuit open).
    pub async fn release(&self, item_id: &str) -> Result<()> {
        let mut items = self.items.lock().await;
        let Some(item) = items.iter_mut().find(|item| item.id == item_id) else {
            return Ok(());
        };
        if item.state == ItemState::InProgress {
            item.state = ItemState::Queued;
            if let Some(store) = &self.store {
                store.update(item).await?;
            }
        }
        Ok(())
    }

    /// Remove a delivered item.
    ///
    /// Returns `false` if the item was purged while its import was in flight.
    pub async fn ack(&self, item_id: &str) -> Result<bool> {
        let mut items = self.items.lock().await;
        let Some(pos) = items.iter().position(|item| item.id == item_id) else {
            return Ok(false);
        };

        if let Some(store) = &self.store {
            store.delete(&self.agent, &self.name, item_id).await?;
        }
        items.remove(pos);
        self.report_depth(items.len());
        Ok(true)
    }

    /// Record a failed attempt.
    ///
    /// `permanent` failures go straight to ERROR regardless of the attempt
    /// count.
    pub async fn fail(&self, item_id: &str, reason: &str, permanent: bool) -> Result<FailOutcome> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|item| item.id == item_id)
            .ok_or_else(|| DistributionError::not_found("item", item_id))?;

        item.attempts = item.attempts.saturating_add(1);
        item.last_error = Some(reason.to_string());
        let outcome = if permanent || item.attempts >= self.max_attempts {
            item.state = ItemState::Error;
            FailOutcome::Exhausted { attempts: item.attempts }
        } else {
            item.state = ItemState::Queued;
            FailOutcome::Retry { attempts: item.attempts }
        };

        if let Some(store) = &self.store {
            store.update(item).await?;
        }
        Ok(outcome)
    }

    /// Administrative retry: ERROR → QUEUED with a fresh attempt budget.
    pub async fn retry(&self, item_id: &str) -> Result<QueueItem> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|item| item.id == item_id)
            .ok_or_else(|| DistributionError::not_found("item", item_id))?;

        if item.state != ItemState::Error {
            return Err(DistributionError::InvalidState {
                expected: ItemState::Error.to_string(),
                actual: item.state.to_string(),
            });
        }

        item.state = ItemState::Queued;
        item.attempts = 0;
        item.last_error = None;
        let snapshot = item.clone();
        if let Some(store) = &self.store {
            store.update(&snapshot).await?;
        }
        drop(items);

        info!(agent = %self.agent, queue = %self.name, item_id, "Queue item re-queued");
        self.notify.notify_one();
        Ok(snapshot)
    }

    /// Administrative removal of a single item, in any state.
    pub async fn remove(&self, item_id: &str) -> Result<QueueItem> {
        let mut items = self.items.lock().await;
        let pos = items
            .iter()
            .position(|item| item.id == item_id)
            .ok_or_else(|| DistributionError::not_found("item", item_id))?;

        if let Some(store) = &self.store {
            store.delete(&self.agent, &self.name, item_id).await?;
        }
        let mut removed = items.remove(pos).ok_or_else(|| DistributionError::not_found("item", item_id))?;
        self.report_depth(items.len());
        removed.state = ItemState::Removed;
        Ok(removed)
    }

    pub async fn get(&self, item_id: &str) -> Option<QueueItem> {
        self.items.lock().await.iter().find(|item| item.id == item_id).cloned()
    }

    /// All items in enqueue order, ERROR items included.
    pub async fn list_items(&self) -> Vec<QueueItem> {
        self.items.lock().await.iter().cloned().collect()
    }

    pub async fn items_count(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Hand off every item present right now, oldest first.
    ///
    /// Only passive queues can be drained; the lock is held for the whole
    /// hand-off so two concurrent drains never return the same item.
    pub async fn drain(&self) -> Result<Vec<QueueItem>> {
        if !self.is_passive() {
            return Err(DistributionError::InvalidState {
                expected: QueueMode::Passive.to_string(),
                actual: self.mode.to_string(),
            });
        }

        let mut items = self.items.lock().await;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(store) = &self.store {
            let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
            store.delete_many(&self.agent, &self.name, &ids).await?;
        }
        let drained: Vec<QueueItem> = items
            .drain(..)
            .map(|mut item| {
                item.state = ItemState::Removed;
                item
            })
            .collect();
        self.report_depth(0);
        drop(items);

        metrics::record_pull(&self.agent, &self.name, drained.len());
        info!(agent = %self.agent, queue = %self.name, count = drained.len(), "Drained passive queue");
        Ok(drained)
    }

    /// Remove up to `limit` oldest items regardless of state.
    pub async fn purge(&self, limit: usize) -> Result<usize> {
        let mut items = self.items.lock().await;
        let count = limit.min(items.len());
        if count == 0 {
            return Ok(0);
        }

        if let Some(store) = &self.store {
            let ids: Vec<String> = items.iter().take(count).map(|item| item.id.clone()).collect();
            store.delete_many(&self.agent, &self.name, &ids).await?;
        }
        items.drain(..count);
        self.report_depth(items.len());
        drop(items);

        metrics::record_purge(&self.agent, &self.name, count);
        info!(agent = %self.agent, queue = %self.name, removed = count, "Purged queue items");
        Ok(count)
    }
}

impl std::fmt::Debug for DistributionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionQueue")
            .field("agent", &self.agent)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("capacity", &self.capacity)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
