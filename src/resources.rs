// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resource views returned by the registry.
//!
//! Plain serde structs shaped like the resources a transport would render.
//! Field names are camelCase on the wire.

use crate::log::LogEntry;
use crate::package::DistributionRequestType;
use crate::queue::{DistributionQueue, ItemState, QueueItem, QueueMode};
use crate::settings::Properties;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource type of an agent settings resource.
pub const SETTING_RESOURCE_TYPE: &str = "sling/distribution/setting";

/// Resource type of the agent list.
pub const AGENT_LIST_RESOURCE_TYPE: &str = "sling/distribution/service/agent/list";

/// Resource type of an agent queue.
pub const QUEUE_RESOURCE_TYPE: &str = "sling/distribution/service/agent/queue";

/// Resource type of an agent log.
pub const LOG_RESOURCE_TYPE: &str = "sling/distribution/service/log";

/// An agent's configuration as a settings resource.
///
/// Properties are flattened next to `resourceType` and `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingResource {
    pub resource_type: String,
    pub name: String,
    #[serde(flatten)]
    pub properties: Properties,
}

impl SettingResource {
    pub fn new(name: impl Into<String>, mut properties: Properties) -> Self {
        let name = name.into();
        // Both live at the top level already.
        properties.remove("name");
        properties.remove("resourceType");
        Self {
            resource_type: SETTING_RESOURCE_TYPE.to_string(),
            name,
            properties,
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentListResource {
    pub resource_type: String,
    pub items: Vec<String>,
}

impl AgentListResource {
    pub fn new(items: Vec<String>) -> Self {
        Self {
            resource_type: AGENT_LIST_RESOURCE_TYPE.to_string(),
            items,
        }
    }
}

/// One queue item as seen by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemView {
    pub id: String,
    pub package_id: String,
    #[serde(rename = "type")]
    pub kind: DistributionRequestType,
    pub paths: Vec<String>,
    pub state: ItemState,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
}

impl From<&QueueItem> for QueueItemView {
    fn from(item: &QueueItem) -> Self {
        Self {
            id: item.id.clone(),
            package_id: item.package.id.clone(),
            kind: item.package.kind,
            paths: item.package.paths.clone(),
            state: item.state,
            attempts: item.attempts,
            enqueued_at: item.enqueued_at,
            last_attempt_at: item.last_attempt_at,
            last_error: item.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResource {
    pub resource_type: String,
    pub name: String,
    pub mode: QueueMode,
    pub items: Vec<QueueItemView>,
    pub items_count: usize,
}

impl QueueResource {
    /// Snapshot of `queue`, oldest item first.
    pub async fn snapshot(queue: &DistributionQueue) -> Self {
        let items: Vec<QueueItemView> = queue.list_items().await.iter().map(QueueItemView::from).collect();
        Self {
            resource_type: QUEUE_RESOURCE_TYPE.to_string(),
            name: queue.name().to_string(),
            mode: queue.mode(),
            items_count: items.len(),
            items,
        }
    }

    /// Items currently in ERROR.
    pub fn errored(&self) -> impl Iterator<Item = &QueueItemView> {
        self.items.iter().filter(|item| item.state == ItemState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogResource {
    pub resource_type: String,
    pub agent: String,
    pub entries: Vec<LogEntry>,
}

impl LogResource {
    pub fn new(agent: impl Into<String>, entries: Vec<LogEntry>) -> Self {
        Self {
            resource_type: LOG_RESOURCE_TYPE.to_string(),
            agent: agent.into(),
            entries,
        }
    }

    /// Entries rendered one per line.
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{DistributionPackage, PackagePayload};
    use std::sync::Arc;

    #[test]
    fn test_setting_resource_flattens_properties() {
        let mut props = Properties::new();
        props.insert("name".to_string(), "publish".to_string());
        props.insert("type".to_string(), "forward".to_string());
        props.insert("packageExporter".to_string(), "exporters/remote/publish".to_string());

        let resource = SettingResource::new("publish", props);
        let json = serde_json::to_value(&resource).unwrap();

        assert_eq!(json["resourceType"], SETTING_RESOURCE_TYPE);
        assert_eq!(json["name"], "publish");
        assert_eq!(json["type"], "forward");
        assert_eq!(json["packageExporter"], "exporters/remote/publish");
        assert_eq!(resource.property("type"), Some("forward"));
    }

    #[test]
    fn test_agent_list_shape() {
        let list = AgentListResource::new(vec!["publish".to_string(), "publish-reverse".to_string()]);
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["resourceType"], AGENT_LIST_RESOURCE_TYPE);
        assert_eq!(json["items"][1], "publish-reverse");
    }

    #[tokio::test]
    async fn test_queue_snapshot() {
        let queue = DistributionQueue::new("publish", "endpoint1", QueueMode::Active, None, 3);
        let package = DistributionPackage::new(
            DistributionRequestType::Delete,
            vec!["/content/a".to_string()],
            PackagePayload::Deletion,
        )
        .unwrap();
        let item = queue.enqueue(Arc::new(package)).await.unwrap();
        queue.begin_attempt(&item.id).await.unwrap();
        queue.fail(&item.id, "rejected", true).await.unwrap();

        let resource = QueueResource::snapshot(&queue).await;
        assert_eq!(resource.items_count, 1);
        assert_eq!(resource.errored().count(), 1);

        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["itemsCount"], 1);
        assert_eq!(json["mode"], "active");
        assert_eq!(json["items"][0]["state"], "ERROR");
        assert_eq!(json["items"][0]["type"], "DELETE");
        assert_eq!(json["items"][0]["lastError"], "rejected");
    }
}
