//! Node registry and heartbeat tracker

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::node::Node;
use super::scope::{Ownership, Scope};
use crate::protocol::{HeartbeatPayload, MetricsPayload, NodeRegisterPayload, NodeStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node '{0}' not found")]
    NotFound(String),
}

/// Node counts by liveness
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub total: usize,
    pub live: usize,
    pub offline: usize,
}

/// Authoritative in-memory node records, keyed by `nodeId`
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<String, Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the record for `node_id`
    pub fn register(
        &self,
        node_id: &str,
        register: &NodeRegisterPayload,
        owner: Ownership,
        now: DateTime<Utc>,
    ) -> Node {
        let mut node = Node::from_registration(node_id, register, owner, now);

        if let Some(previous) = self.nodes.get(node_id) {
            node.first_registered_at = previous.first_registered_at;
            info!("Node {} re-registered", node_id);
        } else {
            info!(
                "Node {} registered ({} GPUs, {} MB RAM)",
                node_id,
                node.hardware.gpu_devices.len(),
                node.hardware.ram_total
            );
        }

        self.nodes.insert(node_id.to_string(), node.clone());
        node
    }

    /// Returns the status before the heartbeat was applied
    pub fn record_heartbeat(
        &self,
        node_id: &str,
        heartbeat: &HeartbeatPayload,
        now: DateTime<Utc>,
    ) -> Result<NodeStatus, RegistryError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;

        let previous = node.status;
        node.apply_heartbeat(heartbeat, now);

        if previous == NodeStatus::Offline && node.status != NodeStatus::Offline {
            info!("Node {} back {} after heartbeat", node_id, node.status);
        } else {
            debug!("Heartbeat from {} ({})", node_id, node.status);
        }
        Ok(previous)
    }

    pub fn record_metrics(
        &self,
        node_id: &str,
        metrics: MetricsPayload,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
        node.apply_metrics(metrics, now);
        Ok(())
    }

    /// Returns false if the node was unknown or already offline
    pub fn mark_offline(&self, node_id: &str, now: DateTime<Utc>) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(mut node) if node.status != NodeStatus::Offline => {
                node.mark_offline(now);
                true
            }
            _ => false,
        }
    }

    /// Mark live nodes with no heartbeat within `threshold` offline
    ///
    /// Returns the ids that changed.
    pub fn sweep_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        let mut stale = Vec::new();
        for mut node in self.nodes.iter_mut() {
            if node.is_live() && node.is_stale(now, threshold) {
                warn!(
                    "Node {} missed heartbeats (last at {}), marking offline",
                    node.node_id, node.last_heartbeat_at
                );
                node.mark_offline(now);
                stale.push(node.node_id.clone());
            }
        }
        stale
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|r| r.clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn list(&self) -> Vec<Node> {
        self.nodes.iter().map(|r| r.clone()).collect()
    }

    /// Nodes visible to a caller with `scope`
    pub fn list_scoped(&self, scope: &Scope) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|r| scope.permits(&r.owner))
            .map(|r| r.clone())
            .collect()
    }

    pub fn stats(&self) -> NodeStats {
        let total = self.nodes.len();
        let live = self.nodes.iter().filter(|r| r.is_live()).count();
        NodeStats {
            total,
            live,
            offline: total - live,
        }
    }
}
