//! Node resource - a worker process hosting GPU inference containers
//!
//! A Node:
//! - Is created on its first successful `node.register`
//! - Is overwritten (never duplicated) on every re-registration
//! - Refreshes liveness on each `telemetry.heartbeat`
//! - Goes `offline` on session loss or missed heartbeats, and is never
//!   hard-deleted

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::scope::Ownership;
use crate::protocol::{
    ContainerRuntime, GpuDevice, GpuStatusSummary, HeartbeatPayload, MetricsPayload,
    NodeRegisterPayload, NodeStatus, OsInfo,
};

/// A worker node known to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Caller-assigned id, stable across restarts
    pub node_id: String,

    pub name: String,

    #[serde(flatten)]
    pub owner: Ownership,

    /// Capabilities declared at registration
    pub hardware: NodeHardware,

    /// Connection/health status tracked by the controller
    pub status: NodeStatus,

    /// Operational label last reported by the worker (ready, busy, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<NodeStatus>,

    pub uptime_seconds: u64,

    pub last_heartbeat_at: DateTime<Utc>,

    /// Summary carried by the last heartbeat
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatSummary>,

    /// Last full metrics snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsPayload>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_at: Option<DateTime<Utc>>,

    /// First time this node id registered
    pub first_registered_at: DateTime<Utc>,

    /// Most recent registration
    pub registered_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Hardware and runtime descriptors from `node.register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHardware {
    pub hostname: String,
    pub ip_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip_address: Option<String>,
    pub os: OsInfo,
    pub cpu_cores: u32,
    pub cpu_model: String,
    /// MB
    pub ram_total: u64,
    /// MB
    pub disk_total: u64,
    pub gpu_devices: Vec<GpuDevice>,
    pub container_runtime: ContainerRuntime,
    pub daemon_version: String,
}

impl NodeHardware {
    /// Total GPU memory across devices (MB)
    pub fn gpu_memory_total(&self) -> u64 {
        self.gpu_devices.iter().map(|g| g.memory_total).sum()
    }

    pub fn gpu(&self, device_id: &str) -> Option<&GpuDevice> {
        self.gpu_devices.iter().find(|g| g.device_id == device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSummary {
    pub active_deployments: u32,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub gpu_status: Vec<GpuStatusSummary>,
}

impl Node {
    /// Build a fresh record from a registration snapshot
    pub fn from_registration(
        node_id: impl Into<String>,
        register: &NodeRegisterPayload,
        owner: Ownership,
        now: DateTime<Utc>,
    ) -> Self {
        let mut node = Self {
            node_id: node_id.into(),
            name: register.name.clone(),
            owner,
            hardware: NodeHardware::from(register),
            status: NodeStatus::Online,
            label: None,
            uptime_seconds: register.uptime_seconds,
            last_heartbeat_at: now,
            heartbeat: None,
            metrics: None,
            metrics_at: None,
            first_registered_at: now,
            registered_at: now,
            updated_at: now,
        };
        node.apply_reported_status(register.node_status);
        node
    }

    /// Check if node is reachable as far as the controller knows
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Check if no heartbeat arrived within `threshold`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_heartbeat_at > threshold
    }

    /// Record a heartbeat; an `offline` node comes back to life
    pub fn apply_heartbeat(&mut self, heartbeat: &HeartbeatPayload, now: DateTime<Utc>) {
        self.last_heartbeat_at = now;
        self.updated_at = now;
        self.uptime_seconds = heartbeat.uptime_seconds;
        self.heartbeat = Some(HeartbeatSummary {
            active_deployments: heartbeat.active_deployments,
            cpu_usage: heartbeat.cpu_usage,
            ram_usage: heartbeat.ram_usage,
            gpu_status: heartbeat.gpu_status.clone(),
        });
        self.apply_reported_status(heartbeat.status);
    }

    pub fn apply_metrics(&mut self, metrics: MetricsPayload, now: DateTime<Utc>) {
        self.metrics = Some(metrics);
        self.metrics_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_offline(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::Offline;
        self.updated_at = now;
    }

    /// Workers report health and operational labels; connection states are
    /// the controller's to decide
    fn apply_reported_status(&mut self, reported: NodeStatus) {
        if reported.is_health() {
            self.status = reported;
        } else {
            if reported.is_operational_label() {
                self.label = Some(reported);
            }
            if !self.status.is_live() {
                self.status = NodeStatus::Online;
            }
        }
    }
}

impl From<&NodeRegisterPayload> for NodeHardware {
    fn from(register: &NodeRegisterPayload) -> Self {
        Self {
            hostname: register.hostname.clone(),
            ip_address: register.ip_address.clone(),
            public_ip_address: register.public_ip_address.clone(),
            os: register.os.clone(),
            cpu_cores: register.cpu_cores,
            cpu_model: register.cpu_model.clone(),
            ram_total: register.ram_total,
            disk_total: register.disk_total,
            gpu_devices: register.gpu_devices.clone(),
            container_runtime: register.container_runtime.clone(),
            daemon_version: register.daemon_version.clone(),
        }
    }
}
