//! Deployment records and their lifecycle
//!
//! A Deployment's `status` only ever moves along
//! [`DeploymentStatus::successors`]. Every accepted move is appended to the
//! record's history; rejected moves leave the record untouched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use super::scope::Ownership;
use crate::protocol::{
    DeploymentCreatePayload, DeploymentStatus, DeploymentStatusPayload, HealthStatus,
};

/// Errors from applying a lifecycle change
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("Illegal transition {from} -> {to} for deployment '{deployment_id}'")]
    Illegal {
        deployment_id: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("Deployment '{0}' not found")]
    NotFound(String),

    #[error("Deployment '{0}' already exists")]
    AlreadyExists(String),

    #[error("Deployment '{deployment_id}' is owned by node '{owner}', not '{reporter}'")]
    WrongNode {
        deployment_id: String,
        owner: String,
        reporter: String,
    },
}

/// What caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// `deployment.status` reported by the worker
    WorkerEvent,
    /// Outcome of a `command.result`
    CommandResult,
    /// Command deadline expired
    CommandTimeout,
    /// Controller-side create or restart
    Operator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
    pub at: DateTime<Utc>,
    pub cause: TransitionCause,
}

/// Runtime counters last reported for a deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_inferences: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

/// One inference workload on exactly one node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub deployment_id: String,
    pub node_id: String,
    pub status: DeploymentStatus,

    /// Create request, kept so restarts can re-issue it
    pub spec: DeploymentCreatePayload,

    #[serde(default)]
    pub gpu_device_ids: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    pub health_status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,

    #[serde(default)]
    pub stats: DeploymentStats,

    /// Last failure reported by the worker or a timed-out command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Most recent command issued for this deployment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_command_id: Option<String>,

    #[serde(flatten)]
    pub owner: Ownership,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Deployment {
    /// New record in `queued`
    pub fn new(
        deployment_id: impl Into<String>,
        node_id: impl Into<String>,
        spec: DeploymentCreatePayload,
        owner: Ownership,
    ) -> Self {
        let now = Utc::now();
        let gpu_device_ids = vec![spec.gpu_device_id.clone()];
        Self {
            deployment_id: deployment_id.into(),
            node_id: node_id.into(),
            status: DeploymentStatus::Queued,
            container_name: Some(spec.container_name.clone()),
            spec,
            gpu_device_ids,
            container_id: None,
            endpoint: None,
            health_status: HealthStatus::Unknown,
            last_health_check: None,
            stats: DeploymentStats::default(),
            error_message: None,
            last_command_id: None,
            owner,
            labels: HashMap::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            history: vec![],
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether `cause` may move the record from its current state to `to`
    pub fn can_transition(&self, to: DeploymentStatus, cause: TransitionCause) -> bool {
        edge_allowed(self.status, to, cause)
    }

    fn illegal(&self, from: DeploymentStatus, to: DeploymentStatus) -> TransitionError {
        TransitionError::Illegal {
            deployment_id: self.deployment_id.clone(),
            from,
            to,
        }
    }

    /// Move to `to` if the table allows it for `cause`
    pub fn transition(
        &mut self,
        to: DeploymentStatus,
        cause: TransitionCause,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.can_transition(to, cause) {
            return Err(self.illegal(self.status, to));
        }

        self.history.push(TransitionRecord {
            from: self.status,
            to,
            at: now,
            cause,
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Follow `path` from the current state, one legal edge at a time
    ///
    /// Steps the current state already matches are skipped, so a result that
    /// arrives after the worker's own status events is a no-op. Returns
    /// whether the record ended on the last step of `path`.
    pub fn advance(
        &mut self,
        path: &[DeploymentStatus],
        cause: TransitionCause,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        let Some(target) = path.last().copied() else {
            return Ok(false);
        };
        if self.status == target {
            return Ok(true);
        }

        let start = path
            .iter()
            .position(|s| *s == self.status)
            .map(|i| i + 1)
            .unwrap_or(0);

        // Check the whole walk first so a rejected walk changes nothing
        let mut cursor = self.status;
        for step in &path[start..] {
            if !edge_allowed(cursor, *step, cause) {
                return Err(self.illegal(cursor, *step));
            }
            cursor = *step;
        }

        for step in &path[start..] {
            self.transition(*step, cause, now)?;
        }
        Ok(true)
    }

    /// Apply a worker `deployment.status` event
    ///
    /// A report of the current state refreshes runtime fields without a
    /// transition. Returns whether `status` changed.
    pub fn apply_status_event(
        &mut self,
        event: &DeploymentStatusPayload,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if event.node_id != self.node_id {
            return Err(TransitionError::WrongNode {
                deployment_id: self.deployment_id.clone(),
                owner: self.node_id.clone(),
                reporter: event.node_id.clone(),
            });
        }

        let changed = event.status != self.status;
        if changed {
            self.transition(event.status, TransitionCause::WorkerEvent, now)?;
        }

        if let Some(id) = &event.container_id {
            self.container_id = Some(id.clone());
        }
        if let Some(name) = &event.container_name {
            self.container_name = Some(name.clone());
        }
        if let Some(endpoint) = &event.endpoint {
            self.endpoint = Some(endpoint.clone());
        }
        if let Some(gpu) = &event.gpu_device_id {
            self.gpu_device_ids = vec![gpu.clone()];
        }
        if let Some(health) = event.health_status {
            self.health_status = health;
        }
        if event.last_health_check.is_some() {
            self.last_health_check = event.last_health_check;
        }
        if event.error_message.is_some() {
            self.error_message = event.error_message.clone();
        }

        let stats = &mut self.stats;
        stats.gpu_memory_used = event.gpu_memory_used.or(stats.gpu_memory_used);
        stats.cpu_cores = event.cpu_cores.or(stats.cpu_cores);
        stats.total_inferences = event.total_inferences.or(stats.total_inferences);
        stats.average_latency = event.average_latency.or(stats.average_latency);
        stats.uptime_seconds = event.uptime_seconds.or(stats.uptime_seconds);

        self.updated_at = now;
        Ok(changed)
    }

    /// Mark failed if the table allows it, recording why
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        cause: TransitionCause,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(DeploymentStatus::Failed, cause, now)?;
        self.error_message = Some(reason.into());
        self.health_status = HealthStatus::Unknown;
        Ok(())
    }
}

/// Leaving `queued`, `stopped` or `failed` begins a new lifecycle, which only
/// the controller's own create or restart may do
fn edge_allowed(from: DeploymentStatus, to: DeploymentStatus, cause: TransitionCause) -> bool {
    from.can_transition_to(to) && (cause == TransitionCause::Operator || !from.is_restartable())
}

/// Shared deployment records, each behind its own lock
///
/// The map is sharded; the per-record `Mutex` serializes a status event and
/// a command result racing on the same deployment.
#[derive(Clone, Default)]
pub struct DeploymentStore {
    records: Arc<DashMap<String, Arc<Mutex<Deployment>>>>,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, deployment: Deployment) -> Result<(), TransitionError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(deployment.deployment_id.clone()) {
            Entry::Occupied(_) => Err(TransitionError::AlreadyExists(deployment.deployment_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(deployment)));
                Ok(())
            }
        }
    }

    /// Handle for locking a single record
    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Deployment>>> {
        self.records.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Mutex<Deployment>>> {
        self.records.remove(id).map(|(_, d)| d)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub async fn snapshot(&self, id: &str) -> Option<Deployment> {
        let handle = self.get(id)?;
        let record = handle.lock().await;
        Some(record.clone())
    }

    /// Copies of every record, in no particular order
    pub async fn list(&self) -> Vec<Deployment> {
        // Collect handles first so no shard guard is held across an await
        let handles: Vec<_> = self.records.iter().map(|r| Arc::clone(r.value())).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out
    }

    /// Evict soft-deleted records deleted at or before `cutoff`
    pub async fn purge_deleted(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let handles: Vec<_> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();

        let mut purged = Vec::new();
        for (id, handle) in handles {
            let expired = matches!(handle.lock().await.deleted_at, Some(at) if at <= cutoff);
            if expired && self.records.remove(&id).is_some() {
                purged.push(id);
            }
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
