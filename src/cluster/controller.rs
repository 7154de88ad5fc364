//! Cluster Controller - authoritative state and command orchestration
//!
//! The controller is responsible for:
//! - Registering nodes and tracking their liveness
//! - Routing commands to nodes and correlating their outcomes
//! - Driving each deployment through its lifecycle
//! - Publishing every record change to the persistence mirror

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::{AuthError, Authenticator, CallerIdentity, NodeIdentity, StaticAuthenticator};
use super::deployment::{Deployment, DeploymentStore, TransitionCause, TransitionError};
use super::dispatcher::{CommandDispatcher, DispatchError, OutstandingCommand};
use super::logs::LogStore;
use super::mirror::{MirrorHandle, MirrorRecord};
use super::node::Node;
use super::registry::{NodeRegistry, NodeStats, RegistryError};
use super::scope::{Ownership, Scope};
use super::session::SessionManager;
use crate::config::ControllerConfig;
use crate::protocol::{
    CommandAckPayload, CommandResultPayload, CommandStatus, ConnectionAckPayload, ControllerInfo,
    DeploymentCreatePayload, DeploymentLogsPayload, DeploymentStatus, DeploymentStatusPayload,
    DeploymentStopPayload, EmptyPayload, ErrorCode, ErrorDetails, HeartbeatPayload, LogEntry,
    Message, MessageType, MetricsPayload, ModelDownloadPayload, ModelDownloadProgressPayload,
    NodeRegisterPayload, Payload, RegisterAckPayload, ReplyStatus, ResourceRef,
    SystemHealthCheckPayload, PROTOCOL_VERSION,
};

/// Errors that can occur in the cluster controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Node '{0}' is not connected")]
    NodeUnavailable(String),

    #[error("Deployment '{0}' not found")]
    DeploymentNotFound(String),

    #[error("Deployment '{0}' already exists")]
    DeploymentExists(String),

    #[error("Deployment '{deployment_id}' cannot {action} while {status}")]
    InvalidState {
        deployment_id: String,
        status: DeploymentStatus,
        action: &'static str,
    },

    #[error("Deployment '{0}' has a command in flight")]
    Busy(String),

    #[error("Command '{0}' not found")]
    CommandNotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<RegistryError> for ControllerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => ControllerError::NodeNotFound(id),
        }
    }
}

impl ControllerError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ControllerError::NodeNotFound(_) => ErrorCode::NodeNotFound,
            ControllerError::NodeUnavailable(_)
            | ControllerError::Dispatch(DispatchError::NodeUnavailable(_)) => {
                ErrorCode::NetworkError
            }
            ControllerError::DeploymentNotFound(_)
            | ControllerError::Transition(TransitionError::NotFound(_)) => {
                ErrorCode::DeploymentNotFound
            }
            ControllerError::DeploymentExists(_)
            | ControllerError::Transition(TransitionError::AlreadyExists(_)) => {
                ErrorCode::AlreadyRunning
            }
            ControllerError::InvalidState { .. } => ErrorCode::NotRunning,
            ControllerError::CommandNotFound(_)
            | ControllerError::Busy(_)
            | ControllerError::ValidationError(_)
            | ControllerError::Transition(TransitionError::Illegal { .. })
            | ControllerError::Transition(TransitionError::WrongNode { .. })
            | ControllerError::Dispatch(DispatchError::NotFound(_))
            | ControllerError::Dispatch(DispatchError::Duplicate(_))
            | ControllerError::Dispatch(DispatchError::AlreadyFinished(_))
            | ControllerError::Dispatch(DispatchError::NotACommand(_)) => {
                ErrorCode::CommandInvalid
            }
            ControllerError::Forbidden(_) => ErrorCode::MissingRole,
            ControllerError::Unauthorized(e) => e.code(),
            ControllerError::Dispatch(DispatchError::Abandoned(_))
            | ControllerError::InternalError(_) => ErrorCode::InternalError,
        }
    }

    /// Wire form sent back to a worker
    pub fn to_error_details(&self) -> ErrorDetails {
        ErrorDetails::new(self.error_code(), self.to_string())
    }
}

/// REST body for creating a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentRequest {
    /// Generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    pub node_id: String,
    #[serde(flatten)]
    pub spec: DeploymentCreatePayload,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Cluster-wide statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    pub controller_id: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub nodes: NodeStats,
    pub sessions: usize,
    pub deployments: usize,
    pub deployments_by_status: BTreeMap<String, usize>,
    pub commands_in_flight: usize,
}

/// The cluster controller owns all authoritative state
pub struct ClusterController {
    config: ControllerConfig,
    registry: NodeRegistry,
    sessions: SessionManager,
    dispatcher: CommandDispatcher,
    deployments: DeploymentStore,
    logs: LogStore,
    authenticator: Arc<dyn Authenticator>,
    mirror: MirrorHandle,
    started_at: DateTime<Utc>,
}

impl ClusterController {
    pub fn new(
        config: ControllerConfig,
        authenticator: Arc<dyn Authenticator>,
        mirror: MirrorHandle,
    ) -> Self {
        let sessions = SessionManager::new();
        let dispatcher = CommandDispatcher::new(sessions.clone(), config.dispatcher_config());
        Self {
            registry: NodeRegistry::new(),
            deployments: DeploymentStore::new(),
            logs: LogStore::new(config.log_buffer_lines),
            sessions,
            dispatcher,
            authenticator,
            mirror,
            started_at: Utc::now(),
            config,
        }
    }

    /// Controller authenticating against the credentials in `config`
    pub fn from_config(config: ControllerConfig, mirror: MirrorHandle) -> Self {
        let authenticator = StaticAuthenticator::new(&config.nodes, &config.api_keys);
        Self::new(config, Arc::new(authenticator), mirror)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn deployments(&self) -> &DeploymentStore {
        &self.deployments
    }

    /// Close every worker session
    pub fn shutdown(&self) {
        info!("Closing {} worker sessions", self.sessions.len());
        self.sessions.close_all();
    }

    // =========================================================================
    // Worker-facing: handshake and telemetry
    // =========================================================================

    pub fn connection_ack(&self, node_id: &str) -> Message {
        Message::new(Payload::ConnectionAck(ConnectionAckPayload {
            status: ReplyStatus::Success,
            node_id: Some(node_id.to_string()),
            controller_id: Some(self.config.controller_id.clone()),
            server_version: Some(PROTOCOL_VERSION.to_string()),
            error: None,
        }))
    }

    /// Create or overwrite the node record; returns the `register.ack`
    ///
    /// The session is not eligible for commands until
    /// [`activate_session`](Self::activate_session) runs.
    pub fn register_node(
        &self,
        node: &NodeIdentity,
        register: &NodeRegisterPayload,
        now: DateTime<Utc>,
    ) -> Message {
        let record = self
            .registry
            .register(&node.node_id, register, node.owner.clone(), now);
        self.mirror.publish(MirrorRecord::Node(Box::new(record)));

        Message::new(Payload::RegisterAck(RegisterAckPayload {
            status: ReplyStatus::Success,
            node_id: node.node_id.clone(),
            registered_at: now,
            controller_info: ControllerInfo {
                controller_id: self.config.controller_id.clone(),
                heartbeat_interval: self.config.heartbeat_interval_ms,
                metrics_interval: self.config.metrics_interval_ms,
                timezone: self.config.timezone.clone(),
            },
            pending_commands: vec![],
            error: None,
        }))
    }

    /// Open the session for commands once `register.ack` is queued
    pub fn activate_session(&self, node_id: &str, session_id: &str) -> bool {
        let active = self.sessions.mark_registered(node_id, session_id);
        if active {
            info!("Node {} registered (session {})", node_id, session_id);
        } else {
            debug!(
                "Session {} for node {} was superseded before registering",
                session_id, node_id
            );
        }
        active
    }

    pub fn on_heartbeat(
        &self,
        node_id: &str,
        heartbeat: &HeartbeatPayload,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let previous = self.registry.record_heartbeat(node_id, heartbeat, now)?;
        if let Some(node) = self.registry.get(node_id) {
            if node.status != previous {
                self.mirror.publish(MirrorRecord::Node(Box::new(node)));
            }
        }
        Ok(())
    }

    pub fn on_metrics(
        &self,
        node_id: &str,
        metrics: MetricsPayload,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        self.registry.record_metrics(node_id, metrics, now)?;
        Ok(())
    }

    /// Session loss: the node goes offline, in-flight commands keep running
    /// to their deadlines
    pub fn on_disconnect(&self, node_id: &str, now: DateTime<Utc>) {
        if self.registry.mark_offline(node_id, now) {
            info!("Node {} disconnected, marked offline", node_id);
            self.publish_node(node_id);
        }
    }

    // =========================================================================
    // Worker-facing: command correlation and events
    // =========================================================================

    pub fn on_ack(&self, node_id: &str, ack: &CommandAckPayload, now: DateTime<Utc>) -> bool {
        self.dispatcher.on_ack(node_id, ack, now)
    }

    pub async fn on_result(
        &self,
        node_id: &str,
        result: &CommandResultPayload,
        now: DateTime<Utc>,
    ) {
        if let Some(finished) = self.dispatcher.on_result(node_id, result, now) {
            self.apply_command_outcome(&finished, now).await;
        }
    }

    pub async fn on_deployment_status(
        &self,
        node_id: &str,
        event: &DeploymentStatusPayload,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let handle = self
            .deployments
            .get(&event.deployment_id)
            .ok_or_else(|| ControllerError::DeploymentNotFound(event.deployment_id.clone()))?;

        let snapshot = {
            let mut deployment = handle.lock().await;
            if deployment.node_id != node_id {
                return Err(TransitionError::WrongNode {
                    deployment_id: deployment.deployment_id.clone(),
                    owner: deployment.node_id.clone(),
                    reporter: node_id.to_string(),
                }
                .into());
            }

            let previous = deployment.status;
            if deployment.apply_status_event(event, now)? {
                info!(
                    "Deployment {} {} -> {} (reported by {})",
                    deployment.deployment_id, previous, deployment.status, node_id
                );
            }
            deployment.clone()
        };

        self.mirror
            .publish(MirrorRecord::Deployment(Box::new(snapshot)));
        Ok(())
    }

    pub async fn on_deployment_logs(
        &self,
        node_id: &str,
        logs: &DeploymentLogsPayload,
    ) -> Result<(), ControllerError> {
        let handle = self
            .deployments
            .get(&logs.deployment_id)
            .ok_or_else(|| ControllerError::DeploymentNotFound(logs.deployment_id.clone()))?;

        let owner = handle.lock().await.node_id.clone();
        if owner != node_id {
            return Err(TransitionError::WrongNode {
                deployment_id: logs.deployment_id.clone(),
                owner,
                reporter: node_id.to_string(),
            }
            .into());
        }

        self.logs.append(&logs.deployment_id, &logs.logs);
        Ok(())
    }

    /// Progress events name their command through `metadata.correlationId`
    pub fn on_download_progress(
        &self,
        node_id: &str,
        correlation_id: Option<&str>,
        progress: &ModelDownloadProgressPayload,
    ) {
        debug!(
            "Model {} download on {} at {}%",
            progress.model_id, node_id, progress.progress
        );
        if let Some(message_id) = correlation_id {
            self.dispatcher
                .on_progress(node_id, message_id, progress.progress);
        }
    }

    /// Deployment side effects of a finished deployment command
    async fn apply_command_outcome(&self, command: &OutstandingCommand, now: DateTime<Utc>) {
        use DeploymentStatus::*;

        let success_path: &[DeploymentStatus] = match command.kind {
            MessageType::DeploymentCreate => &[Starting, Running],
            MessageType::DeploymentStop | MessageType::DeploymentDelete => &[Stopping, Stopped],
            MessageType::DeploymentRestart => &[Restarting, Running],
            _ => return,
        };
        let Some(deployment_id) = command.resource_id() else {
            return;
        };
        let Some(handle) = self.deployments.get(deployment_id) else {
            debug!(
                "Outcome of {} for unknown deployment {}",
                command.message_id, deployment_id
            );
            return;
        };

        let cause = if command.status == CommandStatus::Timeout {
            TransitionCause::CommandTimeout
        } else {
            TransitionCause::CommandResult
        };

        let snapshot = {
            let mut deployment = handle.lock().await;
            let before = deployment.status;

            match command.status {
                CommandStatus::Success => {
                    let restarted = deployment
                        .history
                        .iter()
                        .any(|t| t.to == Restarting && t.at >= command.sent_at);
                    if command.kind == MessageType::DeploymentRestart
                        && deployment.status == Running
                        && !restarted
                    {
                        // worker sent no events; record the cycle
                        let _ = deployment.transition(Restarting, cause, now);
                        let _ = deployment.transition(Running, cause, now);
                    } else if let Err(e) = deployment.advance(success_path, cause, now) {
                        warn!(
                            "Ignoring {} result for deployment {}: {}",
                            command.kind, deployment_id, e
                        );
                    }
                }
                CommandStatus::Error | CommandStatus::Timeout => {
                    let reason = command
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| format!("{} failed", command.kind));

                    if deployment.status == Failed {
                        deployment.error_message = Some(reason);
                    } else if deployment.can_transition(Failed, cause) {
                        // checked above, so fail cannot be rejected
                        let _ = deployment.fail(reason, cause, now);
                    } else {
                        warn!(
                            "{} {} for deployment {} while {}, leaving state unchanged: {}",
                            command.kind, command.status, deployment_id, deployment.status, reason
                        );
                    }
                }
                _ => return,
            }

            if deployment.status != before {
                info!(
                    "Deployment {} {} -> {} after {} {}",
                    deployment_id, before, deployment.status, command.kind, command.status
                );
            }
            deployment.clone()
        };

        self.mirror
            .publish(MirrorRecord::Deployment(Box::new(snapshot)));
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Expire overdue commands and apply their deployment side effects
    ///
    /// Soft-deleted deployments are evicted once they have been deleted for
    /// longer than the command retention window.
    pub async fn sweep_commands(&self, now: DateTime<Utc>) -> usize {
        let expired = self.dispatcher.sweep_timeouts(now);
        for command in &expired {
            self.apply_command_outcome(command, now).await;
        }

        let cutoff = now
            .checked_sub_signed(self.dispatcher.config().retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        for deployment_id in self.deployments.purge_deleted(cutoff).await {
            debug!("Evicted deleted deployment {}", deployment_id);
        }
        expired.len()
    }

    /// Mark nodes offline after `missedBeatThreshold` silent intervals
    pub fn sweep_nodes(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale = self
            .registry
            .sweep_stale(now, self.config.staleness_threshold());
        for node_id in &stale {
            self.publish_node(node_id);
        }
        stale
    }

    // =========================================================================
    // Caller-facing: deployments
    // =========================================================================

    pub async fn create_deployment(
        &self,
        caller: &CallerIdentity,
        request: CreateDeploymentRequest,
    ) -> Result<Deployment, ControllerError> {
        require_write(caller)?;
        request
            .spec
            .validate()
            .map_err(ControllerError::ValidationError)?;

        let node = self.visible_node(caller, &request.node_id)?;
        if !self.sessions.is_registered(&node.node_id) {
            return Err(ControllerError::NodeUnavailable(node.node_id));
        }

        let deployment_id = request
            .deployment_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut deployment = Deployment::new(
            &deployment_id,
            &node.node_id,
            request.spec,
            Ownership::of(caller),
        );
        deployment.labels = request.labels;

        self.deployments
            .insert(deployment)
            .map_err(|_| ControllerError::DeploymentExists(deployment_id.clone()))?;
        let handle = self.deployments.get(&deployment_id).ok_or_else(|| {
            ControllerError::InternalError(format!("deployment {} vanished", deployment_id))
        })?;

        // Held across dispatch so worker events queue behind `starting`
        let mut record = handle.lock().await;
        let now = Utc::now();
        let command = Message::command(
            Payload::DeploymentCreate(record.spec.clone()),
            ResourceRef::deployment(&deployment_id),
        );

        match self.dispatcher.dispatch(&record.node_id, command, now) {
            Ok(message_id) => {
                record.last_command_id = Some(message_id);
                record.transition(DeploymentStatus::Starting, TransitionCause::Operator, now)?;
            }
            Err(e) => {
                drop(record);
                self.deployments.remove(&deployment_id);
                return Err(e.into());
            }
        }

        info!(
            "Deployment {} created on node {}",
            deployment_id, record.node_id
        );
        let snapshot = record.clone();
        drop(record);
        self.mirror
            .publish(MirrorRecord::Deployment(Box::new(snapshot.clone())));
        Ok(snapshot)
    }

    pub async fn stop_deployment(
        &self,
        caller: &CallerIdentity,
        deployment_id: &str,
        options: DeploymentStopPayload,
    ) -> Result<Deployment, ControllerError> {
        require_write(caller)?;
        options.validate().map_err(ControllerError::ValidationError)?;

        let handle = self.deployment_handle(deployment_id)?;
        let mut record = handle.lock().await;
        self.check_visible(caller, &record)?;

        if record.status != DeploymentStatus::Running {
            return Err(ControllerError::InvalidState {
                deployment_id: deployment_id.to_string(),
                status: record.status,
                action: "stop",
            });
        }
        self.ensure_idle(&record)?;

        let command = Message::command(
            Payload::DeploymentStop(options),
            ResourceRef::deployment(deployment_id),
        );
        let message_id = self.dispatcher.dispatch(&record.node_id, command, Utc::now())?;
        record.last_command_id = Some(message_id);
        Ok(record.clone())
    }

    /// From `queued`/`stopped`/`failed` the create is re-issued; a running
    /// deployment gets `deployment.restart`
    pub async fn restart_deployment(
        &self,
        caller: &CallerIdentity,
        deployment_id: &str,
    ) -> Result<Deployment, ControllerError> {
        require_write(caller)?;

        let handle = self.deployment_handle(deployment_id)?;
        let mut record = handle.lock().await;
        self.check_visible(caller, &record)?;
        self.ensure_idle(&record)?;

        let now = Utc::now();
        let resource = ResourceRef::deployment(deployment_id);

        if record.status.is_restartable() {
            let command =
                Message::command(Payload::DeploymentCreate(record.spec.clone()), resource);
            let message_id = self.dispatcher.dispatch(&record.node_id, command, now)?;
            record.last_command_id = Some(message_id);
            record.transition(DeploymentStatus::Starting, TransitionCause::Operator, now)?;
            record.error_message = None;
        } else if record.status == DeploymentStatus::Running {
            let command = Message::command(Payload::DeploymentRestart(EmptyPayload {}), resource);
            let message_id = self.dispatcher.dispatch(&record.node_id, command, now)?;
            record.last_command_id = Some(message_id);
        } else {
            return Err(ControllerError::InvalidState {
                deployment_id: deployment_id.to_string(),
                status: record.status,
                action: "restart",
            });
        }

        info!("Deployment {} restart issued ({})", deployment_id, record.status);
        let snapshot = record.clone();
        drop(record);
        self.mirror
            .publish(MirrorRecord::Deployment(Box::new(snapshot.clone())));
        Ok(snapshot)
    }

    /// Soft delete; a running container is torn down when the node is reachable
    pub async fn delete_deployment(
        &self,
        caller: &CallerIdentity,
        deployment_id: &str,
    ) -> Result<Deployment, ControllerError> {
        require_write(caller)?;

        let handle = self.deployment_handle(deployment_id)?;
        let mut record = handle.lock().await;
        self.check_visible(caller, &record)?;

        let now = Utc::now();
        if record.status == DeploymentStatus::Running && self.sessions.is_registered(&record.node_id)
        {
            let command = Message::command(
                Payload::DeploymentDelete(DeploymentStopPayload {
                    force: true,
                    timeout: None,
                }),
                ResourceRef::deployment(deployment_id),
            );
            match self.dispatcher.dispatch(&record.node_id, command, now) {
                Ok(message_id) => record.last_command_id = Some(message_id),
                Err(e) => warn!(
                    "Could not tear down deployment {} on {}: {}",
                    deployment_id, record.node_id, e
                ),
            }
        }

        record.deleted_at = Some(now);
        record.updated_at = now;
        self.logs.clear(deployment_id);
        info!("Deployment {} deleted", deployment_id);

        let snapshot = record.clone();
        drop(record);
        self.mirror
            .publish(MirrorRecord::Deployment(Box::new(snapshot.clone())));
        Ok(snapshot)
    }

    pub async fn get_deployment(
        &self,
        caller: &CallerIdentity,
        deployment_id: &str,
    ) -> Result<Deployment, ControllerError> {
        let handle = self.deployment_handle(deployment_id)?;
        let record = handle.lock().await;
        self.check_visible(caller, &record)?;
        Ok(record.clone())
    }

    /// Deployments in the caller's scope, oldest first
    pub async fn list_deployments(&self, caller: &CallerIdentity) -> Vec<Deployment> {
        let scope = Scope::for_identity(caller);
        let mut deployments: Vec<_> = self
            .deployments
            .list()
            .await
            .into_iter()
            .filter(|d| !d.is_deleted() && scope.permits(&d.owner))
            .collect();
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        deployments
    }

    pub async fn deployment_logs(
        &self,
        caller: &CallerIdentity,
        deployment_id: &str,
        tail: Option<usize>,
    ) -> Result<Vec<LogEntry>, ControllerError> {
        self.get_deployment(caller, deployment_id).await?;
        Ok(self.logs.tail(deployment_id, tail))
    }

    // =========================================================================
    // Caller-facing: nodes and commands
    // =========================================================================

    pub fn get_node(&self, caller: &CallerIdentity, node_id: &str) -> Result<Node, ControllerError> {
        self.visible_node(caller, node_id)
    }

    pub fn list_nodes(&self, caller: &CallerIdentity) -> Vec<Node> {
        let mut nodes = self.registry.list_scoped(&Scope::for_identity(caller));
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Round-trip `system.healthCheck` and wait for its outcome
    pub async fn health_check(
        &self,
        caller: &CallerIdentity,
        node_id: &str,
        options: SystemHealthCheckPayload,
    ) -> Result<OutstandingCommand, ControllerError> {
        let node = self.visible_node(caller, node_id)?;
        let command = Message::command(
            Payload::SystemHealthCheck(options),
            ResourceRef::system(&node.node_id),
        );
        Ok(self.dispatcher.dispatch_and_wait(&node.node_id, command).await?)
    }

    /// Returns the command's message id; progress is tracked on the command
    pub fn download_model(
        &self,
        caller: &CallerIdentity,
        node_id: &str,
        request: ModelDownloadPayload,
    ) -> Result<String, ControllerError> {
        require_write(caller)?;
        request.validate().map_err(ControllerError::ValidationError)?;
        let node = self.visible_node(caller, node_id)?;

        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| request.source_path.clone());
        let command = Message::command(Payload::ModelDownload(request), ResourceRef::model(model_id));
        Ok(self.dispatcher.dispatch(&node.node_id, command, Utc::now())?)
    }

    pub fn get_command(
        &self,
        caller: &CallerIdentity,
        message_id: &str,
    ) -> Result<OutstandingCommand, ControllerError> {
        let command = self
            .dispatcher
            .get(message_id)
            .ok_or_else(|| ControllerError::CommandNotFound(message_id.to_string()))?;
        self.visible_node(caller, &command.node_id)
            .map_err(|_| ControllerError::CommandNotFound(message_id.to_string()))?;
        Ok(command)
    }

    /// Stop tracking a command; deployment state is left alone
    pub fn cancel_command(
        &self,
        caller: &CallerIdentity,
        message_id: &str,
    ) -> Result<OutstandingCommand, ControllerError> {
        require_write(caller)?;
        self.get_command(caller, message_id)?;
        Ok(self.dispatcher.cancel(message_id, Utc::now())?)
    }

    pub async fn cluster_stats(&self) -> ClusterStats {
        let deployments: Vec<_> = self
            .deployments
            .list()
            .await
            .into_iter()
            .filter(|d| !d.is_deleted())
            .collect();

        let mut by_status = BTreeMap::new();
        for deployment in &deployments {
            *by_status.entry(deployment.status.to_string()).or_insert(0) += 1;
        }

        ClusterStats {
            controller_id: self.config.controller_id.clone(),
            version: PROTOCOL_VERSION.to_string(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            nodes: self.registry.stats(),
            sessions: self.sessions.len(),
            deployments: deployments.len(),
            deployments_by_status: by_status,
            commands_in_flight: self.dispatcher.in_flight(),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Nodes outside the caller's scope read as missing
    fn visible_node(&self, caller: &CallerIdentity, node_id: &str) -> Result<Node, ControllerError> {
        self.registry
            .get(node_id)
            .filter(|n| Scope::for_identity(caller).permits(&n.owner))
            .ok_or_else(|| ControllerError::NodeNotFound(node_id.to_string()))
    }

    fn deployment_handle(
        &self,
        deployment_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<Deployment>>, ControllerError> {
        self.deployments
            .get(deployment_id)
            .ok_or_else(|| ControllerError::DeploymentNotFound(deployment_id.to_string()))
    }

    fn check_visible(
        &self,
        caller: &CallerIdentity,
        deployment: &Deployment,
    ) -> Result<(), ControllerError> {
        if deployment.is_deleted() || !Scope::for_identity(caller).permits(&deployment.owner) {
            return Err(ControllerError::DeploymentNotFound(
                deployment.deployment_id.clone(),
            ));
        }
        Ok(())
    }

    fn ensure_idle(&self, deployment: &Deployment) -> Result<(), ControllerError> {
        let in_flight = deployment
            .last_command_id
            .as_deref()
            .and_then(|id| self.dispatcher.get(id))
            .map(|c| !c.is_terminal())
            .unwrap_or(false);
        if in_flight {
            return Err(ControllerError::Busy(deployment.deployment_id.clone()));
        }
        Ok(())
    }

    fn publish_node(&self, node_id: &str) {
        if let Some(node) = self.registry.get(node_id) {
            self.mirror.publish(MirrorRecord::Node(Box::new(node)));
        }
    }
}

fn require_write(caller: &CallerIdentity) -> Result<(), ControllerError> {
    if !caller.can_write() {
        return Err(ControllerError::Forbidden(
            "caller holds no role that can issue commands".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::tests::{heartbeat, register_payload};
    use crate::protocol::NodeStatus;
    use chrono::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn controller() -> Arc<ClusterController> {
        Arc::new(ClusterController::from_config(
            ControllerConfig::default(),
            MirrorHandle::disabled(),
        ))
    }

    fn admin() -> CallerIdentity {
        CallerIdentity {
            roles: vec!["universe.owner".to_string()],
            ..Default::default()
        }
    }

    fn org_caller(org: &str, role: &str) -> CallerIdentity {
        CallerIdentity {
            org_id: Some(org.to_string()),
            roles: vec![role.to_string()],
            ..Default::default()
        }
    }

    fn identity(node_id: &str, org: Option<&str>) -> NodeIdentity {
        NodeIdentity {
            node_id: node_id.to_string(),
            owner: Ownership {
                org_id: org.map(str::to_string),
                ..Default::default()
            },
        }
    }

    /// Register `node_id` with a live session and return its outbound queue
    fn connect(
        controller: &ClusterController,
        node: &NodeIdentity,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = controller
            .sessions()
            .attach(&node.node_id, tx, CancellationToken::new());
        controller.register_node(node, &register_payload(&node.node_id), Utc::now());
        assert!(controller.activate_session(&node.node_id, &session_id));
        rx
    }

    fn spec() -> DeploymentCreatePayload {
        DeploymentCreatePayload {
            model_id: "llama".to_string(),
            model_path: "/models/llama".to_string(),
            container_name: "llama-d1".to_string(),
            container_image: "vllm/vllm-openai".to_string(),
            container_port: 8000,
            gpu_device_id: "0".to_string(),
            gpu_memory_limit: None,
            environment: HashMap::new(),
            health_check_path: None,
            health_check_interval: None,
            execution_id: None,
            step_index: None,
        }
    }

    fn request(deployment_id: &str, node_id: &str) -> CreateDeploymentRequest {
        CreateDeploymentRequest {
            deployment_id: Some(deployment_id.to_string()),
            node_id: node_id.to_string(),
            spec: spec(),
            labels: HashMap::new(),
        }
    }

    fn success(message_id: &str) -> CommandResultPayload {
        CommandResultPayload::success(message_id, None)
    }

    fn failure(message_id: &str, code: ErrorCode) -> CommandResultPayload {
        CommandResultPayload::failure(message_id, ErrorDetails::from_code(code))
    }

    #[test]
    fn test_error_codes_for_workers() {
        assert_eq!(
            ControllerError::DeploymentNotFound("d1".to_string()).error_code(),
            ErrorCode::DeploymentNotFound
        );
        assert_eq!(
            ControllerError::DeploymentExists("d1".to_string()).error_code(),
            ErrorCode::AlreadyRunning
        );
        let invalid = ControllerError::InvalidState {
            deployment_id: "d1".to_string(),
            status: DeploymentStatus::Starting,
            action: "stop",
        };
        assert_eq!(invalid.error_code(), ErrorCode::NotRunning);
        assert_eq!(
            ControllerError::Busy("d1".to_string()).error_code(),
            ErrorCode::CommandInvalid
        );

        // Nothing on the controller side is a missing model
        let details = ControllerError::Busy("d1".to_string()).to_error_details();
        assert_ne!(details.code.code(), 2003);
    }

    #[tokio::test]
    async fn test_register_ack_carries_intervals() {
        let controller = controller();
        let ack = controller.register_node(&identity("n1", None), &register_payload("n1"), Utc::now());

        let Payload::RegisterAck(ack) = ack.payload else {
            panic!("expected register.ack");
        };
        assert_eq!(ack.node_id, "n1");
        assert_eq!(ack.controller_info.heartbeat_interval, 30_000);
        assert_eq!(ack.controller_info.metrics_interval, 60_000);
        assert!(ack.pending_commands.is_empty());

        // Not eligible for commands until activated
        assert!(!controller.sessions().is_registered("n1"));
    }

    #[tokio::test]
    async fn test_create_runs_to_running() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));

        let deployment = controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Starting);

        let command = rx.try_recv().unwrap();
        assert_eq!(command.kind, MessageType::DeploymentCreate);
        assert_eq!(command.resource_id(), Some("d1"));
        assert_eq!(deployment.last_command_id.as_deref(), Some(command.message_id.as_str()));

        controller
            .on_result("n1", &success(&command.message_id), Utc::now())
            .await;

        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Running);
        let path: Vec<_> = deployment.history.iter().map(|t| t.to).collect();
        assert_eq!(path, vec![DeploymentStatus::Starting, DeploymentStatus::Running]);
    }

    #[tokio::test]
    async fn test_create_on_disconnected_node_keeps_nothing() {
        let controller = controller();
        controller.register_node(&identity("n1", None), &register_payload("n1"), Utc::now());

        let err = controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NodeUnavailable(_)));
        assert!(controller.deployments().is_empty());

        let err = controller
            .create_deployment(&admin(), request("d1", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_validation_and_duplicates() {
        let controller = controller();
        let _rx = connect(&controller, &identity("n1", None));

        let mut bad = request("d1", "n1");
        bad.spec.container_port = 80;
        assert!(matches!(
            controller.create_deployment(&admin(), bad).await,
            Err(ControllerError::ValidationError(_))
        ));

        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        assert!(matches!(
            controller.create_deployment(&admin(), request("d1", "n1")).await,
            Err(ControllerError::DeploymentExists(_))
        ));
    }

    #[tokio::test]
    async fn test_create_error_result_fails_deployment() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let command = rx.try_recv().unwrap();

        controller
            .on_result("n1", &failure(&command.message_id, ErrorCode::GpuUnavailable), Utc::now())
            .await;

        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.error_message.unwrap().contains("2004"));
    }

    #[tokio::test]
    async fn test_create_timeout_fails_deployment() {
        let controller = controller();
        let _rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();

        let expired = controller
            .sweep_commands(Utc::now() + Duration::seconds(30))
            .await;
        assert_eq!(expired, 1);

        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        let last = deployment.history.last().unwrap();
        assert_eq!(last.cause, TransitionCause::CommandTimeout);
    }

    #[tokio::test]
    async fn test_stop_requires_running_then_stops() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();

        let err = controller
            .stop_deployment(&admin(), "d1", DeploymentStopPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidState { .. }));

        let create = rx.try_recv().unwrap();
        controller
            .on_result("n1", &success(&create.message_id), Utc::now())
            .await;

        controller
            .stop_deployment(&admin(), "d1", DeploymentStopPayload::default())
            .await
            .unwrap();
        let stop = rx.try_recv().unwrap();
        assert_eq!(stop.kind, MessageType::DeploymentStop);

        // A second stop while the first is in flight is refused
        assert!(matches!(
            controller
                .stop_deployment(&admin(), "d1", DeploymentStopPayload::default())
                .await,
            Err(ControllerError::Busy(_))
        ));

        controller
            .on_result("n1", &success(&stop.message_id), Utc::now())
            .await;
        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_timeout_while_stopping_keeps_state() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let create = rx.try_recv().unwrap();
        controller
            .on_result("n1", &success(&create.message_id), Utc::now())
            .await;
        controller
            .stop_deployment(&admin(), "d1", DeploymentStopPayload::default())
            .await
            .unwrap();

        let event = DeploymentStatusPayload::new("d1", "n1", DeploymentStatus::Stopping);
        controller
            .on_deployment_status("n1", &event, Utc::now())
            .await
            .unwrap();

        controller
            .sweep_commands(Utc::now() + Duration::seconds(30))
            .await;
        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Stopping);
    }

    #[tokio::test]
    async fn test_restart_paths() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let create = rx.try_recv().unwrap();
        controller
            .on_result("n1", &failure(&create.message_id, ErrorCode::ContainerStartFailed), Utc::now())
            .await;

        // failed -> starting with a fresh create
        let deployment = controller.restart_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Starting);
        assert!(deployment.error_message.is_none());
        let recreate = rx.try_recv().unwrap();
        assert_eq!(recreate.kind, MessageType::DeploymentCreate);

        controller
            .on_result("n1", &success(&recreate.message_id), Utc::now())
            .await;

        // running -> deployment.restart
        controller.restart_deployment(&admin(), "d1").await.unwrap();
        let restart = rx.try_recv().unwrap();
        assert_eq!(restart.kind, MessageType::DeploymentRestart);
        controller
            .on_result("n1", &success(&restart.message_id), Utc::now())
            .await;

        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert!(deployment
            .history
            .iter()
            .any(|t| t.to == DeploymentStatus::Restarting));
    }

    #[tokio::test]
    async fn test_status_event_from_other_node_rejected() {
        let controller = controller();
        let _rx1 = connect(&controller, &identity("n1", None));
        let _rx2 = connect(&controller, &identity("n2", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();

        let event = DeploymentStatusPayload::new("d1", "n2", DeploymentStatus::Running);
        let err = controller
            .on_deployment_status("n2", &event, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::CommandInvalid);

        let illegal = DeploymentStatusPayload::new("d1", "n1", DeploymentStatus::Stopped);
        let err = controller
            .on_deployment_status("n1", &illegal, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Transition(TransitionError::Illegal { .. })
        ));
    }

    #[tokio::test]
    async fn test_scope_filters_reads() {
        let controller = controller();
        let _rx1 = connect(&controller, &identity("n1", Some("org-a")));
        let _rx2 = connect(&controller, &identity("n2", Some("org-b")));

        let editor_a = org_caller("org-a", "organization.editor");
        controller
            .create_deployment(&editor_a, request("d1", "n1"))
            .await
            .unwrap();

        // org-a cannot reach org-b's node
        assert!(matches!(
            controller.create_deployment(&editor_a, request("d2", "n2")).await,
            Err(ControllerError::NodeNotFound(_))
        ));

        let viewer_b = org_caller("org-b", "organization.viewer");
        assert_eq!(controller.list_nodes(&viewer_b).len(), 1);
        assert!(controller.list_deployments(&viewer_b).await.is_empty());
        assert!(controller.get_deployment(&viewer_b, "d1").await.is_err());

        assert_eq!(controller.list_nodes(&admin()).len(), 2);
        assert_eq!(controller.list_deployments(&admin()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_viewer_cannot_issue_commands() {
        let controller = controller();
        let _rx = connect(&controller, &identity("n1", Some("org-a")));

        let viewer = org_caller("org-a", "organization.viewer");
        let err = controller
            .create_deployment(&viewer, request("d1", "n1"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::MissingRole);
    }

    #[tokio::test]
    async fn test_cancel_leaves_deployment_alone() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let command = rx.try_recv().unwrap();

        let cancelled = controller
            .cancel_command(&admin(), &command.message_id)
            .unwrap();
        assert_eq!(cancelled.status, CommandStatus::Cancelled);

        // late result is discarded
        controller
            .on_result("n1", &success(&command.message_id), Utc::now())
            .await;
        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Starting);
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_tears_down() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let create = rx.try_recv().unwrap();
        controller
            .on_result("n1", &success(&create.message_id), Utc::now())
            .await;

        let deleted = controller.delete_deployment(&admin(), "d1").await.unwrap();
        assert!(deleted.is_deleted());
        let teardown = rx.try_recv().unwrap();
        assert_eq!(teardown.kind, MessageType::DeploymentDelete);

        assert!(controller.list_deployments(&admin()).await.is_empty());
        assert!(controller.deployments().contains("d1"));
        assert!(matches!(
            controller.get_deployment(&admin(), "d1").await,
            Err(ControllerError::DeploymentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_and_stale_sweep() {
        let controller = controller();
        let _rx1 = connect(&controller, &identity("n1", None));
        let _rx2 = connect(&controller, &identity("n2", None));

        controller.on_disconnect("n1", Utc::now());
        assert_eq!(
            controller.registry().get("n1").unwrap().status,
            NodeStatus::Offline
        );

        // 3 x 30s without a heartbeat
        let later = Utc::now() + Duration::seconds(91);
        assert_eq!(controller.sweep_nodes(later), vec!["n2".to_string()]);

        controller
            .on_heartbeat("n2", &heartbeat("n2", NodeStatus::Healthy), later)
            .unwrap();
        assert_eq!(
            controller.registry().get("n2").unwrap().status,
            NodeStatus::Healthy
        );

        assert!(matches!(
            controller.on_heartbeat("ghost", &heartbeat("ghost", NodeStatus::Healthy), later),
            Err(ControllerError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_late_worker_events_do_not_revive_timed_out_deployment() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let create = rx.try_recv().unwrap();

        let t0 = Utc::now();
        assert_eq!(controller.sweep_commands(t0 + Duration::seconds(11)).await, 1);
        assert_eq!(
            controller.get_deployment(&admin(), "d1").await.unwrap().status,
            DeploymentStatus::Failed
        );

        let late = t0 + Duration::seconds(20);
        let ack = CommandAckPayload {
            original_message_id: create.message_id.clone(),
            status: Default::default(),
            estimated_duration: None,
        };
        assert!(!controller.on_ack("n1", &ack, late));

        for status in [DeploymentStatus::Starting, DeploymentStatus::Running] {
            let event = DeploymentStatusPayload::new("d1", "n1", status);
            let err = controller
                .on_deployment_status("n1", &event, late)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ControllerError::Transition(TransitionError::Illegal {
                    from: DeploymentStatus::Failed,
                    ..
                })
            ));
            assert_eq!(err.error_code(), ErrorCode::CommandInvalid);
        }
        controller
            .on_result("n1", &success(&create.message_id), late)
            .await;

        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        let path: Vec<_> = deployment.history.iter().map(|t| t.to).collect();
        assert_eq!(path, vec![DeploymentStatus::Starting, DeploymentStatus::Failed]);
    }

    #[tokio::test]
    async fn test_worker_events_drive_create() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let create = rx.try_recv().unwrap();
        let now = Utc::now();

        let ack = CommandAckPayload {
            original_message_id: create.message_id.clone(),
            status: Default::default(),
            estimated_duration: Some(60),
        };
        assert!(controller.on_ack("n1", &ack, now));

        let mut starting = DeploymentStatusPayload::new("d1", "n1", DeploymentStatus::Starting);
        starting.container_id = Some("c-1".to_string());
        controller
            .on_deployment_status("n1", &starting, now)
            .await
            .unwrap();
        controller
            .on_deployment_status(
                "n1",
                &DeploymentStatusPayload::new("d1", "n1", DeploymentStatus::Running),
                now,
            )
            .await
            .unwrap();
        controller
            .on_result("n1", &success(&create.message_id), now)
            .await;

        let deployment = controller.get_deployment(&admin(), "d1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert_eq!(deployment.container_id.as_deref(), Some("c-1"));
        assert_eq!(deployment.history.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_ack_estimate_falls_back() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let create = rx.try_recv().unwrap();

        let data = serde_json::json!({
            "originalMessageId": create.message_id,
            "status": "acknowledged",
            "estimatedDuration": 10_000_000_000_000_000u64
        });
        let Payload::CommandAck(ack) = Payload::decode(MessageType::CommandAck, data).unwrap()
        else {
            panic!("expected command.ack");
        };

        let now = Utc::now();
        assert!(controller.on_ack("n1", &ack, now));
        let command = controller.dispatcher().get(&create.message_id).unwrap();
        assert_eq!(command.status, CommandStatus::Acknowledged);
        assert_eq!(
            command.result_deadline,
            now + controller.dispatcher().config().default_result_timeout
        );
    }

    #[tokio::test]
    async fn test_disconnect_keeps_deployment_and_in_flight_stop() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        let create = rx.try_recv().unwrap();
        controller
            .on_result("n1", &success(&create.message_id), Utc::now())
            .await;

        let stopped = controller
            .stop_deployment(&admin(), "d1", DeploymentStopPayload::default())
            .await
            .unwrap();
        let stop_id = stopped.last_command_id.unwrap();
        let t0 = controller.dispatcher().get(&stop_id).unwrap().sent_at;

        controller.on_disconnect("n1", t0 + Duration::seconds(1));
        assert_eq!(
            controller.registry().get("n1").unwrap().status,
            NodeStatus::Offline
        );
        assert_eq!(
            controller.get_deployment(&admin(), "d1").await.unwrap().status,
            DeploymentStatus::Running
        );

        // Still outstanding until the ack deadline passes
        assert_eq!(controller.sweep_commands(t0 + Duration::seconds(5)).await, 0);
        let command = controller.dispatcher().get(&stop_id).unwrap();
        assert_eq!(command.status, CommandStatus::Sent);
        assert_eq!(controller.dispatcher().in_flight(), 1);

        assert_eq!(controller.sweep_commands(t0 + Duration::seconds(11)).await, 1);
        assert_eq!(
            controller.dispatcher().get(&stop_id).unwrap().status,
            CommandStatus::Timeout
        );
    }

    #[tokio::test]
    async fn test_sweep_evicts_old_deletions() {
        let controller = controller();
        let _rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();
        controller
            .create_deployment(&admin(), request("d2", "n1"))
            .await
            .unwrap();

        let deleted = controller.delete_deployment(&admin(), "d1").await.unwrap();
        let deleted_at = deleted.deleted_at.unwrap();

        // Default retention is 300s
        controller
            .sweep_commands(deleted_at + Duration::seconds(299))
            .await;
        assert!(controller.deployments().contains("d1"));

        controller
            .sweep_commands(deleted_at + Duration::seconds(300))
            .await;
        assert!(!controller.deployments().contains("d1"));
        assert!(controller.deployments().contains("d2"));
    }

    #[tokio::test]
    async fn test_health_check_round_trip() {
        let controller = controller();
        let mut rx = connect(&controller, &identity("n1", None));

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .health_check(&admin(), "n1", SystemHealthCheckPayload::default())
                    .await
            })
        };

        let command = rx.recv().await.unwrap();
        assert_eq!(command.kind, MessageType::SystemHealthCheck);
        controller
            .on_result(
                "n1",
                &CommandResultPayload::success(
                    &command.message_id,
                    Some(serde_json::json!({"status": "healthy"})),
                ),
                Utc::now(),
            )
            .await;

        let finished = waiter.await.unwrap().unwrap();
        assert_eq!(finished.status, CommandStatus::Success);
        assert_eq!(finished.result.unwrap()["status"], "healthy");
    }

    #[tokio::test]
    async fn test_cluster_stats() {
        let controller = controller();
        let _rx = connect(&controller, &identity("n1", None));
        controller
            .create_deployment(&admin(), request("d1", "n1"))
            .await
            .unwrap();

        let stats = controller.cluster_stats().await;
        assert_eq!(stats.nodes.total, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.deployments, 1);
        assert_eq!(stats.deployments_by_status.get("starting"), Some(&1));
        assert_eq!(stats.commands_in_flight, 1);
    }
}
