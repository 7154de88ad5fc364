//! Worker-side command handling
//!
//! Every command goes through the same sequence: `command.ack` with an
//! estimated duration, execution on the [`CommandExecutor`], the
//! `deployment.status` / `model.downloadProgress` events it implies, then a
//! single `command.result`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::executor::{CommandExecutor, DeploymentContainer, ExecutorError, ProgressSink};
use crate::metrics::SharedMetricsCollector;
use crate::protocol::{
    AckState, CommandAckPayload, CommandResultPayload, DeploymentEvent, DeploymentLogsPayload,
    DeploymentStatus, DeploymentStatusPayload, ErrorCode, ErrorDetails, HealthStatus, LogLevel,
    Message, MessageType, Payload,
};

/// Log lines forwarded after a deployment starts
const STARTUP_LOG_LINES: u32 = 50;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0} is not a command")]
    NotACommand(MessageType),

    #[error("{0} is reserved and not handled by this worker")]
    Reserved(MessageType),

    #[error("{0} is not supported by this worker")]
    Unsupported(MessageType),

    #[error("{kind} requires a {expected} resource")]
    MissingResource {
        kind: MessageType,
        expected: &'static str,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl CommandError {
    pub fn to_error_details(&self) -> ErrorDetails {
        match self {
            CommandError::Executor(e) => e.to_error_details(),
            other => ErrorDetails::new(ErrorCode::CommandInvalid, other.to_string()),
        }
    }
}

/// Seconds the worker expects a command of this kind to take
pub fn estimated_duration(kind: MessageType) -> u64 {
    match kind {
        MessageType::DeploymentCreate => 60,
        MessageType::DeploymentStop => 10,
        MessageType::DeploymentDelete => 30,
        MessageType::ModelDownload => 300,
        MessageType::SystemHealthCheck => 2,
        _ => 5,
    }
}

pub struct CommandHandler {
    node_id: String,
    executor: Arc<dyn CommandExecutor>,
    collector: SharedMetricsCollector,
    outbound: mpsc::UnboundedSender<Message>,
}

impl CommandHandler {
    pub fn new(
        node_id: impl Into<String>,
        executor: Arc<dyn CommandExecutor>,
        collector: SharedMetricsCollector,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            executor,
            collector,
            outbound,
        }
    }

    fn send(&self, payload: Payload) {
        if self.outbound.send(Message::new(payload)).is_err() {
            debug!("Session closed, dropping outbound message");
        }
    }

    fn send_status(&self, status: DeploymentStatusPayload) {
        self.send(Payload::DeploymentStatus(status));
    }

    /// Ack, execute and report one command
    pub async fn handle(&self, command: Message) {
        let kind = command.kind;
        let resource_id = command.resource_id().unwrap_or_default().to_string();

        if kind.is_reserved() || !kind.is_command() {
            let error = if kind.is_reserved() {
                CommandError::Reserved(kind)
            } else {
                CommandError::NotACommand(kind)
            };
            warn!("Rejecting {} {}: {}", kind, command.message_id, error);
            self.send(Payload::CommandResult(
                CommandResultPayload::failure(&command.message_id, error.to_error_details())
                    .with_resource_id(resource_id),
            ));
            return;
        }

        self.send(Payload::CommandAck(CommandAckPayload {
            original_message_id: command.message_id.clone(),
            status: AckState::Acknowledged,
            estimated_duration: Some(estimated_duration(kind)),
        }));
        info!("Executing {} for {} ({})", kind, resource_id, command.message_id);

        let result = match self.execute(&command).await {
            Ok(value) => {
                info!("{} for {} succeeded", kind, resource_id);
                CommandResultPayload::success(&command.message_id, value)
            }
            Err(e) => {
                warn!("{} for {} failed: {}", kind, resource_id, e);
                CommandResultPayload::failure(&command.message_id, e.to_error_details())
            }
        };
        self.send(Payload::CommandResult(result.with_resource_id(resource_id)));
    }

    async fn execute(&self, command: &Message) -> Result<Option<Value>, CommandError> {
        let kind = command.kind;
        let id = command.resource_id().unwrap_or_default();
        let require_id = |expected: &'static str| {
            if id.is_empty() {
                Err(CommandError::MissingResource { kind, expected })
            } else {
                Ok(id)
            }
        };

        match &command.payload {
            Payload::DeploymentCreate(spec) => {
                let deployment_id = require_id("deployment")?;
                let mut starting = DeploymentStatusPayload::new(
                    deployment_id,
                    &self.node_id,
                    DeploymentStatus::Starting,
                );
                starting.previous_status = Some(DeploymentStatus::Queued);
                starting.container_name = Some(spec.container_name.clone());
                starting.gpu_device_id = Some(spec.gpu_device_id.clone());
                self.send_status(starting);

                match self.executor.create_deployment(deployment_id, spec).await {
                    Ok(container) => {
                        self.send_status(self.running_status(
                            &container,
                            DeploymentStatus::Starting,
                            "started",
                        ));
                        self.forward_startup_logs(deployment_id).await;
                        Ok(Some(container.to_result()))
                    }
                    Err(e) => {
                        self.send_status(self.failed_status(
                            deployment_id,
                            DeploymentStatus::Starting,
                            &e,
                        ));
                        Err(e.into())
                    }
                }
            }
            Payload::DeploymentStop(options) => {
                let deployment_id = require_id("deployment")?;
                // Preconditions are checked before announcing `stopping`
                match self.executor.deployment(deployment_id) {
                    None => return Err(ExecutorError::NotFound(deployment_id.to_string()).into()),
                    Some(c) if !c.running => {
                        return Err(ExecutorError::NotRunning(deployment_id.to_string()).into())
                    }
                    Some(_) => {}
                }

                let mut stopping = DeploymentStatusPayload::new(
                    deployment_id,
                    &self.node_id,
                    DeploymentStatus::Stopping,
                );
                stopping.previous_status = Some(DeploymentStatus::Running);
                self.send_status(stopping);

                let stopped = self.executor.stop_deployment(deployment_id, options).await?;
                let mut status = DeploymentStatusPayload::new(
                    deployment_id,
                    &self.node_id,
                    DeploymentStatus::Stopped,
                );
                status.previous_status = Some(DeploymentStatus::Stopping);
                status.container_id = Some(stopped.container_id);
                status.container_name = Some(stopped.container_name);
                self.send_status(status);
                Ok(Some(json!({ "stoppedAt": Utc::now() })))
            }
            Payload::DeploymentRestart(_) => {
                let deployment_id = require_id("deployment")?;
                let was_running = self
                    .executor
                    .deployment(deployment_id)
                    .map(|c| c.running)
                    .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))?;

                let previous = if was_running {
                    let mut restarting = DeploymentStatusPayload::new(
                        deployment_id,
                        &self.node_id,
                        DeploymentStatus::Restarting,
                    );
                    restarting.previous_status = Some(DeploymentStatus::Running);
                    self.send_status(restarting);
                    DeploymentStatus::Restarting
                } else {
                    self.send_status(DeploymentStatusPayload::new(
                        deployment_id,
                        &self.node_id,
                        DeploymentStatus::Starting,
                    ));
                    DeploymentStatus::Starting
                };

                match self.executor.restart_deployment(deployment_id).await {
                    Ok(container) => {
                        self.send_status(self.running_status(&container, previous, "restarted"));
                        Ok(Some(container.to_result()))
                    }
                    Err(e) => {
                        self.send_status(self.failed_status(deployment_id, previous, &e));
                        Err(e.into())
                    }
                }
            }
            Payload::DeploymentUpdate(changes) => {
                let deployment_id = require_id("deployment")?;
                let container = self
                    .executor
                    .update_deployment(deployment_id, changes)
                    .await?;
                let mut status =
                    self.running_status(&container, DeploymentStatus::Running, "updated");
                status.previous_status = None;
                self.send_status(status);
                Ok(Some(container.to_result()))
            }
            Payload::DeploymentDelete(options) => {
                let deployment_id = require_id("deployment")?;
                self.executor
                    .delete_deployment(deployment_id, options.force)
                    .await?;
                Ok(Some(json!({ "deletedAt": Utc::now() })))
            }
            Payload::DeploymentQuery(_) => {
                let deployment_id = require_id("deployment")?;
                let container = self
                    .executor
                    .deployment(deployment_id)
                    .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))?;
                Ok(Some(deployment_summary(&container)))
            }
            Payload::ModelDownload(request) => {
                let outbound = self.outbound.clone();
                let progress: ProgressSink = Arc::new(move |p| {
                    let _ = outbound.send(Message::new(Payload::ModelDownloadProgress(p)));
                });
                let info = self.executor.download_model(request, progress).await?;
                Ok(Some(json!({
                    "modelId": info.model_id,
                    "path": info.path,
                    "sizeBytes": info.size_bytes,
                    "downloadedAt": Utc::now(),
                })))
            }
            Payload::ModelCache(model) => {
                let info = self.executor.inspect_model(model).await?;
                Ok(Some(json!({ "cached": true, "model": info })))
            }
            Payload::ModelDelete(model) => {
                self.executor.delete_model(model).await?;
                Ok(Some(json!({ "modelId": model.model_id, "deleted": true })))
            }
            Payload::ModelList(_) => {
                let models = self.executor.list_models().await?;
                Ok(Some(json!({ "models": models })))
            }
            Payload::ContainerList(_) => Ok(Some(self.executor.list_containers().await?)),
            Payload::ContainerInspect(target) => Ok(Some(
                self.executor.inspect_container(&target.container_id).await?,
            )),
            Payload::ContainerLogs(target) => {
                let lines = self
                    .executor
                    .container_logs(&target.container_id, target.tail)
                    .await?;
                Ok(Some(json!({ "containerId": target.container_id, "logs": lines })))
            }
            Payload::ContainerStats(target) => Ok(Some(
                self.executor.container_stats(&target.container_id).await?,
            )),
            Payload::SystemHealthCheck(options) => {
                let mut result = json!({
                    "nodeStatus": "healthy",
                    "uptimeSeconds": self.collector.read().await.uptime_seconds(),
                    "timestamp": Utc::now(),
                });
                if options.include_metrics {
                    let metrics = self.collector.write().await.metrics(&self.node_id);
                    result["metrics"] = json!({
                        "cpuUsage": metrics.cpu.usage,
                        "ramUsed": metrics.memory.used,
                        "diskUsed": metrics.disk.used,
                        "gpuDevices": metrics.gpu_devices,
                    });
                }
                if options.include_deployments {
                    result["deployments"] = Value::Array(
                        self.executor
                            .deployments()
                            .iter()
                            .map(deployment_summary)
                            .collect(),
                    );
                }
                Ok(Some(result))
            }
            Payload::SystemQuery(_) => {
                let metrics = self.collector.write().await.metrics(&self.node_id);
                let runtime = self.executor.runtime().await.ok();
                Ok(Some(json!({
                    "nodeId": self.node_id,
                    "metrics": metrics,
                    "containerRuntime": runtime,
                    "gpuDevices": self.executor.gpus(),
                    "activeDeployments": self.active_deployments(),
                })))
            }
            Payload::SystemRestart(_) | Payload::SystemUpdate(_) => {
                Err(CommandError::Unsupported(kind))
            }
            _ => Err(CommandError::NotACommand(kind)),
        }
    }

    pub fn active_deployments(&self) -> u32 {
        self.executor
            .deployments()
            .iter()
            .filter(|c| c.running)
            .count() as u32
    }

    fn running_status(
        &self,
        container: &DeploymentContainer,
        previous: DeploymentStatus,
        event: &str,
    ) -> DeploymentStatusPayload {
        let now = Utc::now();
        let mut status = DeploymentStatusPayload::new(
            &container.deployment_id,
            &self.node_id,
            DeploymentStatus::Running,
        );
        status.previous_status = Some(previous);
        status.container_id = Some(container.container_id.clone());
        status.container_name = Some(container.container_name.clone());
        status.endpoint = Some(container.endpoint.clone());
        status.gpu_device_id = Some(container.gpu_device_id.clone());
        status.uptime_seconds = Some(container.uptime_seconds(now));
        status.health_status = Some(HealthStatus::Unknown);
        status.events.push(DeploymentEvent {
            timestamp: now,
            event: event.to_string(),
            message: format!("Container {} {}", container.container_name, event),
            severity: LogLevel::Info,
        });
        status
    }

    fn failed_status(
        &self,
        deployment_id: &str,
        previous: DeploymentStatus,
        error: &ExecutorError,
    ) -> DeploymentStatusPayload {
        let mut status =
            DeploymentStatusPayload::new(deployment_id, &self.node_id, DeploymentStatus::Failed);
        status.previous_status = Some(previous);
        status.error_message = Some(error.to_string());
        status.events.push(DeploymentEvent {
            timestamp: Utc::now(),
            event: "failed".to_string(),
            message: error.to_string(),
            severity: LogLevel::Error,
        });
        status
    }

    async fn forward_startup_logs(&self, deployment_id: &str) {
        match self
            .executor
            .deployment_logs(deployment_id, STARTUP_LOG_LINES)
            .await
        {
            Ok(logs) if !logs.is_empty() => {
                self.send(Payload::DeploymentLogs(DeploymentLogsPayload {
                    deployment_id: deployment_id.to_string(),
                    logs,
                    more_available: false,
                }))
            }
            Ok(_) => {}
            Err(e) => debug!("No startup logs for {}: {}", deployment_id, e),
        }
    }
}

fn deployment_summary(container: &DeploymentContainer) -> Value {
    let status = if container.running {
        DeploymentStatus::Running
    } else {
        DeploymentStatus::Stopped
    };
    json!({
        "deploymentId": container.deployment_id,
        "containerId": container.container_id,
        "containerName": container.container_name,
        "endpoint": container.endpoint,
        "gpuDeviceId": container.gpu_device_id,
        "status": status,
        "uptimeSeconds": container.uptime_seconds(Utc::now()),
    })
}
