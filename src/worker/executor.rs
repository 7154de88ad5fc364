//! Provisioning backend behind the worker's command handler
//!
//! [`CommandExecutor`] is the seam between protocol handling and the host:
//! the docker implementation drives real containers, while
//! [`SimulatedExecutor`] keeps everything in memory for tests and for
//! `nodelink worker --simulate`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::{
    ContainerRuntime, DeploymentCreatePayload, DeploymentStopPayload, DeploymentUpdatePayload,
    ErrorCode, ErrorDetails, GpuDevice, LogEntry, LogLevel, LogSource, ModelDownloadPayload,
    ModelDownloadProgressPayload, ModelRefPayload,
};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("GPU device '{0}' is not available on this node")]
    GpuUnavailable(String),

    #[error("requested {requested} MB of GPU memory but device '{device}' has {available} MB")]
    InsufficientMemory {
        device: String,
        requested: u64,
        available: u64,
    },

    #[error("container operation failed: {0}")]
    ContainerFailed(String),

    #[error("deployment '{0}' is already running")]
    AlreadyRunning(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("deployment '{0}' is not running")]
    NotRunning(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecutorError::GpuUnavailable(_) => ErrorCode::GpuUnavailable,
            ExecutorError::InsufficientMemory { .. } => ErrorCode::InsufficientMemory,
            ExecutorError::ContainerFailed(_) => ErrorCode::ContainerStartFailed,
            ExecutorError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            ExecutorError::NotFound(_) => ErrorCode::DeploymentNotFound,
            ExecutorError::ModelNotFound(_) => ErrorCode::ModelNotFound,
            ExecutorError::NotRunning(_) => ErrorCode::NotRunning,
            ExecutorError::Unsupported(_) => ErrorCode::CommandInvalid,
            ExecutorError::Download(_) => ErrorCode::NetworkError,
            ExecutorError::Timeout(_) => ErrorCode::Timeout,
            ExecutorError::Io(_) => ErrorCode::InternalError,
        }
    }

    pub fn to_error_details(&self) -> ErrorDetails {
        ErrorDetails::new(self.code(), self.to_string())
    }
}

/// A deployment's container as the worker knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentContainer {
    pub deployment_id: String,
    pub container_id: String,
    pub container_name: String,
    pub endpoint: String,
    pub gpu_device_id: String,
    pub started_at: DateTime<Utc>,
    pub running: bool,
    /// Spec the container was last (re)created from
    #[serde(skip)]
    pub spec: Option<DeploymentCreatePayload>,
}

impl DeploymentContainer {
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> u64 {
        if !self.running {
            return 0;
        }
        (now - self.started_at).num_seconds().max(0) as u64
    }

    /// Result body of create/restart/update commands
    pub fn to_result(&self) -> Value {
        json!({
            "containerId": self.container_id,
            "containerName": self.container_name,
            "endpoint": self.endpoint,
            "startedAt": self.started_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Receives download progress as it happens
pub type ProgressSink = Arc<dyn Fn(ModelDownloadProgressPayload) + Send + Sync>;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runtime descriptor for `node.register`
    async fn runtime(&self) -> Result<ContainerRuntime, ExecutorError>;

    /// GPUs deployments may be pinned to
    fn gpus(&self) -> Vec<GpuDevice>;

    async fn create_deployment(
        &self,
        deployment_id: &str,
        spec: &DeploymentCreatePayload,
    ) -> Result<DeploymentContainer, ExecutorError>;

    async fn stop_deployment(
        &self,
        deployment_id: &str,
        options: &DeploymentStopPayload,
    ) -> Result<DeploymentContainer, ExecutorError>;

    async fn restart_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<DeploymentContainer, ExecutorError>;

    /// Recreate the container with the changed fields applied
    async fn update_deployment(
        &self,
        deployment_id: &str,
        changes: &DeploymentUpdatePayload,
    ) -> Result<DeploymentContainer, ExecutorError>;

    /// Remove the container; `force` kills it if still running
    async fn delete_deployment(&self, deployment_id: &str, force: bool)
        -> Result<(), ExecutorError>;

    fn deployment(&self, deployment_id: &str) -> Option<DeploymentContainer>;

    fn deployments(&self) -> Vec<DeploymentContainer>;

    async fn deployment_logs(
        &self,
        deployment_id: &str,
        tail: u32,
    ) -> Result<Vec<LogEntry>, ExecutorError>;

    async fn download_model(
        &self,
        request: &ModelDownloadPayload,
        progress: ProgressSink,
    ) -> Result<ModelInfo, ExecutorError>;

    async fn inspect_model(&self, model: &ModelRefPayload) -> Result<ModelInfo, ExecutorError>;

    async fn delete_model(&self, model: &ModelRefPayload) -> Result<(), ExecutorError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ExecutorError>;

    async fn list_containers(&self) -> Result<Value, ExecutorError>;

    async fn inspect_container(&self, container_id: &str) -> Result<Value, ExecutorError>;

    async fn container_logs(
        &self,
        container_id: &str,
        tail: Option<u32>,
    ) -> Result<Vec<String>, ExecutorError>;

    async fn container_stats(&self, container_id: &str) -> Result<Value, ExecutorError>;
}

/// Placement checks shared by every executor
pub fn check_placement(
    spec: &DeploymentCreatePayload,
    gpus: &[GpuDevice],
) -> Result<(), ExecutorError> {
    let gpu = gpus
        .iter()
        .find(|g| g.device_id == spec.gpu_device_id)
        .ok_or_else(|| ExecutorError::GpuUnavailable(spec.gpu_device_id.clone()))?;

    if let Some(requested) = spec.gpu_memory_limit {
        if gpu.memory_total > 0 && requested > gpu.memory_total {
            return Err(ExecutorError::InsufficientMemory {
                device: gpu.device_id.clone(),
                requested,
                available: gpu.memory_total,
            });
        }
    }
    Ok(())
}

/// Apply an update to a create spec
pub fn merge_update(
    spec: &DeploymentCreatePayload,
    changes: &DeploymentUpdatePayload,
) -> DeploymentCreatePayload {
    let mut next = spec.clone();
    if let Some(image) = &changes.container_image {
        next.container_image = image.clone();
    }
    if let Some(env) = &changes.environment {
        next.environment.extend(env.clone());
    }
    if changes.gpu_memory_limit.is_some() {
        next.gpu_memory_limit = changes.gpu_memory_limit;
    }
    next
}

/// In-memory executor that provisions nothing
///
/// Containers "start" instantly on the configured GPUs; models are
/// recorded by id with their target path.
pub struct SimulatedExecutor {
    gpus: Vec<GpuDevice>,
    containers: DashMap<String, DeploymentContainer>,
    models: DashMap<String, ModelInfo>,
    delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(gpus: Vec<GpuDevice>) -> Self {
        Self {
            gpus,
            containers: DashMap::new(),
            models: DashMap::new(),
            delay: Duration::ZERO,
        }
    }

    /// One GPU `"0"` with 24 GB of memory
    pub fn single_gpu() -> Self {
        Self::new(vec![GpuDevice {
            device_id: "0".to_string(),
            model: "Simulated GPU".to_string(),
            memory_total: 24_576,
            ..Default::default()
        }])
    }

    /// Pause this long inside every mutating operation
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn container_for(deployment_id: &str, spec: &DeploymentCreatePayload) -> DeploymentContainer {
        DeploymentContainer {
            deployment_id: deployment_id.to_string(),
            container_id: format!("sim-{}", uuid::Uuid::new_v4().simple()),
            container_name: spec.container_name.clone(),
            endpoint: format!("http://127.0.0.1:{}", spec.container_port),
            gpu_device_id: spec.gpu_device_id.clone(),
            started_at: Utc::now(),
            running: true,
            spec: Some(spec.clone()),
        }
    }

    fn find_container(&self, container_id: &str) -> Option<DeploymentContainer> {
        self.containers
            .iter()
            .find(|c| c.container_id == container_id || c.container_name == container_id)
            .map(|c| c.value().clone())
    }
}

#[async_trait]
impl CommandExecutor for SimulatedExecutor {
    async fn runtime(&self) -> Result<ContainerRuntime, ExecutorError> {
        Ok(ContainerRuntime {
            runtime_type: "simulated".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            root_dir: String::new(),
        })
    }

    fn gpus(&self) -> Vec<GpuDevice> {
        self.gpus.clone()
    }

    async fn create_deployment(
        &self,
        deployment_id: &str,
        spec: &DeploymentCreatePayload,
    ) -> Result<DeploymentContainer, ExecutorError> {
        if matches!(self.containers.get(deployment_id), Some(c) if c.running) {
            return Err(ExecutorError::AlreadyRunning(deployment_id.to_string()));
        }
        check_placement(spec, &self.gpus)?;
        self.pause().await;

        let container = Self::container_for(deployment_id, spec);
        self.containers
            .insert(deployment_id.to_string(), container.clone());
        Ok(container)
    }

    async fn stop_deployment(
        &self,
        deployment_id: &str,
        _options: &DeploymentStopPayload,
    ) -> Result<DeploymentContainer, ExecutorError> {
        let mut container = self
            .containers
            .get_mut(deployment_id)
            .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))?;
        if !container.running {
            return Err(ExecutorError::NotRunning(deployment_id.to_string()));
        }
        container.running = false;
        let stopped = container.clone();
        drop(container);
        self.pause().await;
        Ok(stopped)
    }

    async fn restart_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<DeploymentContainer, ExecutorError> {
        self.pause().await;
        let mut container = self
            .containers
            .get_mut(deployment_id)
            .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))?;
        container.running = true;
        container.started_at = Utc::now();
        Ok(container.clone())
    }

    async fn update_deployment(
        &self,
        deployment_id: &str,
        changes: &DeploymentUpdatePayload,
    ) -> Result<DeploymentContainer, ExecutorError> {
        let current = self
            .deployment(deployment_id)
            .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))?;
        let spec = current
            .spec
            .as_ref()
            .map(|s| merge_update(s, changes))
            .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))?;
        check_placement(&spec, &self.gpus)?;
        self.pause().await;

        let container = Self::container_for(deployment_id, &spec);
        self.containers
            .insert(deployment_id.to_string(), container.clone());
        Ok(container)
    }

    async fn delete_deployment(
        &self,
        deployment_id: &str,
        force: bool,
    ) -> Result<(), ExecutorError> {
        match self.containers.get(deployment_id) {
            None => return Err(ExecutorError::NotFound(deployment_id.to_string())),
            Some(c) if c.running && !force => {
                return Err(ExecutorError::AlreadyRunning(deployment_id.to_string()))
            }
            Some(_) => {}
        }
        self.containers.remove(deployment_id);
        Ok(())
    }

    fn deployment(&self, deployment_id: &str) -> Option<DeploymentContainer> {
        self.containers.get(deployment_id).map(|c| c.value().clone())
    }

    fn deployments(&self) -> Vec<DeploymentContainer> {
        let mut all: Vec<_> = self.containers.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.deployment_id.cmp(&b.deployment_id));
        all
    }

    async fn deployment_logs(
        &self,
        deployment_id: &str,
        _tail: u32,
    ) -> Result<Vec<LogEntry>, ExecutorError> {
        let container = self
            .deployment(deployment_id)
            .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))?;
        Ok(vec![LogEntry {
            timestamp: container.started_at,
            level: LogLevel::Info,
            source: LogSource::Stdout,
            message: format!("{} listening on {}", container.container_name, container.endpoint),
        }])
    }

    async fn download_model(
        &self,
        request: &ModelDownloadPayload,
        progress: ProgressSink,
    ) -> Result<ModelInfo, ExecutorError> {
        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| request.source_path.clone());
        for step in [50u8, 100] {
            self.pause().await;
            progress(ModelDownloadProgressPayload {
                model_id: model_id.clone(),
                progress: step,
                bytes_downloaded: step as u64,
                total_bytes: Some(100),
            });
        }
        let info = ModelInfo {
            model_id: model_id.clone(),
            path: PathBuf::from(&request.target_path),
            size_bytes: 100,
        };
        self.models.insert(model_id, info.clone());
        Ok(info)
    }

    async fn inspect_model(&self, model: &ModelRefPayload) -> Result<ModelInfo, ExecutorError> {
        self.models
            .get(&model.model_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| ExecutorError::ModelNotFound(model.model_id.clone()))
    }

    async fn delete_model(&self, model: &ModelRefPayload) -> Result<(), ExecutorError> {
        self.models
            .remove(&model.model_id)
            .map(|_| ())
            .ok_or_else(|| ExecutorError::ModelNotFound(model.model_id.clone()))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ExecutorError> {
        let mut all: Vec<_> = self.models.iter().map(|m| m.value().clone()).collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(all)
    }

    async fn list_containers(&self) -> Result<Value, ExecutorError> {
        let containers: Vec<_> = self
            .deployments()
            .into_iter()
            .map(|c| {
                json!({
                    "id": c.container_id,
                    "name": c.container_name,
                    "state": if c.running { "running" } else { "exited" },
                })
            })
            .collect();
        Ok(Value::Array(containers))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<Value, ExecutorError> {
        let container = self
            .find_container(container_id)
            .ok_or_else(|| ExecutorError::NotFound(container_id.to_string()))?;
        serde_json::to_value(container).map_err(|e| ExecutorError::ContainerFailed(e.to_string()))
    }

    async fn container_logs(
        &self,
        container_id: &str,
        _tail: Option<u32>,
    ) -> Result<Vec<String>, ExecutorError> {
        let container = self
            .find_container(container_id)
            .ok_or_else(|| ExecutorError::NotFound(container_id.to_string()))?;
        Ok(vec![format!("{} started", container.container_name)])
    }

    async fn container_stats(&self, container_id: &str) -> Result<Value, ExecutorError> {
        self.find_container(container_id)
            .ok_or_else(|| ExecutorError::NotFound(container_id.to_string()))?;
        Ok(json!({ "cpuPercent": 0.0, "memoryPercent": 0.0 }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) fn create_spec() -> DeploymentCreatePayload {
        DeploymentCreatePayload {
            model_id: "llama-3-8b".to_string(),
            model_path: "/models/llama-3-8b".to_string(),
            container_name: "llama-3-8b-d1".to_string(),
            container_image: "vllm/vllm-openai:latest".to_string(),
            container_port: 8000,
            gpu_device_id: "0".to_string(),
            gpu_memory_limit: Some(16_384),
            environment: HashMap::from([("HF_HOME".to_string(), "/models".to_string())]),
            health_check_path: Some("/health".to_string()),
            health_check_interval: None,
            execution_id: None,
            step_index: None,
        }
    }

    #[test]
    fn test_placement_checks() {
        let gpus = SimulatedExecutor::single_gpu().gpus();
        assert!(check_placement(&create_spec(), &gpus).is_ok());

        let mut unknown = create_spec();
        unknown.gpu_device_id = "7".to_string();
        let err = check_placement(&unknown, &gpus).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GpuUnavailable);
        assert!(err.to_error_details().retryable);

        let mut greedy = create_spec();
        greedy.gpu_memory_limit = Some(80_000);
        let err = check_placement(&greedy, &gpus).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientMemory);
    }

    #[test]
    fn test_merge_update() {
        let changes = DeploymentUpdatePayload {
            container_image: Some("vllm/vllm-openai:v0.6".to_string()),
            environment: Some(HashMap::from([("LOG".to_string(), "debug".to_string())])),
            gpu_memory_limit: None,
        };
        let merged = merge_update(&create_spec(), &changes);
        assert_eq!(merged.container_image, "vllm/vllm-openai:v0.6");
        assert_eq!(merged.environment.len(), 2);
        assert_eq!(merged.gpu_memory_limit, Some(16_384));
    }

    #[tokio::test]
    async fn test_simulated_lifecycle() {
        let executor = SimulatedExecutor::single_gpu();
        let created = executor.create_deployment("d1", &create_spec()).await.unwrap();
        assert!(created.running);
        assert_eq!(created.endpoint, "http://127.0.0.1:8000");

        let dup = executor.create_deployment("d1", &create_spec()).await.unwrap_err();
        assert_eq!(dup.code(), ErrorCode::AlreadyRunning);

        let stopped = executor
            .stop_deployment("d1", &DeploymentStopPayload::default())
            .await
            .unwrap();
        assert!(!stopped.running);

        let again = executor
            .stop_deployment("d1", &DeploymentStopPayload::default())
            .await
            .unwrap_err();
        assert_eq!(again.code(), ErrorCode::NotRunning);

        let missing = executor
            .stop_deployment("nope", &DeploymentStopPayload::default())
            .await
            .unwrap_err();
        assert_eq!(missing.code(), ErrorCode::DeploymentNotFound);

        executor.delete_deployment("d1", false).await.unwrap();
        assert!(executor.deployments().is_empty());
    }

    #[tokio::test]
    async fn test_simulated_model_download_reports_progress() {
        let executor = SimulatedExecutor::single_gpu();
        let seen = Arc::new(std::sync::Mutex::new(vec![]));
        let sink: ProgressSink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |p: ModelDownloadProgressPayload| seen.lock().unwrap().push(p.progress))
        };
        let request = ModelDownloadPayload {
            model_id: Some("llama".to_string()),
            source: crate::protocol::ModelSource::Http,
            source_path: "https://example.com/llama.gguf".to_string(),
            version: None,
            target_path: "/models/llama.gguf".to_string(),
            credentials: None,
        };

        let info = executor.download_model(&request, sink).await.unwrap();
        assert_eq!(info.model_id, "llama");
        assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
        assert_eq!(executor.list_models().await.unwrap().len(), 1);
    }
}
