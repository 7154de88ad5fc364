//! Strongly-typed `data` payloads, one per message kind
//!
//! [`Payload`] is the sum type selected by an envelope's `type`. Reserved
//! `job.*` and `agent.*` kinds carry an opaque JSON value until they grow a
//! concrete schema.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ErrorDetails;
use super::types::{
    DeploymentStatus, HealthStatus, LogLevel, LogSource, MessageType, NodeStatus,
};

/// Lowest host port a deployment container may bind
pub const MIN_CONTAINER_PORT: u16 = 1024;

/// Smallest GPU memory limit accepted for a deployment (MB)
pub const MIN_GPU_MEMORY_LIMIT_MB: u64 = 1024;

/// Smallest accepted health-check interval (seconds)
pub const MIN_HEALTH_CHECK_INTERVAL_SECS: u64 = 5;

/// Bounds of `deployment.stop` graceful timeout (seconds)
pub const STOP_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 5..=300;

/// Longest duration a worker may announce in a `command.ack` (one day)
pub const MAX_ESTIMATED_DURATION_SECS: u64 = 86_400;

/// Graceful stop timeout used when none is given (seconds)
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Outcome flag on handshake acknowledgments and command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// `command.ack` only ever reports this value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckState {
    #[default]
    Acknowledged,
}

/// Payload for kinds that carry no fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EmptyPayload {}

// ============================================================================
// Connection & registration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAckPayload {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    pub platform: String,
    #[serde(default)]
    pub distro: String,
    #[serde(default)]
    pub version: String,
    pub arch: String,
    #[serde(default)]
    pub kernel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuProcess {
    pub pid: u32,
    pub name: String,
    /// MB
    pub memory_used: u64,
}

/// One GPU as reported by a worker. Memory figures are in MB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    pub device_id: String,
    pub model: String,
    pub memory_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub pcie_bus_id: String,
    #[serde(default)]
    pub cuda_version: String,
    #[serde(default)]
    pub driver_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_draw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<GpuProcess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntime {
    #[serde(rename = "type")]
    pub runtime_type: String,
    pub version: String,
    #[serde(default)]
    pub root_dir: String,
}

/// Full hardware/runtime snapshot sent once per connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegisterPayload {
    pub node_id: String,
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_address: Option<String>,
    pub os: OsInfo,
    pub cpu_cores: u32,
    #[serde(default)]
    pub cpu_model: String,
    /// MB
    pub ram_total: u64,
    /// MB
    pub disk_total: u64,
    #[serde(default)]
    pub gpu_devices: Vec<GpuDevice>,
    pub daemon_version: String,
    #[serde(default)]
    pub node_status: NodeStatus,
    #[serde(default)]
    pub uptime_seconds: u64,
    pub container_runtime: ContainerRuntime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    pub controller_id: String,
    /// Milliseconds
    pub heartbeat_interval: u64,
    /// Milliseconds
    pub metrics_interval: u64,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAckPayload {
    pub status: ReplyStatus,
    pub node_id: String,
    pub registered_at: DateTime<Utc>,
    pub controller_info: ControllerInfo,
    #[serde(default)]
    pub pending_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStatusSummary {
    pub device_id: String,
    pub utilization: f64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub status: NodeStatus,
    pub uptime_seconds: u64,
    #[serde(default)]
    pub active_deployments: u32,
    /// Percent
    pub cpu_usage: f64,
    /// Percent
    pub ram_usage: f64,
    #[serde(default)]
    pub gpu_status: Vec<GpuStatusSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CpuMetrics {
    pub usage: f64,
    pub cores: u32,
    pub load_average: [f64; 3],
}

/// Memory figures in MB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub cached: u64,
    pub usage: f64,
}

/// Disk figures in MB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiskMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub node_id: String,
    #[serde(default)]
    pub cpu: CpuMetrics,
    #[serde(default)]
    pub memory: MemoryMetrics,
    #[serde(default)]
    pub disk: DiskMetrics,
    #[serde(default)]
    pub network: NetworkMetrics,
    #[serde(default)]
    pub gpu_devices: Vec<GpuDevice>,
}

// ============================================================================
// Correlation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAckPayload {
    pub original_message_id: String,
    #[serde(default)]
    pub status: AckState,
    /// Seconds the worker expects the command to take
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    pub original_message_id: String,
    /// Id of the resource the command concerned
    #[serde(
        default,
        alias = "deploymentId",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_id: Option<String>,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl CommandResultPayload {
    pub fn success(original_message_id: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            original_message_id: original_message_id.into(),
            resource_id: None,
            status: ReplyStatus::Success,
            result,
            error: None,
            progress: Some(100),
        }
    }

    pub fn failure(original_message_id: impl Into<String>, error: ErrorDetails) -> Self {
        Self {
            original_message_id: original_message_id.into(),
            resource_id: None,
            status: ReplyStatus::Error,
            result: None,
            error: Some(error),
            progress: None,
        }
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }
}

/// Body of an `error` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Id of the message that caused the error, when it could be read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
    #[serde(flatten)]
    pub error: ErrorDetails,
}

// ============================================================================
// Deployment commands & events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentCreatePayload {
    pub model_id: String,
    pub model_path: String,
    pub container_name: String,
    pub container_image: String,
    pub container_port: u16,
    pub gpu_device_id: String,
    /// MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_limit: Option<u64>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStopPayload {
    #[serde(default)]
    pub force: bool,
    /// Graceful timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl DeploymentStopPayload {
    pub fn effective_timeout(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub message: String,
    pub severity: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatusPayload {
    pub deployment_id: String,
    pub node_id: String,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<DeploymentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_inferences: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_latency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<DeploymentEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeploymentStatusPayload {
    pub fn new(
        deployment_id: impl Into<String>,
        node_id: impl Into<String>,
        status: DeploymentStatus,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            node_id: node_id.into(),
            status,
            previous_status: None,
            container_id: None,
            container_name: None,
            endpoint: None,
            gpu_device_id: None,
            gpu_memory_used: None,
            cpu_cores: None,
            total_inferences: None,
            average_latency: None,
            uptime_seconds: None,
            last_health_check: None,
            health_status: None,
            events: vec![],
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentLogsPayload {
    pub deployment_id: String,
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub more_available: bool,
}

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Huggingface,
    Minio,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDownloadPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub source: ModelSource,
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRefPayload {
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDownloadProgressPayload {
    pub model_id: String,
    /// Percent
    pub progress: u8,
    pub bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

// ============================================================================
// Containers & system
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTargetPayload {
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthCheckPayload {
    #[serde(default)]
    pub include_metrics: bool,
    #[serde(default)]
    pub include_deployments: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

// ============================================================================
// Sum type
// ============================================================================

macro_rules! payloads {
    ($( $kind:ident($ty:ty), )*) => {
        /// Typed `data` of a message, keyed by its kind
        #[derive(Debug, Clone, PartialEq)]
        pub enum Payload {
            $( $kind($ty), )*
            /// Reserved kinds without a concrete schema
            Extension(MessageType, Value),
        }

        impl Payload {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $( Payload::$kind(_) => MessageType::$kind, )*
                    Payload::Extension(kind, _) => *kind,
                }
            }

            /// Decode `data` with the schema registered for `kind`
            pub fn decode(kind: MessageType, data: Value) -> Result<Self, serde_json::Error> {
                let data = if data.is_null() {
                    Value::Object(Default::default())
                } else {
                    data
                };
                match kind {
                    $( MessageType::$kind => serde_json::from_value(data).map(Payload::$kind), )*
                    other => Ok(Payload::Extension(other, data)),
                }
            }

            pub fn to_value(&self) -> Result<Value, serde_json::Error> {
                match self {
                    $( Payload::$kind(p) => serde_json::to_value(p), )*
                    Payload::Extension(_, v) => Ok(v.clone()),
                }
            }
        }
    };
}

payloads! {
    ConnectionAck(ConnectionAckPayload),
    NodeRegister(NodeRegisterPayload),
    RegisterAck(RegisterAckPayload),
    DeploymentCreate(DeploymentCreatePayload),
    DeploymentStop(DeploymentStopPayload),
    DeploymentRestart(EmptyPayload),
    DeploymentUpdate(DeploymentUpdatePayload),
    DeploymentDelete(DeploymentStopPayload),
    DeploymentQuery(EmptyPayload),
    DeploymentStatus(DeploymentStatusPayload),
    DeploymentLogs(DeploymentLogsPayload),
    ModelDownload(ModelDownloadPayload),
    ModelCache(ModelRefPayload),
    ModelDelete(ModelRefPayload),
    ModelList(EmptyPayload),
    ModelDownloadProgress(ModelDownloadProgressPayload),
    ContainerList(EmptyPayload),
    ContainerInspect(ContainerTargetPayload),
    ContainerLogs(ContainerTargetPayload),
    ContainerStats(ContainerTargetPayload),
    SystemHealthCheck(SystemHealthCheckPayload),
    SystemRestart(EmptyPayload),
    SystemUpdate(SystemUpdatePayload),
    SystemQuery(EmptyPayload),
    TelemetryHeartbeat(HeartbeatPayload),
    TelemetryMetrics(MetricsPayload),
    CommandAck(CommandAckPayload),
    CommandResult(CommandResultPayload),
    Error(ErrorPayload),
}

impl Payload {
    /// Range and presence checks beyond what the schema enforces
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Payload::DeploymentCreate(p) => p.validate(),
            Payload::DeploymentStop(p) | Payload::DeploymentDelete(p) => p.validate(),
            Payload::TelemetryHeartbeat(p) => p.validate(),
            Payload::CommandResult(p) => p.validate(),
            Payload::ModelDownload(p) => p.validate(),
            Payload::NodeRegister(p) => require("nodeId", &p.node_id),
            Payload::CommandAck(p) => p.validate(),
            Payload::DeploymentStatus(p) => require("deploymentId", &p.deployment_id),
            Payload::DeploymentLogs(p) => require("deploymentId", &p.deployment_id),
            Payload::ModelDownloadProgress(p) => {
                if p.progress > 100 {
                    return Err("progress must be between 0 and 100".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} must not be empty", field));
    }
    Ok(())
}

fn percent(field: &str, value: f64) -> Result<(), String> {
    if !(0.0..=100.0).contains(&value) {
        return Err(format!("{} must be between 0 and 100", field));
    }
    Ok(())
}

impl DeploymentCreatePayload {
    pub fn validate(&self) -> Result<(), String> {
        require("modelId", &self.model_id)?;
        require("modelPath", &self.model_path)?;
        require("containerName", &self.container_name)?;
        require("containerImage", &self.container_image)?;
        require("gpuDeviceId", &self.gpu_device_id)?;

        if self.container_port < MIN_CONTAINER_PORT {
            return Err(format!(
                "containerPort must be between {} and 65535",
                MIN_CONTAINER_PORT
            ));
        }
        if let Some(limit) = self.gpu_memory_limit {
            if limit < MIN_GPU_MEMORY_LIMIT_MB {
                return Err(format!(
                    "gpuMemoryLimit must be at least {} MB",
                    MIN_GPU_MEMORY_LIMIT_MB
                ));
            }
        }
        if let Some(interval) = self.health_check_interval {
            if interval < MIN_HEALTH_CHECK_INTERVAL_SECS {
                return Err(format!(
                    "healthCheckInterval must be at least {} seconds",
                    MIN_HEALTH_CHECK_INTERVAL_SECS
                ));
            }
        }
        Ok(())
    }
}

impl DeploymentStopPayload {
    pub fn validate(&self) -> Result<(), String> {
        match self.timeout {
            Some(t) if !STOP_TIMEOUT_RANGE.contains(&t) => Err(format!(
                "timeout must be between {} and {} seconds",
                STOP_TIMEOUT_RANGE.start(),
                STOP_TIMEOUT_RANGE.end()
            )),
            _ => Ok(()),
        }
    }
}

impl HeartbeatPayload {
    pub fn validate(&self) -> Result<(), String> {
        percent("cpuUsage", self.cpu_usage)?;
        percent("ramUsage", self.ram_usage)
    }
}

impl CommandAckPayload {
    pub fn validate(&self) -> Result<(), String> {
        require("originalMessageId", &self.original_message_id)?;
        if matches!(self.estimated_duration, Some(secs) if secs > MAX_ESTIMATED_DURATION_SECS) {
            return Err(format!(
                "estimatedDuration must be at most {} seconds",
                MAX_ESTIMATED_DURATION_SECS
            ));
        }
        Ok(())
    }
}

impl CommandResultPayload {
    pub fn validate(&self) -> Result<(), String> {
        require("originalMessageId", &self.original_message_id)?;
        if matches!(self.progress, Some(p) if p > 100) {
            return Err("progress must be between 0 and 100".to_string());
        }
        if self.status == ReplyStatus::Error && self.error.is_none() {
            return Err("error is required when status is error".to_string());
        }
        Ok(())
    }
}

impl ModelDownloadPayload {
    pub fn validate(&self) -> Result<(), String> {
        require("sourcePath", &self.source_path)?;
        require("targetPath", &self.target_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::errors::ErrorCode;
    use serde_json::json;

    fn create_payload() -> DeploymentCreatePayload {
        serde_json::from_value(json!({
            "modelId": "llama-3-8b",
            "modelPath": "/models/llama-3-8b",
            "containerName": "llama-d1",
            "containerImage": "vllm/vllm-openai:latest",
            "containerPort": 8000,
            "gpuDeviceId": "0",
            "gpuMemoryLimit": 16384,
            "environment": {"HF_HOME": "/cache"}
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_by_kind() {
        let payload = Payload::decode(
            MessageType::CommandAck,
            json!({"originalMessageId": "m-1", "status": "acknowledged", "estimatedDuration": 60}),
        )
        .unwrap();

        match payload {
            Payload::CommandAck(ack) => {
                assert_eq!(ack.original_message_id, "m-1");
                assert_eq!(ack.estimated_duration, Some(60));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_null_data_for_empty_kinds() {
        let payload = Payload::decode(MessageType::ModelList, Value::Null).unwrap();
        assert_eq!(payload, Payload::ModelList(EmptyPayload {}));
        assert_eq!(payload.message_type(), MessageType::ModelList);
    }

    #[test]
    fn test_reserved_kinds_are_opaque() {
        let payload = Payload::decode(MessageType::JobStart, json!({"jobId": "j-1"})).unwrap();
        assert_eq!(payload.message_type(), MessageType::JobStart);
        assert_eq!(payload.to_value().unwrap()["jobId"], "j-1");
    }

    #[test]
    fn test_create_validation() {
        assert!(create_payload().validate().is_ok());

        let mut low_port = create_payload();
        low_port.container_port = 80;
        assert!(low_port.validate().is_err());

        let mut small_limit = create_payload();
        small_limit.gpu_memory_limit = Some(512);
        assert!(small_limit.validate().is_err());

        let mut fast_health = create_payload();
        fast_health.health_check_interval = Some(1);
        assert!(fast_health.validate().is_err());

        let mut no_image = create_payload();
        no_image.container_image = " ".to_string();
        assert!(no_image.validate().is_err());
    }

    #[test]
    fn test_stop_timeout_bounds() {
        let ok = DeploymentStopPayload {
            force: false,
            timeout: Some(300),
        };
        assert!(ok.validate().is_ok());
        assert_eq!(DeploymentStopPayload::default().effective_timeout(), 30);

        let too_long = DeploymentStopPayload {
            force: false,
            timeout: Some(301),
        };
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_ack_duration_bound() {
        let ack = Payload::decode(
            MessageType::CommandAck,
            json!({"originalMessageId": "m-1", "estimatedDuration": 86_400}),
        )
        .unwrap();
        assert!(ack.validate().is_ok());

        let huge = Payload::decode(
            MessageType::CommandAck,
            json!({"originalMessageId": "m-1", "estimatedDuration": 10_000_000_000_000_000u64}),
        )
        .unwrap();
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_result_requires_error_on_failure() {
        let mut result = CommandResultPayload::success("m-1", None);
        assert!(result.validate().is_ok());

        result.status = ReplyStatus::Error;
        assert!(result.validate().is_err());

        let failed = CommandResultPayload::failure(
            "m-1",
            ErrorDetails::from_code(ErrorCode::GpuUnavailable),
        );
        assert!(Payload::CommandResult(failed).validate().is_ok());
    }

    #[test]
    fn test_result_accepts_deployment_id_alias() {
        let result: CommandResultPayload = serde_json::from_value(json!({
            "originalMessageId": "m-1",
            "deploymentId": "d-1",
            "status": "success"
        }))
        .unwrap();
        assert_eq!(result.resource_id.as_deref(), Some("d-1"));
    }

    #[test]
    fn test_heartbeat_percent_bounds() {
        let heartbeat = HeartbeatPayload {
            node_id: "n1".to_string(),
            status: NodeStatus::Healthy,
            uptime_seconds: 10,
            active_deployments: 0,
            cpu_usage: 120.0,
            ram_usage: 10.0,
            gpu_status: vec![],
        };
        assert!(heartbeat.validate().is_err());
    }

    #[test]
    fn test_error_payload_flattens() {
        let payload = ErrorPayload {
            original_message_id: Some("m-9".to_string()),
            error: ErrorDetails::from_code(ErrorCode::CommandInvalid),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["originalMessageId"], "m-9");
        assert_eq!(value["code"], "2001");
        assert_eq!(value["retryable"], false);

        let back: ErrorPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}
