use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::auth::CallerIdentity;
use crate::cluster::dispatcher::DispatcherConfig;
use crate::worker::retry::RetryPolicy;

/// Default controller port
pub const DEFAULT_CONTROLLER_PORT: u16 = 8181;

/// WebSocket path workers connect to
pub const NODE_SOCKET_PATH: &str = "/ws/node";

/// Default config directory: ~/.nodelink
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nodelink")
}

pub fn default_controller_config_path() -> PathBuf {
    default_config_dir().join("controller.yaml")
}

pub fn default_worker_config_path() -> PathBuf {
    default_config_dir().join("worker.yaml")
}

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to expand '{0}': {1}")]
    ExpandError(String, String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// ============================================================================
// Controller
// ============================================================================

/// A worker credential, stored as a digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCredential {
    pub node_id: String,
    /// Lowercase hex SHA-256 of the node's bearer token
    pub token_sha256: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A REST API key and the identity it resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyConfig {
    pub key_sha256: String,
    pub identity: CallerIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_addr: String,

    #[serde(default = "default_controller_port")]
    pub port: u16,

    #[serde(default = "default_controller_id")]
    pub controller_id: String,

    /// Sent to workers in `register.ack`
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Sent to workers in `register.ack`
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Heartbeats a node may miss before it is marked offline
    #[serde(default = "default_missed_beat_threshold")]
    pub missed_beat_threshold: u32,

    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    #[serde(default = "default_result_timeout_secs")]
    pub default_result_timeout_secs: u64,

    #[serde(default = "default_retention_secs")]
    pub command_retention_secs: u64,

    #[serde(default = "default_command_sweep_interval_ms")]
    pub command_sweep_interval_ms: u64,

    #[serde(default = "default_node_sweep_interval_ms")]
    pub node_sweep_interval_ms: u64,

    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Where Node/Deployment records are mirrored as JSON; off if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_dir: Option<PathBuf>,

    #[serde(default)]
    pub nodes: Vec<NodeCredential>,

    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_address(),
            port: DEFAULT_CONTROLLER_PORT,
            controller_id: default_controller_id(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            metrics_interval_ms: default_metrics_interval_ms(),
            missed_beat_threshold: default_missed_beat_threshold(),
            ack_timeout_secs: default_ack_timeout_secs(),
            default_result_timeout_secs: default_result_timeout_secs(),
            command_retention_secs: default_retention_secs(),
            command_sweep_interval_ms: default_command_sweep_interval_ms(),
            node_sweep_interval_ms: default_node_sweep_interval_ms(),
            log_buffer_lines: default_log_buffer_lines(),
            timezone: default_timezone(),
            mirror_dir: None,
            nodes: vec![],
            api_keys: vec![],
        }
    }
}

impl ControllerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Silence after which a node counts as stale
    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(
            (self.heartbeat_interval_ms * self.missed_beat_threshold as u64) as i64,
        )
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            ack_timeout: chrono::Duration::seconds(self.ack_timeout_secs as i64),
            default_result_timeout: chrono::Duration::seconds(
                self.default_result_timeout_secs as i64,
            ),
            retention: chrono::Duration::seconds(self.command_retention_secs as i64),
        }
    }

    pub fn command_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.command_sweep_interval_ms)
    }

    pub fn node_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.node_sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("metricsIntervalMs", self.metrics_interval_ms),
            ("ackTimeoutSecs", self.ack_timeout_secs),
            ("defaultResultTimeoutSecs", self.default_result_timeout_secs),
            ("commandSweepIntervalMs", self.command_sweep_interval_ms),
            ("nodeSweepIntervalMs", self.node_sweep_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.missed_beat_threshold < 1 {
            return Err(ConfigError::Invalid(
                "missedBeatThreshold must be at least 1".to_string(),
            ));
        }
        if self.log_buffer_lines == 0 {
            return Err(ConfigError::Invalid(
                "logBufferLines must be positive".to_string(),
            ));
        }
        for node in &self.nodes {
            if node.node_id.trim().is_empty() {
                return Err(ConfigError::Invalid("node credential without nodeId".to_string()));
            }
            if node.token_sha256.len() != 64
                || !node.token_sha256.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(ConfigError::Invalid(format!(
                    "tokenSha256 for node '{}' is not a SHA-256 hex digest",
                    node.node_id
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default = "default_docker_binary")]
    pub binary: String,
    /// Network deployment containers join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Appended to every `docker run`
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
            network: None,
            extra_args: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// e.g. `ws://controller:8181/ws/node`
    #[serde(default = "default_controller_url")]
    pub controller_url: String,

    #[serde(default)]
    pub node_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Bearer token presented during the handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Service that echoes the caller's public IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            controller_url: default_controller_url(),
            node_id: String::new(),
            node_name: None,
            token: None,
            retry: RetryConfig::default(),
            docker: DockerConfig::default(),
            model_dir: default_model_dir(),
            public_ip_url: None,
        }
    }
}

impl WorkerConfig {
    /// Apply command-line / environment overrides
    pub fn with_overrides(
        mut self,
        controller_url: Option<String>,
        node_id: Option<String>,
        token: Option<String>,
    ) -> Self {
        if let Some(url) = controller_url {
            self.controller_url = url;
        }
        if let Some(id) = node_id {
            self.node_id = id;
        }
        if token.is_some() {
            self.token = token;
        }
        self
    }

    pub fn display_name(&self) -> &str {
        self.node_name.as_deref().unwrap_or(&self.node_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("nodeId must not be empty".to_string()));
        }
        if !(self.controller_url.starts_with("ws://") || self.controller_url.starts_with("wss://"))
        {
            return Err(ConfigError::Invalid(format!(
                "controllerUrl must be a ws:// or wss:// URL, got '{}'",
                self.controller_url
            )));
        }
        let retry = &self.retry;
        if retry.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("retry.baseDelayMs must be positive".to_string()));
        }
        if retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be at least 1".to_string()));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.maxDelayMs must not be below retry.baseDelayMs".to_string(),
            ));
        }
        Ok(())
    }

    /// Expand `~` and `${VAR}` in string settings
    fn expand(mut self) -> Result<Self, ConfigError> {
        self.controller_url = expand(&self.controller_url)?;
        self.token = self.token.as_deref().map(expand).transpose()?;
        self.model_dir = PathBuf::from(expand(&self.model_dir.to_string_lossy())?);
        Ok(self)
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_controller_port() -> u16 {
    DEFAULT_CONTROLLER_PORT
}

fn default_controller_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| format!("controller-{}", h))
        .unwrap_or_else(|| "controller".to_string())
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_metrics_interval_ms() -> u64 {
    60_000
}

fn default_missed_beat_threshold() -> u32 {
    3
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_result_timeout_secs() -> u64 {
    300
}

fn default_retention_secs() -> u64 {
    300
}

fn default_command_sweep_interval_ms() -> u64 {
    1_000
}

fn default_node_sweep_interval_ms() -> u64 {
    5_000
}

fn default_log_buffer_lines() -> usize {
    1_000
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_controller_url() -> String {
    format!("ws://127.0.0.1:{}{}", DEFAULT_CONTROLLER_PORT, NODE_SOCKET_PATH)
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_model_dir() -> PathBuf {
    default_config_dir().join("models")
}

// ============================================================================
// SBIO: Pure parsing (no I/O)
// ============================================================================

fn expand(value: &str) -> Result<String, ConfigError> {
    shellexpand::full(value)
        .map(|v| v.into_owned())
        .map_err(|e| ConfigError::ExpandError(value.to_string(), e.to_string()))
}

pub fn parse_controller_config(content: &str) -> Result<ControllerConfig, ConfigError> {
    let mut config: ControllerConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.mirror_dir = config
        .mirror_dir
        .map(|p| expand(&p.to_string_lossy()).map(PathBuf::from))
        .transpose()?;
    config.validate()?;
    Ok(config)
}

/// Parse a worker config; validation runs after overrides are applied
pub fn parse_worker_config(content: &str) -> Result<WorkerConfig, ConfigError> {
    let config: WorkerConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.expand()
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load from `path`, or the default location (defaults if that is absent)
pub fn load_controller_config(path: Option<&Path>) -> Result<ControllerConfig, ConfigError> {
    match read_optional(path, &default_controller_config_path())? {
        Some(content) => parse_controller_config(&content),
        None => Ok(ControllerConfig::default()),
    }
}

pub fn load_worker_config(path: Option<&Path>) -> Result<WorkerConfig, ConfigError> {
    match read_optional(path, &default_worker_config_path())? {
        Some(content) => parse_worker_config(&content),
        None => WorkerConfig::default().expand(),
    }
}

/// An explicit path must exist; the default one may be missing
fn read_optional(explicit: Option<&Path>, default: &Path) -> Result<Option<String>, ConfigError> {
    match explicit {
        Some(path) if !path.exists() => Err(ConfigError::ConfigNotFound(path.to_path_buf())),
        Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
        None if default.exists() => Ok(Some(std::fs::read_to_string(default)?)),
        None => Ok(None),
    }
}
