//! Closed enumerations shared by controller and worker
//!
//! Message kinds follow a `{resource}.{action}` naming scheme:
//! - Commands (controller → worker) use action verbs (`create`, `stop`, ...)
//! - Events (worker → controller) use state nouns (`status`, `logs`, ...)
//! - Meta-messages (`command.ack`, `command.result`, `telemetry.*`, handshake,
//!   `error`) travel in either direction

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which way a message kind is allowed to travel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Controller → worker imperative
    Command,
    /// Worker → controller state report
    Event,
    /// Handshake, telemetry, ack/result and error traffic
    Meta,
}

/// Which side of the channel sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Controller,
    Worker,
}

macro_rules! message_types {
    ($( $variant:ident => $wire:literal, $dir:ident; )*) => {
        /// Every message kind understood on the wire
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum MessageType {
            $(
                #[serde(rename = $wire)]
                $variant,
            )*
        }

        impl MessageType {
            /// All registered kinds, in declaration order
            pub const ALL: &'static [MessageType] = &[$(MessageType::$variant,)*];

            /// Wire name of this kind
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(MessageType::$variant => $wire,)*
                }
            }

            /// Direction class of this kind
            pub fn direction(&self) -> Direction {
                match self {
                    $(MessageType::$variant => Direction::$dir,)*
                }
            }
        }

        impl FromStr for MessageType {
            type Err = UnknownMessageType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(MessageType::$variant),)*
                    other => Err(UnknownMessageType(other.to_string())),
                }
            }
        }
    };
}

message_types! {
    // Connection & registration
    ConnectionAck => "connection.ack", Meta;
    NodeRegister => "node.register", Meta;
    RegisterAck => "register.ack", Meta;

    // Deployment commands
    DeploymentCreate => "deployment.create", Command;
    DeploymentStop => "deployment.stop", Command;
    DeploymentRestart => "deployment.restart", Command;
    DeploymentUpdate => "deployment.update", Command;
    DeploymentDelete => "deployment.delete", Command;
    DeploymentQuery => "deployment.query", Command;

    // Deployment events
    DeploymentStatus => "deployment.status", Event;
    DeploymentLogs => "deployment.logs", Event;

    // Model commands
    ModelDownload => "model.download", Command;
    ModelCache => "model.cache", Command;
    ModelDelete => "model.delete", Command;
    ModelList => "model.list", Command;

    // Model events
    ModelDownloadProgress => "model.downloadProgress", Event;

    // Job commands and events (reserved)
    JobStart => "job.start", Command;
    JobStop => "job.stop", Command;
    JobCancel => "job.cancel", Command;
    JobQuery => "job.query", Command;
    JobStatus => "job.status", Event;

    // Agent commands and events (reserved)
    AgentStart => "agent.start", Command;
    AgentStop => "agent.stop", Command;
    AgentExecute => "agent.execute", Command;
    AgentQuery => "agent.query", Command;
    AgentMessage => "agent.message", Event;

    // Container commands
    ContainerList => "container.list", Command;
    ContainerInspect => "container.inspect", Command;
    ContainerLogs => "container.logs", Command;
    ContainerStats => "container.stats", Command;

    // System commands
    SystemHealthCheck => "system.healthCheck", Command;
    SystemRestart => "system.restart", Command;
    SystemUpdate => "system.update", Command;
    SystemQuery => "system.query", Command;

    // Telemetry
    TelemetryHeartbeat => "telemetry.heartbeat", Meta;
    TelemetryMetrics => "telemetry.metrics", Meta;

    // Correlation
    CommandAck => "command.ack", Meta;
    CommandResult => "command.result", Meta;

    Error => "error", Meta;
}

impl MessageType {
    /// Whether this kind expects a `command.ack` and `command.result`
    pub fn is_command(&self) -> bool {
        self.direction() == Direction::Command
    }

    /// Whether `sender` is allowed to emit this kind
    pub fn allowed_from(&self, sender: Peer) -> bool {
        use MessageType::*;
        match (self.direction(), sender) {
            (Direction::Command, Peer::Controller) => true,
            (Direction::Command, Peer::Worker) => false,
            (Direction::Event, Peer::Worker) => true,
            (Direction::Event, Peer::Controller) => false,
            (Direction::Meta, Peer::Controller) => {
                matches!(self, ConnectionAck | RegisterAck | Error)
            }
            (Direction::Meta, Peer::Worker) => !matches!(self, ConnectionAck | RegisterAck),
        }
    }

    /// Reserved kinds that are recognized but have no worker implementation yet
    pub fn is_reserved(&self) -> bool {
        use MessageType::*;
        matches!(
            self,
            JobStart
                | JobStop
                | JobCancel
                | JobQuery
                | JobStatus
                | AgentStart
                | AgentStop
                | AgentExecute
                | AgentQuery
                | AgentMessage
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a `type` string is not in the registry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type '{0}'")]
pub struct UnknownMessageType(pub String);

/// Kind of resource a message concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Deployment,
    Model,
    Job,
    Agent,
    Container,
    System,
    Node,
}

/// `{type, id}` pair naming the resource a command targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub id: String,
}

impl ResourceRef {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            id: id.into(),
        }
    }

    pub fn deployment(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Deployment, id)
    }

    pub fn model(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Model, id)
    }

    pub fn system(node_id: impl Into<String>) -> Self {
        Self::new(ResourceType::System, node_id)
    }
}

/// Node connection, health and operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    // Connection states
    Online,
    Offline,
    #[default]
    Connecting,
    Disconnected,

    // Health states
    Healthy,
    Degraded,
    Error,

    // Operational labels
    Ready,
    Busy,
    ShuttingDown,
    Maintenance,
}

impl NodeStatus {
    /// Labels the worker reports about its workload; never enforced by the controller
    pub fn is_operational_label(&self) -> bool {
        matches!(
            self,
            NodeStatus::Ready | NodeStatus::Busy | NodeStatus::ShuttingDown | NodeStatus::Maintenance
        )
    }

    /// Health classifications a worker may report
    pub fn is_health(&self) -> bool {
        matches!(
            self,
            NodeStatus::Healthy | NodeStatus::Degraded | NodeStatus::Error
        )
    }

    /// Whether the controller currently considers the node reachable
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            NodeStatus::Offline | NodeStatus::Disconnected | NodeStatus::Connecting
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Connecting => "connecting",
            NodeStatus::Disconnected => "disconnected",
            NodeStatus::Healthy => "healthy",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Error => "error",
            NodeStatus::Ready => "ready",
            NodeStatus::Busy => "busy",
            NodeStatus::ShuttingDown => "shutting_down",
            NodeStatus::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// Lifecycle of an outstanding command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Not yet sent
    Pending,
    /// Sent to worker
    Sent,
    /// Worker received and is processing
    Acknowledged,
    Success,
    Error,
    Timeout,
    /// Cancelled locally by the controller
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Success
                | CommandStatus::Error
                | CommandStatus::Timeout
                | CommandStatus::Cancelled
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Success => "success",
            CommandStatus::Error => "error",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of an inference deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    #[default]
    Queued,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Restarting,
}

impl DeploymentStatus {
    /// The only legal successors of this state
    pub fn successors(&self) -> &'static [DeploymentStatus] {
        use DeploymentStatus::*;
        match self {
            Queued => &[Starting, Failed],
            Starting => &[Running, Failed],
            Running => &[Stopping, Restarting, Failed],
            Stopping => &[Stopped],
            Stopped => &[Starting],
            Failed => &[Starting],
            Restarting => &[Running, Failed],
        }
    }

    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        self.successors().contains(&next)
    }

    /// States from which an operator-initiated restart is legal
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Queued | DeploymentStatus::Stopped | DeploymentStatus::Failed
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopping => "stopping",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Scheduling hint carried in message metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Health classification of a running deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// Severity of a deployment log line or event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Container stream a log line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}
