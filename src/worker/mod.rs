//! # Worker node
//!
//! Dials the controller, registers its hardware, streams telemetry and
//! executes deployment, model and container commands against a
//! [`CommandExecutor`]. [`DockerExecutor`] drives the local docker CLI;
//! [`SimulatedExecutor`] keeps everything in memory.

pub mod client;
pub mod docker;
pub mod executor;
pub mod handler;
pub mod retry;
pub mod telemetry;

pub use client::{WorkerClient, WorkerError};
pub use docker::DockerExecutor;
pub use executor::{CommandExecutor, DeploymentContainer, ExecutorError, SimulatedExecutor};
pub use handler::CommandHandler;
pub use retry::{Backoff, RetryPolicy};
pub use telemetry::{TelemetryIntervals, TelemetryProducer};
