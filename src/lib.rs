//! nodelink: controller/worker orchestration for GPU inference nodes
//!
//! Workers hold a persistent WebSocket to the controller, register their
//! hardware, stream telemetry and run deployment commands. See
//! [`protocol`] for the wire format.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod worker;
