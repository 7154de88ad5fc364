//! # Controller ↔ worker wire protocol
//!
//! A persistent WebSocket carries JSON [`Message`]s in both directions.
//!
//! ```text
//!  worker                                   controller
//!    │ ── connect (Authorization: Bearer) ──▶ │
//!    │ ◀────────── connection.ack ─────────── │
//!    │ ─────────── node.register ───────────▶ │
//!    │ ◀─────────── register.ack ──────────── │  heartbeatInterval, metricsInterval
//!    │ ──── telemetry.heartbeat / metrics ──▶ │
//!    │ ◀──────── deployment.create ────────── │
//!    │ ─────────── command.ack ─────────────▶ │
//!    │ ───────── deployment.status ─────────▶ │
//!    │ ────────── command.result ───────────▶ │
//! ```

pub mod envelope;
pub mod errors;
pub mod payloads;
pub mod types;

pub use envelope::{DecodeError, Message, MessageMetadata};
pub use errors::{ErrorCategory, ErrorCode, ErrorDetails};
pub use payloads::*;
pub use types::*;

/// Version string reported in `connection.ack` and `node.register`
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
