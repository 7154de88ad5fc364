//! # Controller side of the node link
//!
//! The controller accepts one WebSocket session per worker, tracks node
//! liveness, dispatches commands and correlates their outcomes, and drives
//! every deployment through its lifecycle.
//!
//! ## Core Resources
//!
//! - **Node**: A worker machine hosting GPU inference containers
//! - **Deployment**: One inference workload pinned to one node
//! - **OutstandingCommand**: A command awaiting its ack and result
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    nodelink controller                       │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────┐  │
//! │  │ REST API   │  │ /ws/node   │  │ Dispatcher │  │Sweepers│  │
//! │  │ :8181      │  │ gateway    │  │            │  │        │  │
//! │  └────────────┘  └────────────┘  └────────────┘  └────────┘  │
//! │        Node registry · Deployment store · Mirror             │
//! └──────────────────────────────────────────────────────────────┘
//!                              │ WebSocket (JSON envelopes)
//!         ┌────────────────────┼────────────────────┐
//!         ▼                    ▼                    ▼
//!   ┌───────────┐        ┌───────────┐        ┌───────────┐
//!   │  worker   │        │  worker   │        │  worker   │
//!   │  (docker) │        │  (docker) │        │  (docker) │
//!   └───────────┘        └───────────┘        └───────────┘
//! ```

pub mod api;
pub mod auth;
pub mod controller;
pub mod deployment;
pub mod dispatcher;
pub mod gateway;
pub mod logs;
pub mod mirror;
pub mod node;
pub mod registry;
pub mod resources;
pub mod scope;
pub mod session;
pub mod sweeper;

pub use api::{create_control_plane_router, ControlPlaneState};
pub use auth::{Authenticator, CallerIdentity, NodeIdentity, StaticAuthenticator};
pub use controller::{ClusterController, ClusterStats, ControllerError, CreateDeploymentRequest};
pub use deployment::{Deployment, DeploymentStore, TransitionCause, TransitionError};
pub use dispatcher::{CommandDispatcher, DispatchError, DispatcherConfig, OutstandingCommand};
pub use mirror::{spawn_mirror, JsonFileSink, MirrorHandle, MirrorSink, NullSink};
pub use node::Node;
pub use registry::NodeRegistry;
pub use resources::{OperationStatus, ResourceList};
pub use session::{SessionManager, SessionState};
pub use sweeper::{spawn_sweepers, Sweepers};
