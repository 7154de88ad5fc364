//! Command implementations for the CLI
//!
//! SBIO pattern: config assembly is pure, the `run_*` functions own the I/O

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ControllerArgs, WorkerArgs};
use crate::cluster::{
    create_control_plane_router, spawn_mirror, spawn_sweepers, ClusterController,
    ControlPlaneState, JsonFileSink, MirrorHandle,
};
use crate::config::{
    load_controller_config, load_worker_config, ConfigError, ControllerConfig, WorkerConfig,
};
use crate::metrics::{gpu_devices, new_shared_collector};
use crate::worker::{CommandExecutor, DockerExecutor, SimulatedExecutor, WorkerClient, WorkerError};

const MIRROR_DRAIN: Duration = Duration::from_secs(5);

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Server(std::io::Error),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Config assembly (pure)
// ============================================================================

pub fn controller_config(
    mut config: ControllerConfig,
    args: &ControllerArgs,
) -> CommandResult<ControllerConfig> {
    if let Some(addr) = &args.bind_addr {
        config.bind_addr = addr.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &args.mirror_dir {
        config.mirror_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

pub fn worker_config(config: WorkerConfig, args: &WorkerArgs) -> CommandResult<WorkerConfig> {
    let config = config.with_overrides(
        args.controller_url.clone(),
        args.node_id.clone(),
        args.token.clone(),
    );
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Runners (I/O)
// ============================================================================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

pub async fn run_controller(config_path: Option<&Path>, args: &ControllerArgs) -> CommandResult<()> {
    let config = controller_config(load_controller_config(config_path)?, args)?;
    let addr = config.listen_addr();

    let (mirror, mirror_task) = match &config.mirror_dir {
        Some(dir) => {
            info!("Mirroring records to {}", dir.display());
            let (handle, task) = spawn_mirror(Arc::new(JsonFileSink::new(dir.clone())));
            (handle, Some(task))
        }
        None => (MirrorHandle::disabled(), None),
    };

    let controller = Arc::new(ClusterController::from_config(config, mirror));
    let sweepers = spawn_sweepers(Arc::clone(&controller));
    let app = create_control_plane_router(ControlPlaneState::new(Arc::clone(&controller)));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| CommandError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!("Controller {} listening on {}", controller.config().controller_id, addr);
    info!("Endpoints:");
    info!("  GET  /ws/node            - Worker socket");
    info!("  GET  /v1/status          - Cluster status");
    info!("  *    /v1/nodes           - Nodes");
    info!("  *    /v1/deployments     - Deployments");
    info!("  *    /v1/commands/{{id}}   - Outstanding commands");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown({
            let controller = Arc::clone(&controller);
            async move {
                shutdown_signal().await;
                controller.shutdown();
            }
        })
        .await;

    sweepers.shutdown().await;
    // The mirror drains once the last controller reference is gone
    drop(controller);
    if let Some(task) = mirror_task {
        if tokio::time::timeout(MIRROR_DRAIN, task).await.is_err() {
            warn!("Mirror did not drain within {}s", MIRROR_DRAIN.as_secs());
        }
    }
    served.map_err(CommandError::Server)
}

pub async fn run_worker(config_path: Option<&Path>, args: &WorkerArgs) -> CommandResult<()> {
    let config = worker_config(load_worker_config(config_path)?, args)?;

    let executor: Arc<dyn CommandExecutor> = if args.simulate {
        info!("Running with the simulated executor");
        Arc::new(SimulatedExecutor::single_gpu())
    } else {
        let gpus = gpu_devices();
        if gpus.is_empty() {
            warn!("No GPUs detected; deployments requesting a device will be refused");
        } else {
            info!("Detected {} GPU(s)", gpus.len());
        }
        let mut docker = DockerExecutor::new(config.docker.clone(), config.model_dir.clone(), gpus);
        if let Some(host) = &args.advertise_host {
            docker = docker.with_advertise_host(host.clone());
        }
        Arc::new(docker)
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let client = WorkerClient::new(config, executor, new_shared_collector());
    client.run(shutdown).await?;
    info!("Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_args() -> WorkerArgs {
        WorkerArgs {
            controller_url: Some("ws://10.0.0.1:8181/ws/node".to_string()),
            node_id: Some("gpu-node-1".to_string()),
            token: Some("secret".to_string()),
            advertise_host: None,
            simulate: true,
        }
    }

    #[test]
    fn test_controller_overrides() {
        let args = ControllerArgs {
            bind_addr: Some("127.0.0.1".to_string()),
            port: Some(9000),
            mirror_dir: None,
        };
        let config = controller_config(ControllerConfig::default(), &args).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_worker_overrides() {
        let config = worker_config(WorkerConfig::default(), &worker_args()).unwrap();
        assert_eq!(config.node_id, "gpu-node-1");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.controller_url, "ws://10.0.0.1:8181/ws/node");
    }

    #[test]
    fn test_worker_needs_node_id() {
        let mut args = worker_args();
        args.node_id = None;
        let err = worker_config(WorkerConfig::default(), &args).unwrap_err();
        assert!(matches!(err, CommandError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_worker_rejects_http_url() {
        let mut args = worker_args();
        args.controller_url = Some("http://10.0.0.1:8181".to_string());
        tokio_test::assert_err!(worker_config(WorkerConfig::default(), &args));
    }
}
