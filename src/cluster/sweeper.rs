//! Background sweeps for command deadlines and node staleness
//!
//! Two independent tasks run on their own intervals so a slow deployment
//! lock in the command sweep never delays offline detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::controller::ClusterController;

/// Handles to the running sweep tasks
pub struct Sweepers {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Sweepers {
    /// Signal both loops and wait for them to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Spawn the command-timeout and node-staleness loops
pub fn spawn_sweepers(controller: Arc<ClusterController>) -> Sweepers {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let command_interval = controller.config().command_sweep_interval();
    let node_interval = controller.config().node_sweep_interval();

    let commands = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(run_loop("command", command_interval, shutdown, move || {
            let controller = Arc::clone(&controller);
            async move {
                let expired = controller.sweep_commands(Utc::now()).await;
                if expired > 0 {
                    debug!("Command sweep expired {} commands", expired);
                }
            }
        }))
    };

    let nodes = tokio::spawn(run_loop("node", node_interval, shutdown_rx, move || {
        let controller = Arc::clone(&controller);
        async move {
            let stale = controller.sweep_nodes(Utc::now());
            if !stale.is_empty() {
                debug!("Node sweep marked {} offline", stale.len());
            }
        }
    }));

    Sweepers {
        shutdown: shutdown_tx,
        tasks: vec![commands, nodes],
    }
}

async fn run_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    info!("Starting {} sweeper: interval={}ms", name, interval.as_millis());

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => sweep().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("{} sweeper shutting down", name);
                    break;
                }
            }
        }
    }
}
