//! Command-line interface
//!
//! - `nodelink controller` - Run the controller (REST API and worker socket)
//! - `nodelink worker` - Run a worker that dials a controller

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;

pub use commands::*;

#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(about = "Controller/worker orchestration for GPU inference nodes")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Path to the YAML config (default: ~/.nodelink/<role>.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller
    Controller(ControllerArgs),

    /// Run a worker node
    Worker(WorkerArgs),
}

/// Arguments for the controller command
#[derive(Parser, Debug)]
pub struct ControllerArgs {
    /// Override the bind address
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the listen port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Mirror node and deployment records into this directory
    #[arg(long, value_name = "DIR")]
    pub mirror_dir: Option<PathBuf>,
}

/// Arguments for the worker command
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Controller socket URL, e.g. ws://controller:8181/ws/node
    #[arg(long, env = "NODELINK_CONTROLLER_URL")]
    pub controller_url: Option<String>,

    /// Node id to register as
    #[arg(long, env = "NODELINK_NODE_ID")]
    pub node_id: Option<String>,

    /// Bearer token presented during the handshake
    #[arg(long, env = "NODELINK_NODE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Host advertised in deployment endpoints
    #[arg(long, value_name = "HOST")]
    pub advertise_host: Option<String>,

    /// Run deployments in memory instead of docker
    #[arg(long)]
    pub simulate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controller() {
        let cli = Cli::parse_from(["nodelink", "controller", "--port", "9000"]);
        match cli.command {
            Commands::Controller(args) => {
                assert_eq!(args.port, Some(9000));
                assert!(args.bind_addr.is_none());
            }
            _ => panic!("Expected Controller command"),
        }
    }

    #[test]
    fn test_parse_worker() {
        let cli = Cli::parse_from([
            "nodelink",
            "worker",
            "--controller-url",
            "ws://10.0.0.1:8181/ws/node",
            "--node-id",
            "gpu-node-1",
            "--simulate",
        ]);
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(
                    args.controller_url.as_deref(),
                    Some("ws://10.0.0.1:8181/ws/node")
                );
                assert_eq!(args.node_id.as_deref(), Some("gpu-node-1"));
                assert!(args.simulate);
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["nodelink", "-vv", "worker", "--config", "/etc/worker.yaml"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/worker.yaml")));
    }
}
