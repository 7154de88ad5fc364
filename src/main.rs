use std::process;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use nodelink::cli::{run_controller, run_worker, Cli, Commands};

#[tokio::main]
async fn main() {
    let mut cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(env_file) = cli.env_file.clone() {
        if let Err(e) = dotenvy::from_path(&env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
        // Env-backed flags are read at parse time
        cli = Cli::parse();
    }

    let config = cli.config.as_deref();
    let result = match &cli.command {
        Commands::Controller(args) => run_controller(config, args).await,
        Commands::Worker(args) => run_worker(config, args).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}
