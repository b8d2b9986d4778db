mod cli;
mod handlers;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use lecture_dl::config::ConfigManager;
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Validate CLI arguments first
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    init_logging(args.verbose);

    let config_manager = match &args.config {
        Some(path) => ConfigManager::from_path(path.clone())?,
        None => ConfigManager::new()?,
    };

    if !args.skips_config_validation() {
        if let Err(e) = config_manager.validate() {
            eprintln!("Configuration validation failed: {}", e);
            eprintln!("Run 'lecture-dl config validate' for details");
            process::exit(1);
        }
    }

    match args.command {
        Commands::Download {
            manifest,
            output_dir,
            temp_dir,
            max_parallel,
            json,
        } => {
            handlers::handle_download(
                &config_manager,
                manifest,
                output_dir,
                temp_dir,
                max_parallel,
                json,
            )
            .await?;
        }
        Commands::Clean { dry_run, yes } => {
            handlers::handle_clean(&config_manager, dry_run, yes).await?;
        }
        Commands::Config { action } => {
            handlers::handle_config(&config_manager, action).await?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
