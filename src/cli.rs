use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lecture_dl::download::MAX_PARALLEL_LIMIT;

#[derive(Parser)]
#[command(name = "lecture-dl")]
#[command(about = "Download recorded lectures from HLS playlists")]
#[command(long_about = "
lecture-dl downloads recorded lectures (combined, presentation and camera streams)
from signed HLS playlists. Segments are fetched in parallel with retry, muxed into
a single file with ffmpeg and stored as <output>/<course>/<title>_<stream>.<ext>.

Examples:
  lecture-dl download selection.json             # Download everything in the manifest
  lecture-dl download selection.json -p 5 -o ~/Videos
  lecture-dl clean --dry-run                     # Show leftovers from interrupted runs
  lecture-dl config show
")]
#[command(version)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download the lectures listed in a manifest
    #[command(visible_alias = "dl")]
    Download {
        /// JSON manifest with the course name and selected lectures
        manifest: PathBuf,

        /// Output directory override
        #[arg(short, long, value_name = "DIR")]
        #[arg(help = "Store finished files under this directory")]
        output_dir: Option<PathBuf>,

        /// Temp directory override
        #[arg(short, long, value_name = "DIR")]
        #[arg(help = "Keep segments under this directory while downloading")]
        temp_dir: Option<PathBuf>,

        /// Maximum parallel downloads
        #[arg(short = 'p', long, value_name = "N")]
        #[arg(help = "Number of lectures downloaded at the same time")]
        max_parallel: Option<usize>,

        /// Print progress as JSON lines instead of progress bars
        #[arg(long)]
        json: bool,
    },

    /// Remove leftovers of interrupted runs
    #[command(visible_alias = "cleanup")]
    Clean {
        /// Show what would be removed without removing anything
        #[arg(short, long)]
        dry_run: bool,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage configuration
    #[command(visible_alias = "cfg")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Output format
        #[arg(short, long, value_enum, default_value = "toml")]
        format: ConfigFormat,
    },

    /// Validate configuration
    #[command(visible_alias = "check")]
    Validate,

    /// Create sample configuration next to the config file
    Sample,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum ConfigFormat {
    /// TOML format (default)
    Toml,
    /// JSON format
    Json,
}

impl std::fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigFormat::Toml => write!(f, "toml"),
            ConfigFormat::Json => write!(f, "json"),
        }
    }
}

impl Cli {
    /// Validate CLI arguments and show helpful error messages
    pub fn validate(&self) -> Result<(), String> {
        if let Commands::Download {
            max_parallel: Some(n),
            ..
        } = &self.command
        {
            if *n == 0 || *n > MAX_PARALLEL_LIMIT {
                return Err(format!(
                    "Max parallel downloads must be between 1 and {}",
                    MAX_PARALLEL_LIMIT
                ));
            }
        }
        Ok(())
    }

    /// Config problems are reported by the command itself instead of aborting startup
    pub fn skips_config_validation(&self) -> bool {
        matches!(
            self.command,
            Commands::Config {
                action: ConfigAction::Validate | ConfigAction::Show { .. }
            }
        )
    }
}
