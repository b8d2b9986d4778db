use anyhow::{Context, Result, bail};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::download::muxer::{INPUTS_PLACEHOLDER, LIST_PLACEHOLDER, OUTPUT_PLACEHOLDER};
use crate::download::{MAX_PARALLEL_LIMIT, MuxCommand, RetryPolicy, SchedulerOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub segments: SegmentsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub muxer: MuxerConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Defaults to `<Videos>/Lectures`.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Defaults to `<system temp>/lecture-dl`.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentsConfig {
    #[serde(default = "default_per_job_concurrency")]
    pub per_job_concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxerConfig {
    #[serde(default = "default_muxer_program")]
    pub program: String,
    /// `{list}`, `{inputs}` and `{output}` are expanded per job.
    #[serde(default = "default_muxer_args")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_orphan_scan")]
    pub orphan_scan: bool,
}

// Default value functions
fn default_max_parallel_downloads() -> usize {
    3
}
fn default_file_extension() -> String {
    "mp4".to_string()
}
fn default_per_job_concurrency() -> usize {
    8
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_throughput_window_secs() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_muxer_program() -> String {
    MuxCommand::ffmpeg().program
}
fn default_muxer_args() -> Vec<String> {
    MuxCommand::ffmpeg().args
}
fn default_grace_period_ms() -> u64 {
    1500
}
fn default_orphan_scan() -> bool {
    true
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            temp_dir: None,
            max_parallel_downloads: default_max_parallel_downloads(),
            file_extension: default_file_extension(),
        }
    }
}

impl Default for SegmentsConfig {
    fn default() -> Self {
        Self {
            per_job_concurrency: default_per_job_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            throughput_window_secs: default_throughput_window_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            program: default_muxer_program(),
            args: default_muxer_args(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            orphan_scan: default_orphan_scan(),
        }
    }
}

impl Config {
    pub fn output_dir(&self) -> PathBuf {
        if let Some(dir) = &self.general.output_dir {
            return dir.clone();
        }
        UserDirs::new()
            .and_then(|dirs| dirs.video_dir().map(|v| v.join("Lectures")))
            .unwrap_or_else(|| PathBuf::from("lectures"))
    }

    pub fn temp_root(&self) -> PathBuf {
        self.general
            .temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("lecture-dl"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn mux_command(&self) -> MuxCommand {
        MuxCommand::new(self.muxer.program.clone(), self.muxer.args.clone())
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            temp_root: self.temp_root(),
            file_extension: self.general.file_extension.clone(),
            segment_concurrency: self.segments.per_job_concurrency,
            request_timeout: Duration::from_secs(self.segments.request_timeout_secs),
            retry: self.retry_policy(),
            throughput_window: Duration::from_secs(self.segments.throughput_window_secs),
            muxer: self.mux_command(),
            grace_period: Duration::from_millis(self.cleanup.grace_period_ms),
            orphan_scan: self.cleanup.orphan_scan,
        }
    }
}

pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new ConfigManager and load existing config or create default
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("", "", "lecture-dl")
            .context("Failed to determine config directory")?;

        Self::from_path(project_dirs.config_dir().join("config.toml"))
    }

    /// Load (or create) the config at an explicit path
    pub fn from_path(config_file: PathBuf) -> Result<Self> {
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        }

        let config = if config_file.exists() {
            Self::load_config(&config_file)?
        } else {
            let default_config = Config::default();
            Self::save_config(&config_file, &default_config)?;
            default_config
        };

        Ok(Self {
            config_dir,
            config_file,
            config,
        })
    }

    /// Get a reference to the current config
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the current config
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current config to disk
    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_file, &self.config)
    }

    /// Reload config from disk
    pub fn reload(&mut self) -> Result<()> {
        self.config = Self::load_config(&self.config_file)?;
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    fn load_config(config_file: &Path) -> Result<Config> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_file))?;

        Ok(config)
    }

    fn save_config(config_file: &Path, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(config_file, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

        Ok(())
    }

    /// Create a sample config file for user reference
    pub fn create_sample_config(&self) -> Result<PathBuf> {
        let sample_file = self.config_dir.join("config.sample.toml");
        let mut sample_config = Config::default();
        sample_config.general.output_dir = Some(self.config.output_dir());
        sample_config.general.temp_dir = Some(self.config.temp_root());
        Self::save_config(&sample_file, &sample_config)?;
        Ok(sample_file)
    }

    /// Validate the current configuration
    pub fn validate(&self) -> Result<()> {
        let config = &self.config;

        let parallel = config.general.max_parallel_downloads;
        if !(1..=MAX_PARALLEL_LIMIT).contains(&parallel) {
            bail!(
                "max_parallel_downloads must be between 1 and {} (got {})",
                MAX_PARALLEL_LIMIT,
                parallel
            );
        }

        let extension = config.general.file_extension.trim();
        if extension.is_empty() || extension.contains(['.', '/', '\\']) {
            bail!("file_extension must be a bare extension like \"mp4\"");
        }

        if config.segments.per_job_concurrency == 0 {
            bail!("per_job_concurrency must be greater than 0");
        }

        if config.segments.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }

        if config.segments.throughput_window_secs == 0 {
            bail!("throughput_window_secs must be greater than 0");
        }

        if config.retry.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }

        if config.retry.base_delay_ms > config.retry.max_delay_ms {
            bail!("base_delay_ms must not exceed max_delay_ms");
        }

        if config.muxer.program.trim().is_empty() {
            bail!("muxer program cannot be empty");
        }

        let args = config.muxer.args.join(" ");
        if !args.contains(OUTPUT_PLACEHOLDER) {
            bail!("muxer args must contain {}", OUTPUT_PLACEHOLDER);
        }
        if !args.contains(LIST_PLACEHOLDER) && !args.contains(INPUTS_PLACEHOLDER) {
            bail!(
                "muxer args must contain {} or {}",
                LIST_PLACEHOLDER,
                INPUTS_PLACEHOLDER
            );
        }

        Ok(())
    }
}
