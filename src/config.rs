//! Configuration management for the round miner
//!
//! Settings come from command line arguments, environment variables and an
//! optional configuration file (YAML or JSON). Values given on the command line
//! or in the environment win over the file; the file wins over defaults.

use crate::coordinator::CoordinatorConfig;
use crate::work_source::RpcConfig;
use crate::worker::DEFAULT_BATCH_SIZE;
use crate::{DeviceId, Error, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Largest accepted search step; cancellation is only observed between steps
pub const MAX_BATCH_SIZE: u64 = 4096;

/// Device engines supported by the miner
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// OpenCL GPUs running the search kernel
    Opencl,
    /// CPU simulation for testing
    Simulation,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Opencl => write!(f, "opencl"),
            EngineKind::Simulation => write!(f, "simulation"),
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive for this level
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
    Pretty,
}

/// Complete configuration for the miner
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "pow-race-miner",
    version = env!("CARGO_PKG_VERSION"),
    about = "Multi-device proof-of-work miner",
    long_about = "Fetches work from a JSON-RPC node, races every configured device on it and submits the first qualifying nonce"
)]
pub struct Config {
    /// Print program info and exit
    #[arg(long)]
    #[serde(skip)]
    pub info: bool,

    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// RPC node address (host:port)
    #[arg(short = 'n', long, default_value = "127.0.0.1:8334")]
    #[serde(default = "default_rpc_host")]
    pub rpc_host: String,

    /// RPC user name
    #[arg(short = 'u', long, env = "POW_MINER_RPC_USER")]
    pub rpc_user: Option<String>,

    /// RPC password
    #[arg(short = 'p', long, env = "POW_MINER_RPC_PASS", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub rpc_pass: Option<String>,

    /// Use TLS to connect to the node
    #[arg(short = 't', long)]
    #[serde(default)]
    pub tls: bool,

    /// Accept self-signed TLS certificates
    #[arg(short = 'x', long)]
    #[serde(default)]
    pub insecure: bool,

    /// HTTP timeout in milliseconds
    #[arg(long, default_value = "30000")]
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,

    /// Device indices to mine on, comma separated
    #[arg(short = 'd', long, value_delimiter = ',', default_value = "0")]
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceId>,

    /// Device engine
    #[arg(short = 'e', long, default_value = "opencl")]
    #[serde(default = "default_engine")]
    pub engine: EngineKind,

    /// OpenCL kernel source file
    #[arg(long, value_name = "FILE")]
    pub kernel_path: Option<PathBuf>,

    /// Verification table file
    #[arg(long, value_name = "FILE", default_value = "csatable.bin")]
    #[serde(default = "default_table_path")]
    pub table_path: PathBuf,

    /// Nonces per device search step
    #[arg(short = 'b', long, default_value = "64")]
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Delay after a failed work fetch in milliseconds
    #[arg(long, default_value = "1000")]
    #[serde(default = "default_fetch_retry_delay")]
    pub fetch_retry_delay: u64,

    /// Seconds between stale work checks during a round (0 disables)
    #[arg(long, default_value = "0")]
    #[serde(default)]
    pub stale_check_interval: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, default_value = "plain")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process arguments
    ///
    /// Exits with usage information on invalid arguments, like any clap parser.
    pub async fn load() -> Result<Self> {
        let matches = Self::command().get_matches();
        Self::from_matches(&matches).await
    }

    /// Load configuration from an explicit argument list
    pub async fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command()
            .try_get_matches_from(args)
            .map_err(|e| Error::config(e.to_string()))?;
        Self::from_matches(&matches).await
    }

    async fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config =
            Self::from_arg_matches(matches).map_err(|e| Error::config(e.to_string()))?;

        if let Some(config_file) = config.config_file.clone() {
            let file_config = Self::load_from_file(&config_file).await?;
            config = config.merge_with_file(file_config, matches);
        }

        if !config.info {
            config.validate()?;
        }
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Take file values for every setting not given explicitly
    fn merge_with_file(mut self, file: Self, matches: &ArgMatches) -> Self {
        let explicit = |id: &str| {
            matches!(
                matches.value_source(id),
                Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
            )
        };

        if !explicit("rpc_host") {
            self.rpc_host = file.rpc_host;
        }
        if !explicit("rpc_user") {
            self.rpc_user = file.rpc_user;
        }
        if !explicit("rpc_pass") {
            self.rpc_pass = file.rpc_pass;
        }
        if !explicit("tls") {
            self.tls = file.tls;
        }
        if !explicit("insecure") {
            self.insecure = file.insecure;
        }
        if !explicit("http_timeout") {
            self.http_timeout = file.http_timeout;
        }
        if !explicit("devices") {
            self.devices = file.devices;
        }
        if !explicit("engine") {
            self.engine = file.engine;
        }
        if !explicit("kernel_path") {
            self.kernel_path = file.kernel_path;
        }
        if !explicit("table_path") {
            self.table_path = file.table_path;
        }
        if !explicit("batch_size") {
            self.batch_size = file.batch_size;
        }
        if !explicit("fetch_retry_delay") {
            self.fetch_retry_delay = file.fetch_retry_delay;
        }
        if !explicit("stale_check_interval") {
            self.stale_check_interval = file.stale_check_interval;
        }
        if !explicit("log_level") {
            self.log_level = file.log_level;
        }
        if !explicit("log_format") {
            self.log_format = file.log_format;
        }
        if !explicit("log_file") {
            self.log_file = file.log_file;
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.rpc_url()?;

        if self.devices.is_empty() {
            return Err(Error::config("At least one device must be configured"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.devices.iter().find(|d| !seen.insert(**d)) {
            return Err(Error::config(format!("Device {} is listed more than once", dup)));
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::config(format!(
                "Batch size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }

        if self.http_timeout == 0 {
            return Err(Error::config("HTTP timeout must be greater than 0"));
        }

        if self.engine == EngineKind::Opencl && self.kernel_path.is_none() {
            return Err(Error::config("The OpenCL engine requires --kernel-path"));
        }

        if self.rpc_pass.is_some() && self.rpc_user.is_none() {
            return Err(Error::config("An RPC password was given without a user"));
        }

        Ok(())
    }

    /// Get the RPC endpoint URL
    pub fn rpc_url(&self) -> Result<Url> {
        let url = if self.rpc_host.contains("://") {
            self.rpc_host.clone()
        } else if self.tls {
            format!("https://{}", self.rpc_host)
        } else {
            format!("http://{}", self.rpc_host)
        };
        Url::parse(&url).map_err(|e| Error::config(format!("Invalid RPC address: {}", e)))
    }

    /// Get RPC connection settings
    pub fn rpc_config(&self) -> Result<RpcConfig> {
        Ok(RpcConfig {
            url: self.rpc_url()?,
            user: self.rpc_user.clone(),
            password: self.rpc_pass.clone(),
            timeout: self.http_timeout_duration(),
            insecure: self.insecure,
        })
    }

    /// Get coordinator settings
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            fetch_retry_delay: self.fetch_retry_delay_duration(),
            stale_check_interval: self.stale_check_interval_duration(),
        }
    }

    /// Get HTTP timeout duration
    pub fn http_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.http_timeout)
    }

    /// Get fetch retry delay duration
    pub fn fetch_retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay)
    }

    /// Get stale check interval, if enabled
    pub fn stale_check_interval_duration(&self) -> Option<Duration> {
        (self.stale_check_interval > 0).then(|| Duration::from_secs(self.stale_check_interval))
    }
}

// Default value functions for serde
fn default_rpc_host() -> String { "127.0.0.1:8334".to_string() }
fn default_http_timeout() -> u64 { 30000 }
fn default_devices() -> Vec<DeviceId> { vec![0] }
fn default_engine() -> EngineKind { EngineKind::Opencl }
fn default_table_path() -> PathBuf { PathBuf::from("csatable.bin") }
fn default_batch_size() -> u64 { DEFAULT_BATCH_SIZE }
fn default_fetch_retry_delay() -> u64 { 1000 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Plain }
