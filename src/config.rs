//! Configuration management for the mining client
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON). Values given explicitly on the command
//! line win over the file; the file wins over built-in defaults.

use crate::types::Network;
use crate::worker::{CycleParams, NonceParams, Params};
use crate::{Error, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Compute backends the client can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum BackendType {
    /// Multi-threaded CPU nonce grinding
    Cpu,
    /// External cycle-finding solver command
    External,
}

impl BackendType {
    /// Backends this build can run
    pub const SUPPORTED: &'static [BackendType] = &[BackendType::Cpu, BackendType::External];
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(BackendType::Cpu),
            "external" => Ok(BackendType::External),
            other => Err(Error::unsupported_backend(other)),
        }
    }
}

impl TryFrom<String> for BackendType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Cpu => write!(f, "cpu"),
            BackendType::External => write!(f, "external"),
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

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
}

/// Complete configuration for the mining client
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "hs-mining-client",
    version = env!("CARGO_PKG_VERSION"),
    about = "Handshake Mining Client",
    long_about = "Polls a Handshake node for work and mines it with CPU or external solver backends"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Network the node is expected to serve
    #[arg(short = 'n', long, env = "HS_NETWORK", default_value = "main")]
    #[serde(default = "default_network")]
    pub network: Network,

    /// Mining backend (cpu, external)
    #[arg(short = 'b', long, default_value = "cpu", value_parser = BackendType::from_str)]
    #[serde(default = "default_backend")]
    pub backend: BackendType,

    /// Starting nonce for brute-force backends
    #[arg(long, default_value = "0")]
    #[serde(default)]
    pub nonce: u32,

    /// Nonces per worker per round (0 searches the whole nonce space)
    #[arg(short = 'r', long, default_value = "16777216")]
    #[serde(default = "default_range")]
    pub range: u32,

    /// GPU grid count passed to external solvers
    #[arg(long, default_value = "0")]
    #[serde(default)]
    pub grids: u32,

    /// GPU block count passed to external solvers
    #[arg(long, default_value = "0")]
    #[serde(default)]
    pub blocks: u32,

    /// Solver threads
    #[arg(short = 't', long, default_value = "0")]
    #[serde(default)]
    pub threads: u32,

    /// Trimming rounds for cycle-finding solvers
    #[arg(long, default_value = "0")]
    #[serde(default)]
    pub trims: u32,

    /// Mine on a single device instead of all of them
    #[arg(short = 'd', long)]
    #[serde(default)]
    pub device: Option<u32>,

    /// Number of devices (0 = one per CPU core for the cpu backend)
    #[arg(short = 'c', long, default_value = "0")]
    #[serde(default)]
    pub device_count: u32,

    /// External solver program
    #[arg(long)]
    #[serde(default)]
    pub external_command: Option<String>,

    /// Arguments for the external solver
    #[arg(long = "external-arg", value_name = "ARG", allow_hyphen_values = true)]
    #[serde(default)]
    pub external_args: Vec<String>,

    /// External solver timeout in seconds
    #[arg(long, default_value = "300")]
    #[serde(default = "default_external_timeout")]
    pub external_timeout: u64,

    /// Use TLS to connect to the node
    #[arg(long)]
    #[serde(default)]
    pub ssl: bool,

    /// Node RPC host
    #[arg(long, default_value = "localhost")]
    #[serde(default = "default_host")]
    pub host: String,

    /// Node RPC port (defaults to the network's RPC port)
    #[arg(short = 'p', long)]
    #[serde(default)]
    pub port: Option<u16>,

    /// RPC user
    #[arg(short = 'u', long, default_value = "hnsrpc")]
    #[serde(default = "default_user")]
    pub user: String,

    /// RPC password
    #[arg(short = 'k', long, env = "HS_RPC_PASS", default_value = "", hide_env_values = true)]
    #[serde(default)]
    pub pass: String,

    /// Poll interval (e.g. "3s", "500ms")
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    #[serde(default = "default_poll_interval", with = "duration_format")]
    pub poll_interval: Duration,

    /// HTTP timeout in milliseconds
    #[arg(long, default_value = "30000")]
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, default_value = "plain")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Also write logs to a daily-rolling file
    #[arg(long, value_name = "FILE")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Parse the command line, merge the config file and validate
    pub async fn load() -> Result<Self> {
        let matches = Self::command().get_matches();
        Self::from_matches(matches).await
    }

    /// Same as [`Config::load`] for an explicit argument list
    pub async fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::command()
            .try_get_matches_from(args)
            .map_err(|e| Error::config(e.to_string()))?;
        Self::from_matches(matches).await
    }

    async fn from_matches(matches: ArgMatches) -> Result<Self> {
        let mut config =
            Self::from_arg_matches(&matches).map_err(|e| Error::config(e.to_string()))?;

        if let Some(path) = config.config_file.clone() {
            let file_config = Self::load_from_file(&path).await?;
            config = config.merge_with_file(file_config, &matches);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Take file values for every option not given on the command line
    fn merge_with_file(self, file: Self, matches: &ArgMatches) -> Self {
        let cli = |id: &str| {
            matches!(
                matches.value_source(id),
                Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
            )
        };

        macro_rules! pick {
            ($field:ident) => {
                if cli(stringify!($field)) {
                    self.$field
                } else {
                    file.$field
                }
            };
        }

        Self {
            print_config: self.print_config,
            config_file: self.config_file,
            network: pick!(network),
            backend: pick!(backend),
            nonce: pick!(nonce),
            range: pick!(range),
            grids: pick!(grids),
            blocks: pick!(blocks),
            threads: pick!(threads),
            trims: pick!(trims),
            device: pick!(device),
            device_count: pick!(device_count),
            external_command: pick!(external_command),
            external_args: pick!(external_args),
            external_timeout: pick!(external_timeout),
            ssl: pick!(ssl),
            host: pick!(host),
            port: pick!(port),
            user: pick!(user),
            pass: pick!(pass),
            poll_interval: pick!(poll_interval),
            http_timeout: pick!(http_timeout),
            log_level: pick!(log_level),
            log_format: pick!(log_format),
            log_file: pick!(log_file),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.rpc_url())
            .map_err(|e| Error::config(format!("Invalid node URL: {}", e)))?;

        if self.poll_interval.is_zero() {
            return Err(Error::config("Poll interval must be greater than 0"));
        }

        if self.backend == BackendType::External {
            let missing = self
                .external_command
                .as_deref()
                .map(|c| c.trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(Error::config(
                    "The external backend requires --external-command",
                ));
            }
        }

        if let Some(device) = self.device {
            if self.device_count != 0 && device >= self.device_count {
                return Err(Error::config(format!(
                    "Device {} is out of range for {} devices",
                    device, self.device_count
                )));
            }
        }

        Ok(())
    }

    /// RPC port, defaulting to the network's
    pub fn rpc_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.network.default_rpc_port())
    }

    /// Node RPC URL
    pub fn rpc_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}/", scheme, self.host, self.rpc_port())
    }

    /// Backend search parameters
    pub fn params(&self) -> Params {
        match self.backend {
            BackendType::Cpu => Params::Nonce(NonceParams {
                nonce: self.nonce,
                range: self.range,
                grids: self.grids,
                blocks: self.blocks,
                threads: self.threads,
            }),
            BackendType::External => Params::Cycle(CycleParams {
                threads: self.threads,
                trims: self.trims,
            }),
        }
    }

    /// Get HTTP timeout duration
    pub fn http_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.http_timeout)
    }
}

/// Serde adapter for durations written like "3s"
mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// Default value functions for serde
fn default_network() -> Network { Network::Main }
fn default_backend() -> BackendType { BackendType::Cpu }
fn default_range() -> u32 { 16_777_216 }
fn default_external_timeout() -> u64 { 300 }
fn default_host() -> String { "localhost".to_string() }
fn default_user() -> String { "hnsrpc".to_string() }
fn default_poll_interval() -> Duration { Duration::from_secs(3) }
fn default_http_timeout() -> u64 { 30000 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Plain }
