//! Configuration module for the grow-a-load client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::workload::{Distribution, GeneratorError};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the load generator
#[derive(Parser, Debug)]
#[command(name = "grow-a-load")]
#[command(author = "grow-a-load authors")]
#[command(version = "0.1.0")]
#[command(about = "A memcached and HTTP load generator", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Memcached server to target (host:port), may be repeated
    #[arg(short = 's', long = "server")]
    pub servers: Vec<String>,

    /// Run duration in seconds
    #[arg(short = 't', long)]
    pub time: Option<f64>,

    /// Stop after issuing this many operations per connection
    #[arg(long)]
    pub ops: Option<u64>,

    /// Maximum outstanding requests per connection
    #[arg(short = 'd', long)]
    pub depth: Option<usize>,

    /// Connections per target
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Target aggregate request rate (0 = unpaced)
    #[arg(short = 'q', long)]
    pub qps: Option<f64>,

    /// Fraction of operations that are writes
    #[arg(short = 'u', long)]
    pub update: Option<f64>,

    /// Number of distinct keys
    #[arg(short = 'r', long)]
    pub records: Option<u64>,

    /// Key size distribution
    #[arg(short = 'k', long)]
    pub keysize: Option<String>,

    /// Value size distribution
    #[arg(short = 'v', long)]
    pub valuesize: Option<String>,

    /// Inter-arrival distribution
    #[arg(short = 'i', long)]
    pub iadist: Option<String>,

    /// Load the key space and exit
    #[arg(long)]
    pub loadonly: bool,

    /// Skip the load phase
    #[arg(long)]
    pub noload: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pacing and lifetime of the run
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run duration in seconds
    pub time: Option<f64>,
    /// Operations to issue per connection before stopping
    pub ops: Option<u64>,
    /// Connections per target
    pub connections: usize,
    /// Maximum outstanding requests per connection
    pub depth: usize,
    /// Aggregate request rate across all connections (0 = unpaced)
    pub qps: f64,
    /// Inter-arrival distribution
    pub iadist: String,
    /// Hold off issuing briefly after each response
    pub moderate: bool,
    /// Drop issue slots when far behind schedule
    pub skip: bool,
    pub noload: bool,
    pub loadonly: bool,
    pub no_nodelay: bool,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Record latency for every Nth operation (0 = never)
    pub sample_every: u64,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            time: Some(default_time()),
            ops: None,
            connections: 1,
            depth: 1,
            qps: 0.0,
            iadist: default_iadist(),
            moderate: false,
            skip: false,
            noload: false,
            loadonly: false,
            no_nodelay: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            sample_every: 1,
            seed: 0,
        }
    }
}

/// Key space and request mix
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub records: u64,
    pub update: f64,
    pub keysize: String,
    pub valuesize: String,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            records: default_records(),
            update: 0.0,
            keysize: "30".to_string(),
            valuesize: "200".to_string(),
        }
    }
}

/// Wire protocol spoken to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    #[default]
    Memcached,
    Http,
}

/// One `[[target]]` entry
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type", default)]
    pub protocol: ProtocolType,
    pub host: String,
    pub port: u16,
    pub uri: Option<String>,
    pub label: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_time() -> f64 {
    5.0
}

fn default_iadist() -> String {
    "exponential".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_records() -> u64 {
    10000
}

fn default_priority() -> u8 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A resolved endpoint a group of connections is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub protocol: ProtocolType,
    pub host: String,
    pub port: u16,
    /// Request target for HTTP; `{key}` is replaced by the key.
    pub uri: String,
    /// Request-type label used in logs.
    pub label: String,
    pub headers: Vec<(String, String)>,
    /// Dispatch priority hint; lower values are serviced first.
    pub priority: u8,
}

impl Target {
    /// Plain memcached target with default settings.
    pub fn memcached(host: &str, port: u16) -> Self {
        Self {
            protocol: ProtocolType::Memcached,
            host: host.to_string(),
            port,
            uri: String::new(),
            label: "memcached".to_string(),
            headers: Vec::new(),
            priority: default_priority(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}{}", self.label, self.host, self.port, self.uri)
    }
}

impl TryFrom<TargetConfig> for Target {
    type Error = ConfigError;

    fn try_from(cfg: TargetConfig) -> Result<Self, Self::Error> {
        if cfg.host.is_empty() {
            return Err(ConfigError::Invalid("target host is empty".to_string()));
        }

        let uri = match (cfg.protocol, cfg.uri) {
            (ProtocolType::Http, Some(uri)) if !uri.starts_with('/') => {
                return Err(ConfigError::Invalid(format!(
                    "uri '{}' must start with '/'",
                    uri
                )))
            }
            (ProtocolType::Http, uri) => uri.unwrap_or_else(|| "/".to_string()),
            (ProtocolType::Memcached, _) => String::new(),
        };

        let label = cfg.label.unwrap_or_else(|| match cfg.protocol {
            ProtocolType::Memcached => "memcached".to_string(),
            ProtocolType::Http => "http".to_string(),
        });

        Ok(Target {
            protocol: cfg.protocol,
            host: cfg.host,
            port: cfg.port,
            uri,
            label,
            headers: cfg.headers.into_iter().collect(),
            priority: cfg.priority,
        })
    }
}

/// Per-connection pacing and stopping options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Options {
    /// Maximum outstanding requests.
    pub depth: usize,
    /// Wall-clock run length measured from start.
    pub time: Option<Duration>,
    /// Number of operations to issue before stopping.
    pub ops: Option<u64>,
    pub moderate: bool,
    pub skip: bool,
    /// Per-connection request rate in requests/second (0 = unpaced).
    pub lambda: f64,
    pub loadonly: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            depth: 1,
            time: Some(Duration::from_secs_f64(default_time())),
            ops: None,
            moderate: false,
            skip: false,
            lambda: 0.0,
            loadonly: false,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub targets: Vec<Target>,
    pub connections: usize,
    pub depth: usize,
    pub time: Option<Duration>,
    pub ops: Option<u64>,
    pub qps: f64,
    pub iadist: String,
    pub moderate: bool,
    pub skip: bool,
    pub noload: bool,
    pub loadonly: bool,
    pub no_nodelay: bool,
    pub connect_timeout: Duration,
    pub sample_every: u64,
    pub seed: u64,
    pub records: u64,
    pub update: f64,
    pub keysize: String,
    pub valuesize: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let run = toml_config.run;
        let workload = toml_config.workload;

        let mut targets = toml_config
            .targets
            .into_iter()
            .map(Target::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        for server in &cli.servers {
            let (host, port) = parse_server(server)?;
            targets.push(Target::memcached(&host, port));
        }

        let time = match cli.time.or(run.time) {
            Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
            Some(secs) if secs == 0.0 => None,
            Some(secs) => return Err(ConfigError::Invalid(format!("invalid time {}", secs))),
            None => None,
        };

        let config = Config {
            targets,
            connections: cli.connections.unwrap_or(run.connections),
            depth: cli.depth.unwrap_or(run.depth),
            time,
            ops: cli.ops.or(run.ops).filter(|ops| *ops > 0),
            qps: cli.qps.unwrap_or(run.qps),
            iadist: cli.iadist.unwrap_or(run.iadist),
            moderate: run.moderate,
            skip: run.skip,
            noload: cli.noload || run.noload,
            loadonly: cli.loadonly || run.loadonly,
            no_nodelay: run.no_nodelay,
            connect_timeout: Duration::from_millis(run.connect_timeout_ms),
            sample_every: run.sample_every,
            seed: run.seed,
            records: cli.records.unwrap_or(workload.records),
            update: cli.update.unwrap_or(workload.update),
            keysize: cli.keysize.unwrap_or(workload.keysize),
            valuesize: cli.valuesize.unwrap_or(workload.valuesize),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if self.connections == 0 {
            return Err(ConfigError::Invalid("connections must be at least 1".to_string()));
        }
        if self.depth == 0 {
            return Err(ConfigError::Invalid("depth must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.update) {
            return Err(ConfigError::Invalid(format!(
                "update ratio {} is outside [0, 1]",
                self.update
            )));
        }
        if !self.qps.is_finite() || self.qps < 0.0 {
            return Err(ConfigError::Invalid(format!("invalid qps {}", self.qps)));
        }
        if self.records == 0 {
            return Err(ConfigError::Invalid("records must be at least 1".to_string()));
        }
        if self.loadonly && self.noload {
            return Err(ConfigError::Invalid(
                "loadonly and noload are mutually exclusive".to_string(),
            ));
        }
        if self.time.is_none() && self.ops.is_none() && !self.loadonly {
            return Err(ConfigError::Invalid(
                "either a run time or an operation count is required".to_string(),
            ));
        }

        self.keysize.parse::<Distribution>()?;
        self.valuesize.parse::<Distribution>()?;
        Distribution::interarrival(&self.iadist, self.lambda())?;
        Ok(())
    }

    /// Total connections across all targets.
    pub fn total_connections(&self) -> usize {
        self.targets.len() * self.connections
    }

    /// Per-connection request rate.
    pub fn lambda(&self) -> f64 {
        if self.qps <= 0.0 {
            0.0
        } else {
            self.qps / self.total_connections().max(1) as f64
        }
    }

    /// Options snapshot handed to every connection.
    pub fn options(&self) -> Options {
        Options {
            depth: self.depth,
            time: self.time,
            ops: self.ops,
            moderate: self.moderate,
            skip: self.skip,
            lambda: self.lambda(),
            loadonly: self.loadonly,
        }
    }
}

fn parse_server(server: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidServer(server.to_string());
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
        }
        None if !server.is_empty() => Ok((server.to_string(), 11211)),
        _ => Err(invalid()),
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("No targets configured; pass --server or add a [[target]] section")]
    NoTargets,
    #[error("Invalid server address '{0}'")]
    InvalidServer(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Invalid distribution: {0}")]
    Distribution(#[from] GeneratorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["grow-a-load"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.run.depth, 1);
        assert_eq!(config.run.time, Some(5.0));
        assert_eq!(config.workload.records, 10000);
        assert_eq!(config.workload.keysize, "30");
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [run]
            time = 10.0
            depth = 4
            qps = 1000.0
            connections = 2

            [workload]
            records = 500
            update = 0.1
            valuesize = "fb_value"

            [[target]]
            type = "http"
            host = "localhost"
            port = 8080
            uri = "/kv/{key}"
            headers = { "x-tenant" = "bench" }

            [[target]]
            host = "10.0.0.1"
            port = 11211

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.run.depth, 4);
        assert_eq!(config.run.iadist, "exponential");
        assert_eq!(config.workload.records, 500);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].protocol, ProtocolType::Http);
        assert_eq!(config.targets[1].protocol, ProtocolType::Memcached);
        assert_eq!(config.logging.level, "debug");

        let config = Config::merge(cli(&[]), config).unwrap();
        assert_eq!(config.targets[0].uri, "/kv/{key}");
        assert_eq!(
            config.targets[0].headers,
            vec![("x-tenant".to_string(), "bench".to_string())]
        );
        assert_eq!(config.lambda(), 250.0);
        assert_eq!(config.targets[1].to_string(), "memcached 10.0.0.1:11211");
    }

    #[test]
    fn test_cli_overrides() {
        let toml_config: TomlConfig = toml::from_str("[run]\ndepth = 4\n").unwrap();
        let config =
            Config::merge(cli(&["-s", "cache:11311", "-d", "8", "--ops", "100"]), toml_config)
                .unwrap();
        assert_eq!(config.depth, 8);
        assert_eq!(config.ops, Some(100));
        assert_eq!(config.targets, vec![Target::memcached("cache", 11311)]);
        assert_eq!(config.options().depth, 8);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            Config::merge(cli(&[]), TomlConfig::default()),
            Err(ConfigError::NoTargets)
        ));
        assert!(matches!(
            Config::merge(cli(&["-s", "h:1", "-d", "0"]), TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::merge(cli(&["-s", "h:1", "-u", "1.5"]), TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::merge(cli(&["-s", "h:1", "-v", "zipf:2"]), TomlConfig::default()),
            Err(ConfigError::Distribution(_))
        ));
        assert!(matches!(
            Config::merge(cli(&["-s", "h:notaport"]), TomlConfig::default()),
            Err(ConfigError::InvalidServer(_))
        ));
    }

    #[test]
    fn test_http_uri_must_be_absolute() {
        let toml_config: TomlConfig = toml::from_str(
            "[[target]]\ntype = \"http\"\nhost = \"h\"\nport = 80\nuri = \"kv\"\n",
        )
        .unwrap();
        assert!(matches!(
            Config::merge(cli(&[]), toml_config),
            Err(ConfigError::Invalid(_))
        ));
    }
}
