//! Configuration module for digest-scale.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for digest-scale
#[derive(Parser, Debug)]
#[command(name = "digest-scale")]
#[command(author = "digest-scale authors")]
#[command(version = "0.1.0")]
#[command(about = "Digest echo server and load generator for throughput testing", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the digest server
    Server(ServerArgs),
    /// Run a single load-generating client
    Client(ClientArgs),
    /// Run several clients in one process
    Launch(LaunchArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Host address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Seconds between throughput reports
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Maximum number of simultaneous client connections
    #[arg(long)]
    pub max_connections: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Requests per second
    pub rate: u64,

    /// Disable the periodic self-report
    #[arg(short, long)]
    pub quiet: bool,

    /// Stop after sending this many payloads
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Seconds between self-reports
    #[arg(long)]
    pub report_interval: Option<u64>,
}

#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Number of clients to start
    pub clients: usize,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Requests per second, per client
    pub rate: u64,

    /// Stop each client after sending this many payloads
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Seconds between counter reports
    #[arg(long)]
    pub report_interval: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub stats: StatsSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,
    /// Number of worker threads
    pub workers: Option<usize>,
    pub max_connections: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            workers: None,
            max_connections: None,
        }
    }
}

/// Stats collector configuration
#[derive(Debug, Deserialize)]
pub struct StatsSection {
    /// Seconds between reports
    #[serde(default = "default_interval")]
    pub interval: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Seconds between self-reports
    #[serde(default = "default_interval")]
    pub report_interval: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            report_interval: default_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_interval() -> u64 {
    20 // seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_connections: usize,
    pub stats_interval: Duration,
}

impl ServerConfig {
    /// Resolve the listen address.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for {}:{}", self.host, self.port),
                )
            })
    }
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Requests per second
    pub rate: u64,
    /// Emit the periodic self-report
    pub verbose: bool,
    pub report_interval: Duration,
    /// Payload limit; `None` runs until a fatal error
    pub count: Option<u64>,
}

/// Resolved launcher settings
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub clients: usize,
    pub client: ClientConfig,
}

/// What the process was asked to do
#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
    Launch(LaunchConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli.command, cli.log_level, toml_config)
    }

    fn merge(
        command: Command,
        log_level: Option<String>,
        toml_config: TomlConfig,
    ) -> Result<Self, ConfigError> {
        let mode = match command {
            Command::Server(args) => {
                let server = toml_config.server;
                Mode::Server(ServerConfig {
                    host: args.host.unwrap_or(server.host),
                    port: args.port.or(server.port).ok_or_else(|| {
                        ConfigError::Invalid("server port must be set".to_string())
                    })?,
                    workers: positive(
                        "workers",
                        args.workers.or(server.workers).unwrap_or_else(default_workers),
                    )?,
                    max_connections: positive(
                        "max_connections",
                        args.max_connections
                            .or(server.max_connections)
                            .unwrap_or(usize::MAX),
                    )?,
                    stats_interval: interval(
                        "stats interval",
                        args.stats_interval.unwrap_or(toml_config.stats.interval),
                    )?,
                })
            }
            Command::Client(args) => Mode::Client(ClientConfig {
                host: args.host,
                port: args.port,
                rate: rate(args.rate)?,
                verbose: !args.quiet,
                report_interval: interval(
                    "report interval",
                    args.report_interval
                        .unwrap_or(toml_config.client.report_interval),
                )?,
                count: args.count,
            }),
            Command::Launch(args) => Mode::Launch(LaunchConfig {
                clients: positive("clients", args.clients)?,
                client: ClientConfig {
                    host: args.host,
                    port: args.port,
                    rate: rate(args.rate)?,
                    verbose: false,
                    report_interval: interval(
                        "report interval",
                        args.report_interval
                            .unwrap_or(toml_config.client.report_interval),
                    )?,
                    count: args.count,
                },
            }),
        };

        Ok(Config {
            mode,
            log_level: log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

fn positive(name: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
    }
    Ok(value)
}

fn rate(value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(
            "rate must be at least 1 request per second".to_string(),
        ));
    }
    Ok(value)
}

fn interval(name: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid(format!(
            "{} must be at least 1 second",
            name
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    fn resolve(args: &[&str], toml_str: &str) -> Result<Config, ConfigError> {
        let cli = parse(args);
        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        Config::merge(cli.command, cli.log_level, toml_config)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, None);
        assert_eq!(config.stats.interval, 20);
        assert_eq!(config.client.report_interval, 20);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            workers = 4
            max_connections = 128

            [stats]
            interval = 5

            [client]
            report_interval = 2

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, Some(9000));
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, Some(128));
        assert_eq!(config.stats.interval, 5);
        assert_eq!(config.client.report_interval, 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_server_defaults() {
        let config = resolve(&["digest-scale", "server", "--port", "7000"], "").unwrap();
        assert_eq!(config.log_level, "info");
        let Mode::Server(server) = config.mode else {
            panic!("expected server mode");
        };
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 7000);
        assert!(server.workers >= 1);
        assert_eq!(server.max_connections, usize::MAX);
        assert_eq!(server.stats_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_str = r#"
            [server]
            port = 9000
            workers = 4

            [stats]
            interval = 5

            [logging]
            level = "warn"
        "#;
        let config = resolve(
            &[
                "digest-scale",
                "--log-level",
                "debug",
                "server",
                "--workers",
                "2",
            ],
            toml_str,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        let Mode::Server(server) = config.mode else {
            panic!("expected server mode");
        };
        assert_eq!(server.port, 9000);
        assert_eq!(server.workers, 2);
        assert_eq!(server.stats_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_client_args() {
        let config = resolve(
            &["digest-scale", "client", "localhost", "7000", "50", "--quiet", "-n", "10"],
            "[client]\nreport_interval = 3\n",
        )
        .unwrap();
        let Mode::Client(client) = config.mode else {
            panic!("expected client mode");
        };
        assert_eq!(client.host, "localhost");
        assert_eq!(client.port, 7000);
        assert_eq!(client.rate, 50);
        assert!(!client.verbose);
        assert_eq!(client.count, Some(10));
        assert_eq!(client.report_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_launch_args() {
        let config = resolve(
            &["digest-scale", "launch", "4", "127.0.0.1", "7000", "10"],
            "",
        )
        .unwrap();
        let Mode::Launch(launch) = config.mode else {
            panic!("expected launch mode");
        };
        assert_eq!(launch.clients, 4);
        assert_eq!(launch.client.rate, 10);
        assert!(!launch.client.verbose);
        assert_eq!(launch.client.count, None);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            resolve(&["digest-scale", "server"], ""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            resolve(&["digest-scale", "server", "-p", "1", "-w", "0"], ""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            resolve(&["digest-scale", "client", "h", "1", "0"], ""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            resolve(&["digest-scale", "server", "-p", "1"], "[stats]\ninterval = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            resolve(&["digest-scale", "launch", "0", "h", "1", "1"], ""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_socket_addr() {
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 7000,
            workers: 1,
            max_connections: 1,
            stats_interval: Duration::from_secs(1),
        };
        assert_eq!(server.socket_addr().unwrap(), "127.0.0.1:7000".parse().unwrap());
    }
}
