//! Agent configuration.
//!
//! Options resolve with the precedence flags > environment > JSON config
//! file > defaults; the config file spells intervals as duration strings.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use harvest_core::{HarvestError, Result};

const DEFAULT_ADDRESS: &str = "localhost:8080";
const DEFAULT_REPORT_INTERVAL: u64 = 10;
const DEFAULT_POLL_INTERVAL: u64 = 2;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_RATE_LIMIT: usize = 1024;

/// Wire protocol towards the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Http,
    Grpc,
}

/// Command-line / environment options.
#[derive(Parser, Debug, Default)]
#[command(name = "harvest-agent", about = "Metrics harvest agent", long_about = None)]
pub struct Cli {
    /// Server address, e.g. localhost:8080
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Publish interval in seconds (default 10)
    #[arg(short = 'r', long = "report-interval", env = "REPORT_INTERVAL")]
    pub report_interval: Option<u64>,

    /// Sampling interval in seconds (default 2)
    #[arg(short = 'p', long = "poll-interval", env = "POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    /// Log level (default info)
    #[arg(long = "log-level", env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Shared HMAC key
    #[arg(short = 'k', long, env = "KEY")]
    pub key: Option<String>,

    /// Number of publish workers (default 1024)
    #[arg(short = 'l', long = "rate-limit", env = "RATE_LIMIT")]
    pub rate_limit: Option<usize>,

    /// Path to the PEM public key for body encryption
    #[arg(long = "crypto-key", env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Protocol to communicate with the server
    #[arg(long, env = "PROTOCOL", value_enum)]
    pub protocol: Option<Protocol>,

    /// JSON file holding configuration
    #[arg(short = 'c', long = "config", env = "CONFIG")]
    pub config_file: Option<PathBuf>,
}

/// JSON config file shape.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub address: Option<String>,
    #[serde(with = "humantime_serde::option")]
    pub report_interval: Option<Duration>,
    #[serde(with = "humantime_serde::option")]
    pub poll_interval: Option<Duration>,
    pub crypto_key: Option<PathBuf>,
    pub protocol: Option<String>,
}

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server address as host:port, scheme stripped.
    pub address: String,
    pub report_interval: u64,
    pub poll_interval: u64,
    pub log_level: String,
    pub key: Option<String>,
    pub rate_limit: usize,
    pub crypto_key: Option<PathBuf>,
    pub protocol: Protocol,
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        let file = match &cli.config_file {
            Some(path) => Some(read_file_config(path)?),
            None => None,
        };
        Self::resolve(cli, file)
    }

    /// Merge sources with the precedence flags/env > file > defaults.
    pub fn resolve(cli: Cli, file: Option<FileConfig>) -> Result<Self> {
        let file = file.unwrap_or_default();

        let mut address = cli
            .address
            .or(file.address)
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        if let Some(stripped) = address.strip_prefix("http://") {
            address = stripped.to_string();
        }

        let protocol = match cli.protocol {
            Some(p) => p,
            None => match file.protocol.as_deref() {
                None | Some("http") => Protocol::Http,
                Some("grpc") => Protocol::Grpc,
                Some(other) => {
                    return Err(HarvestError::InvalidConfig {
                        reason: format!("unknown protocol {other}"),
                    })
                }
            },
        };

        let rate_limit = cli.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT);
        if rate_limit == 0 {
            return Err(HarvestError::InvalidConfig {
                reason: "rate limit must be positive".to_string(),
            });
        }

        let report_interval = cli
            .report_interval
            .or_else(|| file.report_interval.map(|d| d.as_secs()))
            .unwrap_or(DEFAULT_REPORT_INTERVAL);
        let poll_interval = cli
            .poll_interval
            .or_else(|| file.poll_interval.map(|d| d.as_secs()))
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        if report_interval == 0 || poll_interval == 0 {
            return Err(HarvestError::InvalidConfig {
                reason: "intervals must be at least one second".to_string(),
            });
        }

        Ok(Self {
            address,
            report_interval,
            poll_interval,
            log_level: cli.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            key: cli.key.filter(|s| !s.is_empty()),
            rate_limit,
            crypto_key: cli.crypto_key.or(file.crypto_key),
            protocol,
        })
    }
}

fn read_file_config(path: &PathBuf) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|source| HarvestError::Io { path: path.clone(), source })?;
    serde_json::from_str(&content).map_err(|e| HarvestError::InvalidConfig {
        reason: format!("parse config file {}: {e}", path.display()),
    })
}
