//! Command-line and environment configuration.

use crate::supervisor::ReconnectConfig;
use clap::Parser;
use depot_core::catalog::DEFAULT_CATALOG_CAP;
use depot_core::protocol::PROTOCOL_VERSION;
use depot_core::transfer::TransferConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "depot-agent")]
#[command(about = "Device-side file distribution agent")]
pub struct Args {
    /// WebSocket endpoint of the distribution server (device id is appended)
    #[arg(long, default_value = "ws://localhost:8000/ws", env = "DEPOT_SERVER_URL")]
    pub server: String,

    /// Directory holding distributed files
    #[arg(long, default_value = "./depot-files", env = "DEPOT_STORAGE_DIR")]
    pub storage_dir: PathBuf,

    /// Device id (derived from the MAC address if not provided)
    #[arg(long, env = "DEPOT_DEVICE_ID")]
    pub device_id: Option<String>,

    /// MAC address to announce (discovered if not provided)
    #[arg(long, env = "DEPOT_MAC")]
    pub mac: Option<String>,

    /// Version announced in the online message
    #[arg(long, default_value = PROTOCOL_VERSION)]
    pub protocol_version: String,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Seconds between reconnection attempts
    #[arg(long, default_value_t = 5)]
    pub reconnect_secs: u64,

    /// Reconnection attempts before giving up (until reset with SIGHUP)
    #[arg(long, default_value_t = 10)]
    pub max_reconnect_attempts: u32,

    /// Inbound frames buffered for the processing loop
    #[arg(long, default_value_t = 8)]
    pub queue_capacity: usize,

    /// Files kept in the catalog
    #[arg(long, default_value_t = DEFAULT_CATALOG_CAP)]
    pub catalog_cap: usize,

    /// Largest file accepted, in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_file_size: u64,

    /// Cap on bytes stored in the storage directory
    #[arg(long)]
    pub storage_quota: Option<u64>,

    /// Transfer chunk size in bytes
    #[arg(long, default_value_t = 4096)]
    pub chunk_size: usize,

    /// Percentage points between progress reports
    #[arg(long, default_value_t = 10)]
    pub progress_step: u8,

    /// Longest gap between progress reports, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub progress_interval_ms: u64,

    /// Timeout for opening the WebSocket and HTTP connections
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Timeout for each bulk-channel read
    #[arg(long, default_value_t = 30)]
    pub read_timeout_secs: u64,

    /// Delete downloads whose MD5 doesn't match instead of keeping them
    #[arg(long)]
    pub strict_checksum: bool,

    /// Skip rebuilding the catalog from disk on startup
    #[arg(long)]
    pub no_scan: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("progress step must be between 1 and 100, got {0}")]
    ProgressStep(u8),

    #[error("server URL must start with ws:// or wss://, got {0:?}")]
    ServerUrl(String),

    #[error("invalid MAC address {0:?}")]
    Mac(String),

    #[error("invalid device id {0:?}")]
    DeviceId(String),
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub storage_dir: PathBuf,
    pub device_id: Option<String>,
    pub mac: Option<String>,
    pub protocol_version: String,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectConfig,
    pub queue_capacity: usize,
    pub outbox_capacity: usize,
    pub catalog_cap: usize,
    pub storage_quota: Option<u64>,
    pub transfer: TransferConfig,
    pub scan_on_start: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8000/ws".to_string(),
            storage_dir: PathBuf::from("./depot-files"),
            device_id: None,
            mac: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            queue_capacity: 8,
            outbox_capacity: 32,
            catalog_cap: DEFAULT_CATALOG_CAP,
            storage_quota: None,
            transfer: TransferConfig::default(),
            scan_on_start: true,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ConfigError::ServerUrl(self.server_url.clone()));
        }
        let nonzero = [
            ("heartbeat interval", self.heartbeat_interval.is_zero()),
            ("reconnect interval", self.reconnect.interval.is_zero()),
            ("connect timeout", self.reconnect.connect_timeout.is_zero()),
            ("max reconnect attempts", self.reconnect.max_attempts == 0),
            ("queue capacity", self.queue_capacity == 0),
            ("outbox capacity", self.outbox_capacity == 0),
            ("catalog cap", self.catalog_cap == 0),
            ("chunk size", self.transfer.chunk_size == 0),
            ("max file size", self.transfer.max_file_size == 0),
            ("progress interval", self.transfer.progress_interval.is_zero()),
            ("read timeout", self.transfer.read_timeout.is_zero()),
        ];
        if let Some(&(name, _)) = nonzero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero(name));
        }
        if !(1..=100).contains(&self.transfer.progress_step) {
            return Err(ConfigError::ProgressStep(self.transfer.progress_step));
        }
        if let Some(mac) = &self.mac {
            if crate::identity::parse_mac(mac).is_none() {
                return Err(ConfigError::Mac(mac.clone()));
            }
        }
        if let Some(id) = &self.device_id {
            if id.is_empty() || id.contains(['/', '?', '#', ' ']) {
                return Err(ConfigError::DeviceId(id.clone()));
            }
        }
        Ok(())
    }
}

impl TryFrom<Args> for AgentConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, ConfigError> {
        let config = AgentConfig {
            server_url: args.server,
            storage_dir: args.storage_dir,
            device_id: args.device_id,
            mac: args.mac,
            protocol_version: args.protocol_version,
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            reconnect: ReconnectConfig {
                interval: Duration::from_secs(args.reconnect_secs),
                max_attempts: args.max_reconnect_attempts,
                connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            },
            queue_capacity: args.queue_capacity,
            catalog_cap: args.catalog_cap,
            storage_quota: args.storage_quota,
            transfer: TransferConfig {
                chunk_size: args.chunk_size,
                max_file_size: args.max_file_size,
                progress_step: args.progress_step,
                progress_interval: Duration::from_millis(args.progress_interval_ms),
                read_timeout: Duration::from_secs(args.read_timeout_secs),
                strict_checksum: args.strict_checksum,
            },
            scan_on_start: !args.no_scan,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}
