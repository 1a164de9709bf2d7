//! Command line and configuration file handling.
//!
//! Settings come from the command line and an optional TOML file. Explicit
//! command line values take precedence over the file, the file over the
//! built-in defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::streamer::StreamerConfig;

/// Default listen address (the XVDR port).
pub const DEFAULT_LISTEN: &str = "0.0.0.0:34890";

/// Configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "xvdr-server.toml";

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_CHANNELS_FILE: &str = "channels.toml";
const DEFAULT_SERVER_NAME: &str = "xvdr-server";

/// xvdr-server - Live TV streaming server for XVDR clients
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Channel lineup file (TOML)
    #[arg(long)]
    pub channels: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
    pub log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub streaming: StreamingSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub listen: Option<String>,
    pub name: Option<String>,
    pub channels: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamingSection {
    pub priority: Option<i32>,
    pub scan_timeout_secs: Option<u64>,
    pub max_streams: Option<usize>,
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Explicit config path, or the default file if it exists.
pub fn config_path(args: &Args) -> Option<PathBuf> {
    args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    })
}

/// Effective settings after merging.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    pub server_name: String,
    pub channels_file: PathBuf,
    pub streamer: StreamerConfig,
    pub log_dir: PathBuf,
    pub log_retention_days: u64,
    pub log_level: Option<String>,
    pub verbose: bool,
}

impl Settings {
    pub fn resolve(args: &Args, file: ConfigFile) -> Result<Self, Box<dyn std::error::Error>> {
        let listen = match (args.listen, file.server.listen.as_deref()) {
            (Some(addr), _) => addr,
            (None, Some(addr)) => addr.parse()?,
            (None, None) => DEFAULT_LISTEN.parse()?,
        };

        let channels_file = args
            .channels
            .clone()
            .or_else(|| file.server.channels.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CHANNELS_FILE));

        // command line wins only when it differs from its default
        let log_dir = if args.log_dir.as_os_str() != DEFAULT_LOG_DIR {
            args.log_dir.clone()
        } else {
            PathBuf::from(file.logging.log_dir.as_deref().unwrap_or(DEFAULT_LOG_DIR))
        };
        let log_retention_days = if args.log_retention_days != DEFAULT_RETENTION_DAYS {
            args.log_retention_days
        } else {
            file.logging.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS)
        };

        let defaults = StreamerConfig::default();
        let streaming = file.streaming;
        let streamer = StreamerConfig {
            priority: streaming.priority.unwrap_or(defaults.priority),
            scan_timeout: streaming
                .scan_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.scan_timeout),
            max_streams: streaming.max_streams.unwrap_or(defaults.max_streams),
            buffer_size: streaming.buffer_size.unwrap_or(defaults.buffer_size),
        };

        Ok(Self {
            listen,
            server_name: file
                .server
                .name
                .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
            channels_file,
            streamer,
            log_dir,
            log_retention_days,
            log_level: file.logging.level,
            verbose: args.verbose,
        })
    }
}
