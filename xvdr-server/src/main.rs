//! xvdr-server: live TV streaming server for XVDR clients.
//!
//! Clients connect over TCP, log in and open channels; the server tunes a
//! device, demultiplexes the channel's elementary streams and streams them
//! back as framed packets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

mod channels;
mod config;
mod demux;
mod device;
mod error;
mod logging;
mod server;
mod streamer;

use channels::{ChannelError, ChannelList, SharedChannels};
use config::{Args, ConfigFile, Settings};
use device::FileDeviceProvider;
use server::{BuiltinCommands, ConnectionRegistry, Server, ServerConfig, Services, StatusEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match config::config_path(&args) {
        Some(path) => match config::load_config(&path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };
    let settings = Settings::resolve(&args, file_config)?;

    logging::init_logging(
        &settings.log_dir,
        settings.log_retention_days,
        settings.verbose,
        settings.log_level.as_deref(),
    )
    .expect("Failed to initialize logging");

    let lineup = match ChannelList::load(&settings.channels_file) {
        Ok(list) => list,
        Err(e) => {
            error!("Failed to load channels: {}", e);
            return Err(e.into());
        }
    };
    if lineup.devices().is_empty() {
        warn!("No devices defined in {}, every channel will be unavailable", settings.channels_file.display());
    }
    let devices = Arc::new(FileDeviceProvider::new(lineup.devices()));
    let channel_count = lineup.len();
    let channels = Arc::new(SharedChannels::new(lineup));

    info!("xvdr-server starting...");
    info!("  Listen address: {}", settings.listen);
    info!("  Channels: {} from {}", channel_count, settings.channels_file.display());
    info!("  Devices: {}", devices.devices().len());
    info!(
        "  Streaming: priority {}, scan timeout {:?}, max streams {}",
        settings.streamer.priority, settings.streamer.scan_timeout, settings.streamer.max_streams
    );

    let registry = Arc::new(ConnectionRegistry::new());
    let services = Services {
        channels: channels.clone(),
        devices,
        commands: Arc::new(BuiltinCommands::new(settings.server_name.clone())),
        registry: Arc::clone(&registry),
        streamer: settings.streamer.clone(),
    };

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(
        settings.channels_file.clone(),
        Arc::clone(&channels),
        Arc::clone(&registry),
    ));

    let server = Server::new(
        ServerConfig {
            listen_addr: settings.listen,
        },
        services,
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Reload the channel lineup on SIGHUP and tell status-enabled clients.
#[cfg(unix)]
async fn reload_on_hangup(path: PathBuf, channels: Arc<SharedChannels>, registry: Arc<ConnectionRegistry>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot listen for SIGHUP, channel reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        let _ = reload_channels(&path, &channels, &registry).await;
    }
}

/// Load the lineup from `path` into `channels`.
///
/// Success is announced as a channel change; a failure keeps the current
/// lineup and is reported to clients as a status message.
async fn reload_channels(
    path: &Path,
    channels: &SharedChannels,
    registry: &ConnectionRegistry,
) -> Result<usize, ChannelError> {
    match ChannelList::load(path) {
        Ok(list) => {
            let count = channels.replace(list);
            info!("Reloaded {} channels from {}", count, path.display());
            registry.broadcast(&StatusEvent::ChannelChange).await;
            Ok(count)
        }
        Err(e) => {
            error!("Channel reload failed, keeping current lineup: {}", e);
            registry
                .broadcast(&StatusEvent::Message(format!("Channel list reload failed: {}", e)))
                .await;
            Err(e)
        }
    }
}
