//! Channel lineup and lookup.
//!
//! Channels are loaded from a TOML file alongside the replay device
//! definitions. The lineup can be swapped at runtime (SIGHUP) without
//! disturbing sessions that already hold a copy of their channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

/// Errors while loading the channel lineup.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to read channel file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse channel file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate channel uid {0:#010x}")]
    DuplicateUid(u32),
}

/// Delivery system of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Satellite,
    Cable,
    #[default]
    Terrestrial,
    /// Analog capture card delivering a program stream.
    Analog,
}

/// Video codec hint from the channel definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    Mpeg2,
    H264,
}

/// Audio codec hint from the channel definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Mpeg,
    Ac3,
    Eac3,
    Aac,
    Dts,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VideoComponent {
    pub pid: u16,
    #[serde(default)]
    pub codec: VideoCodec,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AudioComponent {
    pub pid: u16,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub codec: Option<AudioCodec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubtitleComponent {
    pub pid: u16,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub composition_page_id: u16,
    #[serde(default)]
    pub ancillary_page_id: u16,
}

/// A tunable channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Channel {
    pub uid: u32,
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub source: SourceType,
    #[serde(default)]
    pub video: Option<VideoComponent>,
    #[serde(default)]
    pub audio: Vec<AudioComponent>,
    /// Dolby and other "data" audio components.
    #[serde(default)]
    pub dolby: Vec<AudioComponent>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleComponent>,
    #[serde(default)]
    pub teletext_pid: Option<u16>,
    /// Transport stream replayed by the file device for this channel.
    #[serde(default)]
    pub source_file: Option<PathBuf>,
}

impl Channel {
    /// True if the channel carries no video component.
    pub fn is_radio(&self) -> bool {
        self.video.is_none()
    }
}

/// Replay device definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceDefinition {
    pub card_index: i32,
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Replay rate of the source files.
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
}

fn default_device_name() -> String {
    "File replay".to_string()
}

fn default_bitrate_kbps() -> u32 {
    8_000
}

#[derive(Debug, Deserialize, Default)]
struct ChannelsFile {
    #[serde(default)]
    channel: Vec<Channel>,
    #[serde(default)]
    device: Vec<DeviceDefinition>,
}

/// Resolves client channel references.
pub trait ChannelDirectory: Send + Sync {
    fn find_by_uid(&self, uid: u32) -> Option<Channel>;
    fn find_by_number(&self, number: u32) -> Option<Channel>;
}

/// An immutable channel lineup.
#[derive(Debug, Default, Clone)]
pub struct ChannelList {
    channels: Vec<Channel>,
    by_uid: HashMap<u32, usize>,
    devices: Vec<DeviceDefinition>,
}

impl ChannelList {
    pub fn new(channels: Vec<Channel>) -> Result<Self, ChannelError> {
        Self::with_devices(channels, Vec::new())
    }

    fn with_devices(channels: Vec<Channel>, devices: Vec<DeviceDefinition>) -> Result<Self, ChannelError> {
        let mut by_uid = HashMap::with_capacity(channels.len());
        for (idx, channel) in channels.iter().enumerate() {
            if by_uid.insert(channel.uid, idx).is_some() {
                return Err(ChannelError::DuplicateUid(channel.uid));
            }
        }
        Ok(Self {
            channels,
            by_uid,
            devices,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, ChannelError> {
        let file: ChannelsFile = toml::from_str(contents)?;
        Self::with_devices(file.channel, file.device)
    }

    pub fn load(path: &Path) -> Result<Self, ChannelError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ChannelError::Io(path.to_path_buf(), e))?;
        Self::parse(&contents)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn devices(&self) -> &[DeviceDefinition] {
        &self.devices
    }
}

impl ChannelDirectory for ChannelList {
    fn find_by_uid(&self, uid: u32) -> Option<Channel> {
        self.by_uid.get(&uid).map(|&idx| self.channels[idx].clone())
    }

    fn find_by_number(&self, number: u32) -> Option<Channel> {
        self.channels.iter().find(|c| c.number == number).cloned()
    }
}

/// A lineup that can be replaced while connections are running.
#[derive(Debug, Default)]
pub struct SharedChannels {
    inner: RwLock<ChannelList>,
}

impl SharedChannels {
    pub fn new(list: ChannelList) -> Self {
        Self {
            inner: RwLock::new(list),
        }
    }

    /// Swap in a new lineup, returning the number of channels.
    pub fn replace(&self, list: ChannelList) -> usize {
        let count = list.len();
        *self.inner.write() = list;
        count
    }
}

impl ChannelDirectory for SharedChannels {
    fn find_by_uid(&self, uid: u32) -> Option<Channel> {
        self.inner.read().find_by_uid(uid)
    }

    fn find_by_number(&self, number: u32) -> Option<Channel> {
        self.inner.read().find_by_number(number)
    }
}
