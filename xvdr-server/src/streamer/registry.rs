//! Ordered collection of the demultiplexers elected for a channel.

use std::collections::HashMap;

use log::debug;

use crate::channels::{AudioCodec, Channel, VideoCodec};
use crate::demux::{StreamKind, TsDemuxer};

fn audio_kind(codec: Option<AudioCodec>, default: StreamKind) -> StreamKind {
    match codec {
        Some(AudioCodec::Mpeg) => StreamKind::Mpeg2Audio,
        Some(AudioCodec::Ac3) => StreamKind::Ac3,
        Some(AudioCodec::Eac3) => StreamKind::Eac3,
        Some(AudioCodec::Aac) => StreamKind::Aac,
        Some(AudioCodec::Dts) => StreamKind::Dts,
        None => default,
    }
}

/// Demultiplexers in election order, indexed by PID.
#[derive(Debug)]
pub struct StreamRegistry {
    streams: Vec<TsDemuxer>,
    by_pid: HashMap<u16, usize>,
    capacity: usize,
}

impl StreamRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Vec::new(),
            by_pid: HashMap::new(),
            capacity,
        }
    }

    /// Elect the streams of `channel`: video, audio, Dolby, subtitles, teletext.
    ///
    /// PIDs already claimed are skipped, as is anything past `capacity`.
    pub fn elect(channel: &Channel, capacity: usize) -> Self {
        let mut registry = Self::new(capacity);

        if let Some(video) = &channel.video {
            let kind = match video.codec {
                VideoCodec::H264 => StreamKind::H264,
                VideoCodec::Mpeg2 => StreamKind::Mpeg2Video,
            };
            registry.push(video.pid, kind);
        }
        for audio in &channel.audio {
            if let Some(demux) = registry.push(audio.pid, audio_kind(audio.codec, StreamKind::Mpeg2Audio)) {
                demux.set_language(&audio.language);
            }
        }
        for dolby in &channel.dolby {
            if let Some(demux) = registry.push(dolby.pid, audio_kind(dolby.codec, StreamKind::Ac3)) {
                demux.set_language(&dolby.language);
            }
        }
        for sub in &channel.subtitles {
            if let Some(demux) = registry.push(sub.pid, StreamKind::DvbSub) {
                demux.set_language(&sub.language);
                demux.set_subtitle_pages(sub.composition_page_id, sub.ancillary_page_id);
            }
        }
        if let Some(pid) = channel.teletext_pid {
            registry.push(pid, StreamKind::Teletext);
        }
        registry
    }

    /// Append a demultiplexer unless the PID is taken or the registry is full.
    pub fn push(&mut self, pid: u16, kind: StreamKind) -> Option<&mut TsDemuxer> {
        if self.by_pid.contains_key(&pid) || pid == 0 {
            return None;
        }
        if self.streams.len() >= self.capacity {
            debug!("stream registry full, skipping pid {}", pid);
            return None;
        }
        let index = self.streams.len();
        debug!("elected stream {} pid {} ({:?})", index, pid, kind);
        self.by_pid.insert(pid, index);
        self.streams.push(TsDemuxer::new(index, pid, kind));
        self.streams.last_mut()
    }

    pub fn find_mut(&mut self, pid: u16) -> Option<&mut TsDemuxer> {
        let idx = *self.by_pid.get(&pid)?;
        self.streams.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TsDemuxer> {
        self.streams.iter()
    }

    pub fn pids(&self) -> Vec<u16> {
        self.streams.iter().map(|s| s.pid()).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// True when every elected stream has its attributes.
    pub fn all_parsed(&self) -> bool {
        self.streams.iter().all(|s| s.is_parsed())
    }

    pub fn clear(&mut self) {
        self.streams.clear();
        self.by_pid.clear();
    }
}
