//! Audio elementary stream header parsers.

use bitstream_io::{BigEndian, BitRead, BitReader};

/// Audio parameters discovered from a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioHeader {
    pub channels: u32,
    pub sample_rate: u32,
    pub bit_rate: u32,
    pub block_align: u32,
    pub bits_per_sample: u32,
}

/// Bit rates in kbit/s, indexed by `[version row][layer - 1][index]`.
const MPEG_BITRATES: [[[u32; 16]; 3]; 2] = [
    // MPEG-1
    [
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0],
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0],
    ],
    // MPEG-2 / 2.5
    [
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
    ],
];

/// Parse the first MPEG audio (layer I/II/III) frame header.
pub fn parse_mpeg_audio(data: &[u8]) -> Option<AudioHeader> {
    for i in 0..data.len().saturating_sub(3) {
        if data[i] != 0xFF || data[i + 1] & 0xE0 != 0xE0 {
            continue;
        }
        let version = (data[i + 1] >> 3) & 0x03;
        let layer_bits = (data[i + 1] >> 1) & 0x03;
        let bitrate_index = (data[i + 2] >> 4) & 0x0F;
        let sample_rate_index = (data[i + 2] >> 2) & 0x03;
        let channel_mode = (data[i + 3] >> 6) & 0x03;

        if version == 0x01 || layer_bits == 0 || bitrate_index == 0x0F || sample_rate_index == 0x03 {
            continue;
        }

        let base_rate = [44100, 48000, 32000][sample_rate_index as usize];
        let sample_rate = match version {
            0x03 => base_rate,
            0x02 => base_rate / 2,
            _ => base_rate / 4,
        };
        let layer = 4 - layer_bits as usize;
        let row = if version == 0x03 { 0 } else { 1 };

        return Some(AudioHeader {
            channels: if channel_mode == 0x03 { 1 } else { 2 },
            sample_rate,
            bit_rate: MPEG_BITRATES[row][layer - 1][bitrate_index as usize] * 1000,
            block_align: 0,
            bits_per_sample: 0,
        });
    }
    None
}

/// AC-3 nominal bit rates in kbit/s, indexed by `frmsizecod / 2`.
const AC3_BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

/// Channels per `acmod`, excluding LFE.
const AC3_CHANNELS: [u32; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

/// Result of parsing an AC-3 family sync frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ac3Header {
    pub audio: AudioHeader,
    /// Frame uses the enhanced (E-AC-3) syntax.
    pub enhanced: bool,
}

/// Parse the first AC-3 or E-AC-3 sync frame (sync word `0B 77`).
pub fn parse_ac3(data: &[u8]) -> Option<Ac3Header> {
    for i in 0..data.len().saturating_sub(7) {
        if data[i] != 0x0B || data[i + 1] != 0x77 {
            continue;
        }
        let bsid = data[i + 5] >> 3;
        let parsed = if bsid > 10 && bsid <= 16 {
            parse_eac3_frame(&data[i + 2..]).map(|audio| Ac3Header {
                audio,
                enhanced: true,
            })
        } else if bsid <= 8 {
            parse_ac3_frame(&data[i + 2..]).map(|audio| Ac3Header {
                audio,
                enhanced: false,
            })
        } else {
            None
        };
        if parsed.is_some() {
            return parsed;
        }
    }
    None
}

fn parse_ac3_frame(frame: &[u8]) -> Option<AudioHeader> {
    let mut br = BitReader::endian(frame, BigEndian);
    br.skip(16).ok()?; // crc1
    let fscod = br.read::<2, u8>().ok()?;
    let frmsizecod = br.read::<6, u8>().ok()?;
    br.skip(8).ok()?; // bsid, bsmod
    let acmod = br.read::<3, u8>().ok()?;
    if acmod & 0x01 != 0 && acmod != 0x01 {
        br.skip(2).ok()?; // cmixlev
    }
    if acmod & 0x04 != 0 {
        br.skip(2).ok()?; // surmixlev
    }
    if acmod == 0x02 {
        br.skip(2).ok()?; // dsurmod
    }
    let lfeon = br.read::<1, u8>().ok()?;

    let sample_rate = match fscod {
        0 => 48000,
        1 => 44100,
        2 => 32000,
        _ => return None,
    };
    let bit_rate = *AC3_BITRATES.get((frmsizecod / 2) as usize)? * 1000;

    Some(AudioHeader {
        channels: AC3_CHANNELS[acmod as usize] + lfeon as u32,
        sample_rate,
        bit_rate,
        block_align: 0,
        bits_per_sample: 0,
    })
}

fn parse_eac3_frame(frame: &[u8]) -> Option<AudioHeader> {
    let mut br = BitReader::endian(frame, BigEndian);
    br.skip(5).ok()?; // strmtyp, substreamid
    let frmsiz = br.read::<11, u16>().ok()? as u32;
    let fscod = br.read::<2, u8>().ok()?;
    let (sample_rate, blocks) = if fscod == 0x03 {
        let fscod2 = br.read::<2, u8>().ok()?;
        let rate = match fscod2 {
            0 => 24000,
            1 => 22050,
            2 => 16000,
            _ => return None,
        };
        (rate, 6)
    } else {
        let numblkscod = br.read::<2, u8>().ok()?;
        ([48000, 44100, 32000][fscod as usize], [1, 2, 3, 6][numblkscod as usize])
    };
    let acmod = br.read::<3, u8>().ok()?;
    let lfeon = br.read::<1, u8>().ok()?;

    let frame_bytes = (frmsiz + 1) * 2;
    let bit_rate = (frame_bytes as u64 * 8 * sample_rate as u64 / (blocks as u64 * 256)) as u32;

    Some(AudioHeader {
        channels: AC3_CHANNELS[acmod as usize] + lfeon as u32,
        sample_rate,
        bit_rate,
        block_align: 0,
        bits_per_sample: 0,
    })
}

const ADTS_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Parse the first ADTS (AAC) frame header.
pub fn parse_adts(data: &[u8]) -> Option<AudioHeader> {
    for i in 0..data.len().saturating_sub(6) {
        if data[i] != 0xFF || data[i + 1] & 0xF6 != 0xF0 {
            continue;
        }
        let sr_index = ((data[i + 2] & 0x3C) >> 2) as usize;
        let channel_cfg = (((data[i + 2] & 0x01) << 2) | ((data[i + 3] & 0xC0) >> 6)) as u32;
        let Some(&sample_rate) = ADTS_SAMPLE_RATES.get(sr_index) else {
            continue;
        };
        let channels = match channel_cfg {
            7 => 8,
            c => c,
        };
        return Some(AudioHeader {
            channels,
            sample_rate,
            bit_rate: 0,
            block_align: 0,
            bits_per_sample: 16,
        });
    }
    None
}

const DTS_SAMPLE_RATES: [u32; 16] = [
    0, 8000, 16000, 32000, 0, 0, 11025, 22050, 44100, 0, 0, 12000, 24000, 48000, 0, 0,
];

/// DTS bit rates in kbit/s by `rate` code.
const DTS_BITRATES: [u32; 29] = [
    32, 56, 64, 96, 112, 128, 192, 224, 256, 320, 384, 448, 512, 576, 640, 768, 960, 1024, 1152,
    1280, 1344, 1408, 1411, 1472, 1536, 1920, 2048, 3072, 3840,
];

const DTS_CHANNELS: [u32; 16] = [1, 2, 2, 2, 2, 3, 3, 4, 4, 5, 6, 6, 6, 7, 8, 8];

/// Parse the first DTS core frame header (sync word `7F FE 80 01`).
pub fn parse_dts(data: &[u8]) -> Option<AudioHeader> {
    for i in 0..data.len().saturating_sub(4) {
        if data[i..i + 4] != [0x7F, 0xFE, 0x80, 0x01] {
            continue;
        }
        if let Some(header) = parse_dts_frame(&data[i + 4..]) {
            return Some(header);
        }
    }
    None
}

fn parse_dts_frame(frame: &[u8]) -> Option<AudioHeader> {
    let mut br = BitReader::endian(frame, BigEndian);
    br.skip(1 + 5 + 1 + 7 + 14).ok()?; // ftype, short, cpf, nblks, fsize
    let amode = br.read::<6, u8>().ok()?;
    let sfreq = br.read::<4, u8>().ok()?;
    let rate = br.read::<5, u8>().ok()?;
    br.skip(10).ok()?; // mix, dynf, timef, auxf, hdcd, ext_audio_id, ext_audio, aspf
    let lff = br.read::<2, u8>().ok()?;

    let sample_rate = DTS_SAMPLE_RATES[sfreq as usize];
    if sample_rate == 0 {
        return None;
    }
    let channels = DTS_CHANNELS.get(amode as usize).copied().unwrap_or(2) + u32::from(lff != 0);

    Some(AudioHeader {
        channels,
        sample_rate,
        bit_rate: DTS_BITRATES.get(rate as usize).copied().unwrap_or(0) * 1000,
        block_align: 0,
        bits_per_sample: 0,
    })
}
