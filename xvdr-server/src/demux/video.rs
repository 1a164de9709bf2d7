//! Video elementary stream parsers.

use bitstream_io::{BigEndian, BitRead, BitReader};

use super::FrameType;

/// Geometry and timing discovered from a sequence header or SPS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoHeader {
    pub width: u32,
    pub height: u32,
    pub aspect: f64,
    pub fps_scale: u32,
    pub fps_rate: u32,
}

/// Iterate over start code positions (offset of the byte following `00 00 01`).
fn start_codes(data: &[u8]) -> impl Iterator<Item = usize> + '_ {
    (0..data.len().saturating_sub(3))
        .filter(move |&i| data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01)
        .map(|i| i + 3)
}

/// Parse an MPEG-2 sequence header (start code `00 00 01 B3`).
pub fn parse_mpeg2_sequence(data: &[u8]) -> Option<VideoHeader> {
    for pos in start_codes(data) {
        if data[pos] != 0xB3 {
            continue;
        }
        let hdr = data.get(pos + 1..pos + 8)?;
        let width = ((hdr[0] as u32) << 4) | ((hdr[1] as u32) >> 4);
        let height = (((hdr[1] as u32) & 0x0F) << 8) | hdr[2] as u32;
        let aspect_code = (hdr[3] >> 4) & 0x0F;
        let frame_rate_code = hdr[3] & 0x0F;
        if width == 0 || height == 0 {
            return None;
        }

        let (fps_scale, fps_rate) = match frame_rate_code {
            1 => (1001, 24000),
            2 => (1000, 24000),
            3 => (1000, 25000),
            4 => (1001, 30000),
            5 => (1000, 30000),
            6 => (1000, 50000),
            7 => (1001, 60000),
            8 => (1000, 60000),
            _ => (0, 0),
        };

        let aspect = match aspect_code {
            2 => 4.0 / 3.0,
            3 => 16.0 / 9.0,
            4 => 2.21,
            // square pixels
            _ => width as f64 / height as f64,
        };

        return Some(VideoHeader {
            width,
            height,
            aspect,
            fps_scale,
            fps_rate,
        });
    }
    None
}

/// Picture coding type of the first MPEG-2 picture header in `data`.
pub fn mpeg2_frame_type(data: &[u8]) -> FrameType {
    for pos in start_codes(data) {
        if data[pos] != 0x00 {
            continue;
        }
        let Some(&b) = data.get(pos + 2) else {
            break;
        };
        return match (b >> 3) & 0x07 {
            1 => FrameType::IFrame,
            2 => FrameType::PFrame,
            3 => FrameType::BFrame,
            _ => FrameType::Unknown,
        };
    }
    FrameType::Unknown
}

/// Unsigned Exp-Golomb code.
pub(crate) fn ue<R: std::io::Read>(br: &mut BitReader<R, BigEndian>) -> Option<u32> {
    let mut zeros = 0;
    while br.read::<1, u8>().ok()? == 0 {
        zeros += 1;
        if zeros > 31 {
            return None;
        }
    }
    let mut val = 1u32;
    for _ in 0..zeros {
        val = (val << 1) | br.read::<1, u8>().ok()? as u32;
    }
    Some(val - 1)
}

/// Signed Exp-Golomb code.
pub(crate) fn se<R: std::io::Read>(br: &mut BitReader<R, BigEndian>) -> Option<i32> {
    let k = ue(br)? as i64;
    let value = if k & 1 == 0 { -(k / 2) } else { (k + 1) / 2 };
    Some(value as i32)
}

/// Strip emulation prevention bytes (`00 00 03` → `00 00`).
pub(crate) fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// Sample aspect ratios indexed by `aspect_ratio_idc`.
const SAR_TABLE: [(u32, u32); 17] = [
    (0, 1),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// Find the first SPS NAL unit in an H.264 access unit and parse it.
pub fn parse_h264_sps(data: &[u8]) -> Option<VideoHeader> {
    start_codes(data)
        .filter(|&pos| pos < data.len() && data[pos] & 0x1F == 7)
        .find_map(|pos| parse_sps_rbsp(&remove_emulation_prevention(&data[pos + 1..])))
}

fn parse_sps_rbsp(rbsp: &[u8]) -> Option<VideoHeader> {
    let mut br = BitReader::endian(rbsp, BigEndian);

    let profile_idc = br.read::<8, u8>().ok()?;
    br.skip(16).ok()?; // constraint flags + level_idc
    ue(&mut br)?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = ue(&mut br)?;
        if chroma_format_idc == 3 {
            br.skip(1).ok()?;
        }
        ue(&mut br)?; // bit_depth_luma_minus8
        ue(&mut br)?; // bit_depth_chroma_minus8
        br.skip(1).ok()?;
        if br.read::<1, u8>().ok()? != 0 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for idx in 0..lists {
                if br.read::<1, u8>().ok()? != 0 {
                    let size = if idx < 6 { 16 } else { 64 };
                    let mut last = 8i32;
                    let mut next = 8i32;
                    for _ in 0..size {
                        if next != 0 {
                            let delta = se(&mut br)?;
                            next = (last + delta + 256) % 256;
                        }
                        if next != 0 {
                            last = next;
                        }
                    }
                }
            }
        }
    }

    ue(&mut br)?; // log2_max_frame_num_minus4
    match ue(&mut br)? {
        0 => {
            ue(&mut br)?;
        }
        1 => {
            br.skip(1).ok()?;
            se(&mut br)?;
            se(&mut br)?;
            for _ in 0..ue(&mut br)? {
                se(&mut br)?;
            }
        }
        _ => {}
    }
    ue(&mut br)?; // max_num_ref_frames
    br.skip(1).ok()?;

    let width_mbs = ue(&mut br)? + 1;
    let height_map_units = ue(&mut br)? + 1;
    let frame_mbs_only = br.read::<1, u8>().ok()? != 0;
    if !frame_mbs_only {
        br.skip(1).ok()?;
    }
    br.skip(1).ok()?; // direct_8x8_inference_flag

    let (crop_left, crop_right, crop_top, crop_bottom) = if br.read::<1, u8>().ok()? != 0 {
        (ue(&mut br)?, ue(&mut br)?, ue(&mut br)?, ue(&mut br)?)
    } else {
        (0, 0, 0, 0)
    };

    let frame_height_factor = if frame_mbs_only { 1 } else { 2 };
    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 | 3 => (1, frame_height_factor),
        2 => (2, frame_height_factor),
        _ => (2, 2 * frame_height_factor),
    };
    let width = (width_mbs * 16).checked_sub(crop_unit_x * (crop_left + crop_right))?;
    let height = (height_map_units * 16 * frame_height_factor)
        .checked_sub(crop_unit_y * (crop_top + crop_bottom))?;
    if width == 0 || height == 0 {
        return None;
    }

    let mut vui = Vui::default();
    if br.read::<1, u8>().unwrap_or(0) != 0 {
        // a truncated VUI keeps whatever was read so far
        let _ = parse_vui(&mut br, &mut vui);
    }
    let (sar_w, sar_h) = vui.sar;

    Some(VideoHeader {
        width,
        height,
        aspect: (width as f64 * sar_w as f64) / (height as f64 * sar_h as f64),
        fps_scale: vui.fps_scale,
        fps_rate: vui.fps_rate,
    })
}

struct Vui {
    sar: (u32, u32),
    fps_scale: u32,
    fps_rate: u32,
}

impl Default for Vui {
    fn default() -> Self {
        Self {
            sar: (1, 1),
            fps_scale: 0,
            fps_rate: 0,
        }
    }
}

fn parse_vui<R: std::io::Read>(br: &mut BitReader<R, BigEndian>, vui: &mut Vui) -> Option<()> {
    if br.read::<1, u8>().ok()? != 0 {
        let idc = br.read::<8, u8>().ok()?;
        if idc == 255 {
            let w = br.read::<16, u16>().ok()? as u32;
            let h = br.read::<16, u16>().ok()? as u32;
            if w > 0 && h > 0 {
                vui.sar = (w, h);
            }
        } else if let Some(&entry) = SAR_TABLE.get(idc as usize) {
            if entry.0 > 0 {
                vui.sar = entry;
            }
        }
    }
    if br.read::<1, u8>().ok()? != 0 {
        br.skip(1).ok()?; // overscan_appropriate_flag
    }
    if br.read::<1, u8>().ok()? != 0 {
        br.skip(4).ok()?;
        if br.read::<1, u8>().ok()? != 0 {
            br.skip(24).ok()?;
        }
    }
    if br.read::<1, u8>().ok()? != 0 {
        ue(br)?;
        ue(br)?;
    }
    if br.read::<1, u8>().ok()? != 0 {
        let num_units_in_tick = br.read::<32, u32>().ok()?;
        let time_scale = br.read::<32, u32>().ok()?;
        if num_units_in_tick > 0 && time_scale > 0 {
            vui.fps_scale = num_units_in_tick.saturating_mul(2);
            vui.fps_rate = time_scale;
        }
    }
    Some(())
}

/// Classify an H.264 access unit by its first coded slice.
pub fn h264_frame_type(data: &[u8]) -> FrameType {
    for pos in start_codes(data) {
        let Some(&header) = data.get(pos) else {
            break;
        };
        match header & 0x1F {
            5 => return FrameType::IFrame,
            1 => {
                let end = (pos + 16).min(data.len());
                let rbsp = remove_emulation_prevention(&data[pos + 1..end]);
                let mut br = BitReader::endian(&rbsp[..], BigEndian);
                let slice_type = ue(&mut br).and_then(|_| ue(&mut br));
                return match slice_type.map(|t| t % 5) {
                    Some(2) | Some(4) => FrameType::IFrame,
                    Some(0) | Some(3) => FrameType::PFrame,
                    Some(1) => FrameType::BFrame,
                    _ => FrameType::Unknown,
                };
            }
            _ => {}
        }
    }
    FrameType::Unknown
}
