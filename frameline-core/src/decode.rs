//! Video decoding
//!
//! The `VideoDecoder` trait is the seam between the decode server and a
//! concrete codec backend. The only shipped backend is openh264; Matroska
//! carries H.264 in AVCC (length-prefixed) form, so the backend converts to
//! Annex B and replays SPS/PPS from the track's extradata before the first
//! coded sample.

use openh264::formats::YUVSource;
use thiserror::Error;

use crate::frame::PixelFormat;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder init failed: {0}")]
    Init(String),
    #[error("decode failed: {0}")]
    Failed(String),
    #[error("invalid decoder configuration data")]
    BadExtradata,
}

/// Video codec of the primary track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
}

impl Codec {
    /// Map a Matroska codec id to a decodable codec.
    pub fn from_codec_id(codec_id: &str) -> Option<Self> {
        match codec_id {
            "V_MPEG4/ISO/AVC" => Some(Codec::H264),
            _ => None,
        }
    }
}

/// One decoded picture, converted to packed RGB.
#[derive(Debug)]
pub struct DecodedImage {
    pub data: Vec<u8>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in seconds
    pub pts: f64,
}

/// Decoder backend trait.
///
/// `decode` is fed coded samples in timestamp order and yields at most one
/// picture per call; backends with reorder delay surface the remainder via
/// `flush`. `reset` discards all state, required before feeding a sample
/// that does not follow the previously fed one.
pub trait VideoDecoder: Send {
    fn decode(&mut self, sample: &[u8], pts: f64) -> Result<Option<DecodedImage>, DecodeError>;

    fn flush(&mut self) -> Result<Vec<DecodedImage>, DecodeError>;

    fn reset(&mut self);

    fn name(&self) -> &str;
}

// ============================================================================
// OpenH264 Software Decoder
// ============================================================================

pub struct OpenH264Decoder {
    inner: openh264::decoder::Decoder,
    /// SPS/PPS in Annex B form, replayed after every reset
    parameter_sets: Vec<u8>,
    nal_length_size: usize,
    sent_parameter_sets: bool,
}

impl OpenH264Decoder {
    /// Build a decoder from the track's avcC extradata.
    pub fn new(extradata: &[u8]) -> Result<Self, DecodeError> {
        let (parameter_sets, nal_length_size) =
            parse_avcc_extradata(extradata).ok_or(DecodeError::BadExtradata)?;
        let inner = openh264::decoder::Decoder::new()
            .map_err(|e| DecodeError::Init(e.to_string()))?;
        Ok(Self {
            inner,
            parameter_sets,
            nal_length_size,
            sent_parameter_sets: false,
        })
    }
}

impl VideoDecoder for OpenH264Decoder {
    fn decode(&mut self, sample: &[u8], pts: f64) -> Result<Option<DecodedImage>, DecodeError> {
        let mut packet =
            Vec::with_capacity(sample.len() + self.parameter_sets.len() + 16);
        if !self.sent_parameter_sets {
            packet.extend_from_slice(&self.parameter_sets);
            self.sent_parameter_sets = true;
        }
        packet.extend_from_slice(&avcc_to_annexb(sample, self.nal_length_size));

        let decoded = self
            .inner
            .decode(&packet)
            .map_err(|e| DecodeError::Failed(e.to_string()))?;

        let Some(yuv) = decoded else {
            return Ok(None);
        };
        let (width, height) = yuv.dimensions();
        let mut data = vec![0u8; width * height * 3];
        yuv.write_rgb8(&mut data);
        Ok(Some(DecodedImage {
            data,
            format: PixelFormat::Rgb8,
            width: width as u32,
            height: height as u32,
            pts,
        }))
    }

    fn flush(&mut self) -> Result<Vec<DecodedImage>, DecodeError> {
        // openh264 emits pictures as their data arrives; nothing is held back.
        Ok(Vec::new())
    }

    fn reset(&mut self) {
        if let Ok(fresh) = openh264::decoder::Decoder::new() {
            self.inner = fresh;
        }
        self.sent_parameter_sets = false;
    }

    fn name(&self) -> &str {
        "OpenH264"
    }
}

// ============================================================================
// AVCC / Annex B
// ============================================================================

const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Convert AVCC NAL units ([len][NAL][len][NAL]...) to Annex B
/// ([startcode][NAL]...).
fn avcc_to_annexb(data: &[u8], nal_length_size: usize) -> Vec<u8> {
    if data.is_empty() || nal_length_size == 0 || nal_length_size > 4 {
        return data.to_vec();
    }

    let mut result = Vec::with_capacity(data.len() + 64);
    let mut offset = 0;

    while offset + nal_length_size <= data.len() {
        let nal_len = read_be_uint(&data[offset..], nal_length_size);
        offset += nal_length_size;
        if nal_len == 0 || offset + nal_len > data.len() {
            break;
        }
        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(&data[offset..offset + nal_len]);
        offset += nal_len;
    }

    result
}

/// Parse avcC extradata. Returns (SPS/PPS as Annex B, nal_length_size).
///
/// Layout: version, profile, profile-compat, level,
/// `0xFC | (nal_length_size - 1)`, `0xE0 | num_sps`, then the SPS entries
/// and PPS entries, each u16-length-prefixed.
fn parse_avcc_extradata(extradata: &[u8]) -> Option<(Vec<u8>, usize)> {
    if extradata.len() < 7 || extradata[0] != 1 {
        return None;
    }

    let nal_length_size = ((extradata[4] & 0x03) + 1) as usize;
    let num_sps = (extradata[5] & 0x1F) as usize;

    let mut result = Vec::with_capacity(extradata.len() + 32);
    let mut offset = 6;

    for _ in 0..num_sps {
        if offset + 2 > extradata.len() {
            return None;
        }
        let sps_len = u16::from_be_bytes([extradata[offset], extradata[offset + 1]]) as usize;
        offset += 2;
        if offset + sps_len > extradata.len() {
            return None;
        }
        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(&extradata[offset..offset + sps_len]);
        offset += sps_len;
    }

    if offset >= extradata.len() {
        return Some((result, nal_length_size));
    }

    let num_pps = extradata[offset] as usize;
    offset += 1;

    for _ in 0..num_pps {
        if offset + 2 > extradata.len() {
            break;
        }
        let pps_len = u16::from_be_bytes([extradata[offset], extradata[offset + 1]]) as usize;
        offset += 2;
        if offset + pps_len > extradata.len() {
            break;
        }
        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(&extradata[offset..offset + pps_len]);
        offset += pps_len;
    }

    Some((result, nal_length_size))
}

fn read_be_uint(data: &[u8], size: usize) -> usize {
    let mut val = 0usize;
    for &b in &data[..size] {
        val = (val << 8) | (b as usize);
    }
    val
}
