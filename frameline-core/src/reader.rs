//! Container reading
//!
//! Opens an in-memory MKV/WebM container and exposes the primary video
//! track as an ordered cursor of coded samples. Decoding happens elsewhere;
//! this layer never touches pixels.

use std::io::Cursor;

use bytes::Bytes;
use matroska_demuxer::{Frame, MatroskaFile, TrackType};
use thiserror::Error;

use crate::decode::Codec;

/// Terminal errors while opening a container.
#[derive(Debug, Clone, Error)]
pub enum OpenError {
    #[error("container has no video track")]
    NoVideoTrack,
    #[error("unsupported video codec: {0}")]
    UnsupportedCodec(String),
    #[error("video track cannot be decoded: {0}")]
    UndecodableTrack(String),
    #[error("malformed container: {0}")]
    Malformed(String),
}

/// Errors while reading samples from an already-open container.
#[derive(Debug, Clone, Error)]
pub enum ReaderError {
    #[error("container read failed: {0}")]
    Read(String),
}

/// One coded video sample, in track order.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Timestamp in seconds
    pub timestamp: f64,
    pub keyframe: bool,
    /// Coded payload (AVCC for H.264 in MKV)
    pub data: Bytes,
}

/// Static facts about the primary video track.
#[derive(Debug, Clone)]
pub struct ContainerMetadata {
    pub width: u32,
    pub height: u32,
    pub duration_ms: u64,
    pub codec: Codec,
    /// Decoder initialization data (avcC extradata for H.264)
    pub codec_private: Bytes,
}

/// Ordered cursor of coded video samples.
///
/// Samples come back in strictly increasing timestamp order for the primary
/// video track; samples of other tracks are skipped. `rewind` restarts the
/// cursor from the first sample (the underlying demuxer has no byte-level
/// seeking, so this is the only repositioning primitive).
pub trait ContainerReader: Send {
    fn metadata(&self) -> &ContainerMetadata;

    /// Next video sample, or `None` at end of media.
    fn next_sample(&mut self) -> Result<Option<Sample>, ReaderError>;

    fn rewind(&mut self) -> Result<(), ReaderError>;
}

// ============================================================================
// MKV Reader
// ============================================================================

pub struct MkvReader {
    source: Bytes,
    mkv: MatroskaFile<Cursor<Bytes>>,
    frame: Frame,
    video_track: u64,
    metadata: ContainerMetadata,
}

impl MkvReader {
    /// Open an in-memory MKV/WebM container and lock onto its first video
    /// track. The source bytes are shared, not copied.
    pub fn open(source: Bytes) -> Result<Self, OpenError> {
        let mkv = MatroskaFile::open(Cursor::new(source.clone()))
            .map_err(|e| OpenError::Malformed(format!("{e:?}")))?;

        let track = mkv
            .tracks()
            .iter()
            .find(|t| t.track_type() == TrackType::Video)
            .ok_or(OpenError::NoVideoTrack)?;

        let codec_id = track.codec_id().to_string();
        let codec = Codec::from_codec_id(&codec_id)
            .ok_or_else(|| OpenError::UnsupportedCodec(codec_id))?;

        let video = track
            .video()
            .ok_or_else(|| OpenError::UndecodableTrack("missing video settings".into()))?;
        let width = video.pixel_width().get() as u32;
        let height = video.pixel_height().get() as u32;

        let codec_private = track
            .codec_private()
            .map(Bytes::copy_from_slice)
            .ok_or_else(|| {
                OpenError::UndecodableTrack("missing decoder configuration".into())
            })?;

        // Duration comes back in nanoseconds.
        let duration_ns = mkv
            .info()
            .duration()
            .ok_or_else(|| OpenError::Malformed("container reports no duration".into()))?;
        let duration_ms = (duration_ns as u64) / 1_000_000;

        let video_track = track.track_number().get();
        tracing::debug!(
            video_track,
            width,
            height,
            duration_ms,
            ?codec,
            "opened container"
        );

        Ok(Self {
            source,
            mkv,
            frame: Frame::default(),
            video_track,
            metadata: ContainerMetadata {
                width,
                height,
                duration_ms,
                codec,
                codec_private,
            },
        })
    }
}

impl ContainerReader for MkvReader {
    fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    fn next_sample(&mut self) -> Result<Option<Sample>, ReaderError> {
        loop {
            match self.mkv.next_frame(&mut self.frame) {
                Ok(true) => {
                    if self.frame.track != self.video_track {
                        continue;
                    }
                    // Frame timestamps are in nanoseconds.
                    return Ok(Some(Sample {
                        timestamp: self.frame.timestamp as f64 / 1_000_000_000.0,
                        keyframe: self.frame.is_keyframe.unwrap_or(false),
                        data: Bytes::copy_from_slice(&self.frame.data),
                    }));
                }
                Ok(false) => return Ok(None),
                Err(e) => return Err(ReaderError::Read(format!("{e:?}"))),
            }
        }
    }

    fn rewind(&mut self) -> Result<(), ReaderError> {
        // Reparse from the start; the demuxer cannot seek.
        self.mkv = MatroskaFile::open(Cursor::new(self.source.clone()))
            .map_err(|e| ReaderError::Read(format!("{e:?}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_garbage() {
        let junk = Bytes::from_static(b"this is not a matroska file at all");
        let err = MkvReader::open(junk).err().expect("garbage must not open");
        assert!(matches!(err, OpenError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn test_open_rejects_empty() {
        assert!(matches!(
            MkvReader::open(Bytes::new()),
            Err(OpenError::Malformed(_))
        ));
    }
}
