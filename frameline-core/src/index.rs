//! Timestamp indexing
//!
//! One forward walk over the coded samples builds a table mapping frame
//! index -> sample timestamp at a fixed target rate, so the rest of the
//! engine can address frames by integer index. The same walk records
//! keyframe timestamps, which the decode server later uses to start a
//! decode without replaying the whole stream. No pixels are decoded here.

use crate::reader::{ContainerReader, ReaderError};

const TS_EPSILON: f64 = 1e-9;

/// Frame-index -> timestamp table at a fixed sampling rate.
#[derive(Debug, Clone)]
pub struct TimestampIndex {
    table: Vec<f64>,
    keyframes: Vec<f64>,
    target_fps: f64,
}

impl TimestampIndex {
    /// Walk the reader once and sample its timestamps on the target-fps
    /// grid: entry `i` is the timestamp of the first sample at or past
    /// `i / target_fps`. `progress` is called with percent in [0, 100].
    ///
    /// When the native rate is lower than `target_fps`, one sample can fill
    /// several consecutive grid slots, so the table is non-decreasing but
    /// not necessarily strictly increasing.
    pub fn build(
        reader: &mut dyn ContainerReader,
        target_fps: f64,
        mut progress: impl FnMut(f32),
    ) -> Result<Self, ReaderError> {
        let duration_secs = reader.metadata().duration_ms as f64 / 1000.0;
        let total = (duration_secs * target_fps).floor() as usize;
        let step = 1.0 / target_fps;

        let mut table = Vec::with_capacity(total);
        let mut keyframes = Vec::new();
        let mut last_seen: Option<f64> = None;
        let mut native_interval = 0.0f64;

        while table.len() < total {
            let Some(sample) = reader.next_sample()? else {
                break;
            };
            if sample.keyframe {
                keyframes.push(sample.timestamp);
            }
            if let Some(prev) = last_seen {
                native_interval = sample.timestamp - prev;
            }
            last_seen = Some(sample.timestamp);
            while table.len() < total
                && sample.timestamp + TS_EPSILON >= table.len() as f64 * step
            {
                table.push(sample.timestamp);
            }
            progress((table.len() as f32 / total.max(1) as f32) * 100.0);
        }

        // The final sample stays on screen for one native frame interval,
        // so grid slots inside that tail belong to it. Slots past the tail
        // mean the cursor genuinely ended early.
        if let Some(last) = last_seen {
            while table.len() < total
                && table.len() as f64 * step + TS_EPSILON < last + native_interval
            {
                table.push(last);
            }
        }

        if table.len() + 1 < total {
            tracing::warn!(
                expected = total,
                indexed = table.len(),
                "cursor ended before the declared duration"
            );
        }
        progress(100.0);
        tracing::debug!(
            frames = table.len(),
            keyframes = keyframes.len(),
            target_fps,
            "index built"
        );

        Ok(Self {
            table,
            keyframes,
            target_fps,
        })
    }

    /// Timestamp (seconds) for a frame index, `None` when out of range.
    pub fn lookup(&self, index: usize) -> Option<f64> {
        self.table.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Nominal spacing between indexed frames, in seconds.
    pub fn frame_interval(&self) -> f64 {
        1.0 / self.target_fps
    }

    /// Timestamp of the last keyframe at or before `ts`, or `-inf` when the
    /// stream had none that early (decode then starts wherever the cursor
    /// already is).
    pub fn keyframe_before(&self, ts: f64) -> f64 {
        let n = self
            .keyframes
            .partition_point(|&k| k <= ts + TS_EPSILON);
        if n == 0 {
            f64::NEG_INFINITY
        } else {
            self.keyframes[n - 1]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Codec;
    use crate::reader::{ContainerMetadata, Sample};
    use bytes::Bytes;

    /// Scripted reader: fixed-rate samples with periodic keyframes.
    struct ScriptReader {
        metadata: ContainerMetadata,
        samples: Vec<Sample>,
        pos: usize,
    }

    impl ScriptReader {
        fn new(native_fps: f64, duration_ms: u64, keyframe_every: usize) -> Self {
            let count = (duration_ms as f64 / 1000.0 * native_fps).round() as usize;
            let samples = (0..count)
                .map(|i| Sample {
                    timestamp: i as f64 / native_fps,
                    keyframe: i % keyframe_every == 0,
                    data: Bytes::new(),
                })
                .collect();
            Self {
                metadata: ContainerMetadata {
                    width: 320,
                    height: 240,
                    duration_ms,
                    codec: Codec::H264,
                    codec_private: Bytes::new(),
                },
                samples,
                pos: 0,
            }
        }
    }

    impl ContainerReader for ScriptReader {
        fn metadata(&self) -> &ContainerMetadata {
            &self.metadata
        }

        fn next_sample(&mut self) -> Result<Option<Sample>, ReaderError> {
            let s = self.samples.get(self.pos).cloned();
            self.pos += 1;
            Ok(s)
        }

        fn rewind(&mut self) -> Result<(), ReaderError> {
            self.pos = 0;
            Ok(())
        }
    }

    #[test]
    fn test_table_is_monotonic_and_sized() {
        // 60 fps native sampled at 30 fps over 10 s.
        let mut reader = ScriptReader::new(60.0, 10_000, 30);
        let index = TimestampIndex::build(&mut reader, 30.0, |_| {}).unwrap();

        assert_eq!(index.len(), 300);
        let mut prev = f64::NEG_INFINITY;
        for i in 0..index.len() {
            let ts = index.lookup(i).unwrap();
            assert!(ts >= prev, "table must be non-decreasing at {i}");
            prev = ts;
        }
    }

    #[test]
    fn test_low_native_rate_repeats_samples() {
        // 10 fps native sampled at 30 fps: each sample fills ~3 slots.
        let mut reader = ScriptReader::new(10.0, 2_000, 10);
        let index = TimestampIndex::build(&mut reader, 30.0, |_| {}).unwrap();

        // Table pattern: [0.0, 0.1, 0.1, 0.1, 0.2, 0.2, 0.2, ...]
        assert_eq!(index.len(), 60);
        assert_ne!(index.lookup(0), index.lookup(1));
        assert_eq!(index.lookup(1), index.lookup(2));
        assert_eq!(index.lookup(2), index.lookup(3));
        assert_ne!(index.lookup(3), index.lookup(4));
    }

    #[test]
    fn test_tail_slots_covered_by_final_sample() {
        // Samples end at 1.9 s of a 2 s container; the 1.9 s sample owns
        // the grid slots up to (but not past) 2.0 s.
        let mut reader = ScriptReader::new(10.0, 2_000, 10);
        let index = TimestampIndex::build(&mut reader, 30.0, |_| {}).unwrap();

        assert_eq!(index.len(), 60);
        assert_eq!(index.lookup(58), index.lookup(57));
        assert_eq!(index.lookup(59), index.lookup(57));
    }

    #[test]
    fn test_lookup_out_of_range() {
        let mut reader = ScriptReader::new(30.0, 1_000, 30);
        let index = TimestampIndex::build(&mut reader, 30.0, |_| {}).unwrap();
        assert!(index.lookup(index.len()).is_none());
        assert!(index.lookup(usize::MAX).is_none());
    }

    #[test]
    fn test_progress_reaches_completion() {
        let mut reader = ScriptReader::new(30.0, 2_000, 30);
        let mut last = -1.0f32;
        let mut monotonic = true;
        TimestampIndex::build(&mut reader, 30.0, |p| {
            if p < last {
                monotonic = false;
            }
            last = p;
        })
        .unwrap();
        assert!(monotonic);
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_keyframe_before() {
        // Keyframes at 0.0, 1.0, 2.0, ... (every 30th sample at 30 fps).
        let mut reader = ScriptReader::new(30.0, 5_000, 30);
        let index = TimestampIndex::build(&mut reader, 30.0, |_| {}).unwrap();

        assert_eq!(index.keyframe_before(0.0), 0.0);
        assert_eq!(index.keyframe_before(0.5), 0.0);
        assert_eq!(index.keyframe_before(1.0), 1.0);
        assert_eq!(index.keyframe_before(3.7), 3.0);
    }

    #[test]
    fn test_short_cursor_truncates_table() {
        // Declared 10 s but only 2 s of samples.
        let mut reader = ScriptReader::new(30.0, 10_000, 30);
        reader.samples.truncate(60);
        let index = TimestampIndex::build(&mut reader, 30.0, |_| {}).unwrap();
        assert!(index.len() <= 60);
        assert!(index.len() >= 59);
    }
}
