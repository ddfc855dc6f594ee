//! Decode server
//!
//! Runs on its own thread and owns the mutable decode state: the container
//! cursor, the decoder instance, and the timestamp index. Requests arrive
//! over a std mpsc channel; decoded frames and progress leave through a
//! tokio unbounded channel into the async client.
//!
//! Batches are cancellable at frame granularity: before decoding each frame
//! the server checks the shared active-batch cell, and a superseded batch
//! stops silently. The cell is written only by the client's scheduler; the
//! `CancelBatch` message is advisory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::decode::{Codec, DecodedImage, OpenH264Decoder, VideoDecoder};
use crate::frame::FrameHandle;
use crate::index::TimestampIndex;
use crate::protocol::{OpenRequest, StreamError, StreamEvent, StreamMetadata, StreamRequest};
use crate::reader::{ContainerReader, MkvReader, OpenError, ReaderError, Sample};

const TS_EPSILON: f64 = 1e-9;

/// How far past the target timestamp the cursor may run before the frame is
/// declared a miss.
const DECODE_SLACK_SECS: f64 = 0.5;

/// Thread entry point. Opens the container, builds the index, then serves
/// requests until `Cleanup` or a fatal error.
pub(crate) fn run_worker(
    request: OpenRequest,
    requests: mpsc::Receiver<StreamRequest>,
    events: UnboundedSender<StreamEvent>,
    active_batch: Arc<AtomicU64>,
) {
    let session = request.session;
    match DecodeServer::initialize(request, events.clone(), active_batch) {
        Ok(mut server) => server.run(requests),
        Err(error) => {
            tracing::error!(session, %error, "decode server failed to start");
            let _ = events.send(StreamEvent::Fatal { session, error });
        }
    }
}

pub(crate) struct DecodeServer {
    reader: Box<dyn ContainerReader>,
    decoder: Box<dyn VideoDecoder>,
    index: TimestampIndex,
    session: u64,
    events: UnboundedSender<StreamEvent>,
    active_batch: Arc<AtomicU64>,
    /// Sample pulled during keyframe skipping but not yet decoded
    lookahead: Option<Sample>,
    /// Timestamp of the last sample fed to the decoder
    position: f64,
    /// Last decoded frame, kept for duplicate table entries
    last_emitted: Option<(f64, FrameHandle)>,
}

impl DecodeServer {
    fn initialize(
        request: OpenRequest,
        events: UnboundedSender<StreamEvent>,
        active_batch: Arc<AtomicU64>,
    ) -> Result<Self, StreamError> {
        let session = request.session;
        let mut reader: Box<dyn ContainerReader> =
            Box::new(MkvReader::open(request.source).map_err(StreamError::Open)?);

        let progress_events = events.clone();
        let index = TimestampIndex::build(reader.as_mut(), request.target_fps, |percent| {
            let _ = progress_events.send(StreamEvent::IndexProgress { session, percent });
        })
        .map_err(|e| StreamError::Reader(e.to_string()))?;

        let decoder: Box<dyn VideoDecoder> = match reader.metadata().codec {
            Codec::H264 => Box::new(
                OpenH264Decoder::new(&reader.metadata().codec_private)
                    .map_err(|e| StreamError::Open(OpenError::UndecodableTrack(e.to_string())))?,
            ),
        };

        // The index walk consumed the cursor.
        reader
            .rewind()
            .map_err(|e| StreamError::Reader(e.to_string()))?;

        let metadata = StreamMetadata {
            width: reader.metadata().width,
            height: reader.metadata().height,
            duration_ms: reader.metadata().duration_ms,
            frame_count: index.len(),
        };
        tracing::info!(
            session,
            frames = metadata.frame_count,
            decoder = decoder.name(),
            "decode server ready"
        );
        let _ = events.send(StreamEvent::Metadata { session, metadata });

        Ok(Self::with_parts(
            reader,
            decoder,
            index,
            session,
            events,
            active_batch,
        ))
    }

    fn with_parts(
        reader: Box<dyn ContainerReader>,
        decoder: Box<dyn VideoDecoder>,
        index: TimestampIndex,
        session: u64,
        events: UnboundedSender<StreamEvent>,
        active_batch: Arc<AtomicU64>,
    ) -> Self {
        Self {
            reader,
            decoder,
            index,
            session,
            events,
            active_batch,
            lookahead: None,
            position: f64::NEG_INFINITY,
            last_emitted: None,
        }
    }

    fn run(&mut self, requests: mpsc::Receiver<StreamRequest>) {
        while let Ok(request) = requests.recv() {
            match request {
                StreamRequest::GetFrame { index } => match self.decode_at(index) {
                    Ok(handle) => {
                        let _ = self.events.send(StreamEvent::Frame {
                            session: self.session,
                            index,
                            handle,
                        });
                    }
                    Err(error) => {
                        self.fail(error);
                        return;
                    }
                },
                StreamRequest::GetBatch {
                    start,
                    end,
                    request_id,
                } => {
                    if let Err(error) = self.serve_batch(start, end, request_id) {
                        self.fail(error);
                        return;
                    }
                }
                StreamRequest::CancelBatch { request_id } => {
                    // Cancellation itself is carried by the shared cell.
                    tracing::debug!(request_id, "batch cancel acknowledged");
                }
                StreamRequest::Cleanup => {
                    tracing::debug!(session = self.session, "decode server shutting down");
                    return;
                }
            }
        }
    }

    fn fail(&self, error: StreamError) {
        tracing::error!(session = self.session, %error, "decode server terminating");
        let _ = self.events.send(StreamEvent::Fatal {
            session: self.session,
            error,
        });
    }

    fn serve_batch(
        &mut self,
        start: usize,
        end: usize,
        request_id: u64,
    ) -> Result<(), StreamError> {
        let total = end.saturating_sub(start);
        if total == 0 {
            return Ok(());
        }
        tracing::debug!(request_id, start, end, "serving batch");

        for index in start..end {
            if self.active_batch.load(Ordering::SeqCst) != request_id {
                tracing::debug!(request_id, index, "batch superseded, stopping");
                return Ok(());
            }
            let handle = self.decode_at(index)?;
            let done = index - start + 1;
            let _ = self.events.send(StreamEvent::BatchFrame {
                session: self.session,
                request_id,
                index,
                handle,
                percent: (done as f32 / total as f32) * 100.0,
                is_complete: done == total,
            });
        }
        Ok(())
    }

    /// Decode the frame at `index`. `Ok(None)` means out of range or a
    /// per-frame miss; `Err` means the session is done for.
    fn decode_at(&mut self, index: usize) -> Result<Option<FrameHandle>, StreamError> {
        let Some(target) = self.index.lookup(index) else {
            return Ok(None);
        };

        // Duplicate table entries (native rate below target rate) resolve to
        // the picture decoded for the previous index.
        if let Some((ts, handle)) = &self.last_emitted {
            if (ts - target).abs() < TS_EPSILON {
                return Ok(Some(handle.clone()));
            }
        }

        self.position_to(target)
            .map_err(|e| StreamError::Reader(e.to_string()))?;
        let interval = self.index.frame_interval();

        loop {
            let Some(sample) = self.pull().map_err(|e| StreamError::Reader(e.to_string()))?
            else {
                // Cursor exhausted; drain whatever the decoder still holds.
                match self.decoder.flush() {
                    Ok(images) => {
                        for image in images {
                            if image.pts + TS_EPSILON >= target {
                                return Ok(self.accept(index, target, interval, image));
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(index, error = %e, "decoder flush failed");
                        self.decoder.reset();
                    }
                }
                return Ok(None);
            };

            self.position = sample.timestamp;
            match self.decoder.decode(&sample.data, sample.timestamp) {
                Ok(Some(image)) if image.pts + TS_EPSILON >= target => {
                    return Ok(self.accept(index, target, interval, image));
                }
                Ok(_) => {
                    // Earlier picture inside the group; its pixels are
                    // dropped here.
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "sample decode failed");
                    self.decoder.reset();
                    return Ok(None);
                }
            }

            if self.position > target + DECODE_SLACK_SECS {
                tracing::warn!(index, target, "no picture produced near target timestamp");
                return Ok(None);
            }
        }
    }

    /// Move the cursor so decoding can reach `target`: rewind when the
    /// cursor already ran past it, then skip coded samples (no decode) up to
    /// the last indexed keyframe at or before it.
    fn position_to(&mut self, target: f64) -> Result<(), ReaderError> {
        if target <= self.position {
            tracing::trace!(target, position = self.position, "rewinding cursor");
            self.reader.rewind()?;
            self.decoder.reset();
            self.lookahead = None;
            self.position = f64::NEG_INFINITY;
        }

        let keyframe_ts = self.index.keyframe_before(target);
        if keyframe_ts > self.position {
            while let Some(sample) = self.pull()? {
                if sample.keyframe && sample.timestamp + TS_EPSILON >= keyframe_ts {
                    self.lookahead = Some(sample);
                    break;
                }
                self.position = sample.timestamp;
            }
            self.decoder.reset();
        }
        Ok(())
    }

    fn pull(&mut self) -> Result<Option<Sample>, ReaderError> {
        if let Some(sample) = self.lookahead.take() {
            return Ok(Some(sample));
        }
        self.reader.next_sample()
    }

    fn accept(
        &mut self,
        index: usize,
        target: f64,
        interval: f64,
        image: DecodedImage,
    ) -> Option<FrameHandle> {
        if (image.pts - target).abs() > interval {
            tracing::warn!(
                index,
                expected = target,
                actual = image.pts,
                "timestamp mismatch, treating frame as a miss"
            );
            return None;
        }
        let handle = FrameHandle::new(image.data, image.width, image.height, image.format, image.pts);
        self.last_emitted = Some((target, handle.clone()));
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeError;
    use crate::frame::PixelFormat;
    use crate::reader::ContainerMetadata;
    use bytes::Bytes;
    use tokio::sync::mpsc::unbounded_channel;

    /// Scripted reader emitting fixed-rate samples. Byte 0 of each payload
    /// carries the keyframe flag so the mock decoder can honor reference
    /// dependencies.
    struct MockReader {
        metadata: ContainerMetadata,
        samples: Vec<Sample>,
        pos: usize,
        rewinds: usize,
    }

    impl MockReader {
        fn new(native_fps: f64, duration_ms: u64, keyframe_every: usize) -> Self {
            let count = (duration_ms as f64 / 1000.0 * native_fps).round() as usize;
            let samples = (0..count)
                .map(|i| Sample {
                    timestamp: i as f64 / native_fps,
                    keyframe: i % keyframe_every == 0,
                    data: Bytes::from(vec![u8::from(i % keyframe_every == 0)]),
                })
                .collect();
            Self {
                metadata: ContainerMetadata {
                    width: 64,
                    height: 48,
                    duration_ms,
                    codec: Codec::H264,
                    codec_private: Bytes::new(),
                },
                samples,
                pos: 0,
                rewinds: 0,
            }
        }
    }

    impl ContainerReader for MockReader {
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
            self.rewinds += 1;
            Ok(())
        }
    }

    /// Decoder that yields a 1x1 picture per sample, but only once it has
    /// seen a keyframe since the last reset. Optionally flips the shared
    /// batch cell after a number of decodes, to simulate mid-batch
    /// supersession.
    struct MockDecoder {
        has_reference: bool,
        decodes: Arc<AtomicU64>,
        supersede_after: Option<(u64, Arc<AtomicU64>, u64)>,
    }

    impl MockDecoder {
        fn new() -> Self {
            Self {
                has_reference: false,
                decodes: Arc::new(AtomicU64::new(0)),
                supersede_after: None,
            }
        }
    }

    impl VideoDecoder for MockDecoder {
        fn decode(
            &mut self,
            sample: &[u8],
            pts: f64,
        ) -> Result<Option<DecodedImage>, DecodeError> {
            let done = self.decodes.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, cell, value)) = &self.supersede_after {
                if done >= *after {
                    cell.store(*value, Ordering::SeqCst);
                }
            }
            if sample.first() == Some(&1) {
                self.has_reference = true;
            }
            if !self.has_reference {
                return Ok(None);
            }
            Ok(Some(DecodedImage {
                data: vec![0, 0, 0],
                format: PixelFormat::Rgb8,
                width: 1,
                height: 1,
                pts,
            }))
        }

        fn flush(&mut self) -> Result<Vec<DecodedImage>, DecodeError> {
            Ok(Vec::new())
        }

        fn reset(&mut self) {
            self.has_reference = false;
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn test_server(
        native_fps: f64,
        duration_ms: u64,
        keyframe_every: usize,
    ) -> (
        DecodeServer,
        tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
        Arc<AtomicU64>,
    ) {
        let mut reader = MockReader::new(native_fps, duration_ms, keyframe_every);
        let index = TimestampIndex::build(&mut reader, 30.0, |_| {}).unwrap();
        reader.rewind().unwrap();
        reader.rewinds = 0;
        let (events, rx) = unbounded_channel();
        let cell = Arc::new(AtomicU64::new(0));
        let server = DecodeServer::with_parts(
            Box::new(reader),
            Box::new(MockDecoder::new()),
            index,
            7,
            events,
            cell.clone(),
        );
        (server, rx, cell)
    }

    #[test]
    fn test_decode_at_hits_target_timestamp() {
        let (mut server, _rx, _cell) = test_server(30.0, 5_000, 30);
        let target = server.index.lookup(42).unwrap();
        let handle = server.decode_at(42).unwrap().unwrap();
        assert!((handle.pts() - target).abs() < 1e-9);
    }

    #[test]
    fn test_decode_at_out_of_range_is_miss() {
        let (mut server, _rx, _cell) = test_server(30.0, 1_000, 30);
        let len = server.index.len();
        assert!(server.decode_at(len).unwrap().is_none());
        assert!(server.decode_at(len + 100).unwrap().is_none());
    }

    #[test]
    fn test_backward_seek_rewinds_and_decodes() {
        let (mut server, _rx, _cell) = test_server(30.0, 10_000, 30);
        let _ = server.decode_at(200).unwrap().unwrap();
        let handle = server.decode_at(10).unwrap().unwrap();
        let target = server.index.lookup(10).unwrap();
        assert!((handle.pts() - target).abs() < 1e-9);
    }

    #[test]
    fn test_forward_seek_skips_without_decoding() {
        let (mut server, _rx, _cell) = test_server(30.0, 20_000, 30);
        let decoder = MockDecoder::new();
        let decodes = decoder.decodes.clone();
        server.decoder = Box::new(decoder);

        let _ = server.decode_at(0).unwrap().unwrap();
        let before = decodes.load(Ordering::SeqCst);
        let _ = server.decode_at(500).unwrap().unwrap();
        let after = decodes.load(Ordering::SeqCst);
        // Index 500 sits at most one keyframe interval into its group; the
        // 470-odd skipped samples must not have been decoded.
        assert!(after - before <= 31, "decoded {} samples", after - before);
    }

    #[test]
    fn test_sequential_decode_serves_every_frame() {
        let (mut server, _rx, _cell) = test_server(60.0, 5_000, 60);
        for i in 0..60 {
            let handle = server.decode_at(i).unwrap();
            assert!(handle.is_some(), "frame {i} missing");
        }
    }

    #[test]
    fn test_duplicate_table_entries_share_picture() {
        // 10 fps native at 30 fps target: consecutive indices map to the
        // same sample timestamp.
        let (mut server, _rx, _cell) = test_server(10.0, 2_000, 10);
        let a = server.decode_at(1).unwrap().unwrap();
        let b = server.decode_at(2).unwrap().unwrap();
        assert_eq!(a.pts(), b.pts());
    }

    #[test]
    fn test_batch_emits_ordered_and_completes() {
        let (mut server, mut rx, cell) = test_server(30.0, 5_000, 30);
        cell.store(9, Ordering::SeqCst);
        server.serve_batch(10, 20, 9).unwrap();

        let mut seen = Vec::new();
        let mut last_percent = 0.0f32;
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::BatchFrame {
                request_id,
                index,
                handle,
                percent,
                is_complete,
                ..
            } = event
            {
                assert_eq!(request_id, 9);
                assert!(handle.is_some());
                assert!(percent >= last_percent);
                last_percent = percent;
                seen.push((index, is_complete));
            }
        }
        assert_eq!(
            seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            (10..20).collect::<Vec<_>>()
        );
        assert!(seen.last().unwrap().1, "final frame must be marked complete");
        assert!(seen[..seen.len() - 1].iter().all(|(_, c)| !c));
    }

    #[test]
    fn test_batch_stops_when_superseded() {
        let (mut server, mut rx, cell) = test_server(30.0, 10_000, 30);
        cell.store(3, Ordering::SeqCst);
        // Flip the cell to another id after a few decodes.
        server.decoder = Box::new(MockDecoder {
            has_reference: false,
            decodes: Arc::new(AtomicU64::new(0)),
            supersede_after: Some((5, cell.clone(), 4)),
        });

        server.serve_batch(0, 100, 3).unwrap();

        let mut emitted = 0;
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::BatchFrame { is_complete, .. } = event {
                assert!(!is_complete);
                emitted += 1;
            }
        }
        assert!(emitted < 100, "superseded batch must stop early");
    }

    #[test]
    fn test_batch_for_stale_id_emits_nothing() {
        let (mut server, mut rx, cell) = test_server(30.0, 2_000, 30);
        cell.store(8, Ordering::SeqCst);
        server.serve_batch(0, 10, 7).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stream_gap_yields_miss_not_error() {
        // Index built from the full stream, then the middle second of
        // samples disappears before decoding.
        let mut reader = MockReader::new(30.0, 3_000, 30);
        let index = TimestampIndex::build(&mut reader, 30.0, |_| {}).unwrap();
        reader.rewind().unwrap();
        reader.samples.retain(|s| !(1.0..2.0).contains(&s.timestamp));

        let (events, _rx) = unbounded_channel();
        let cell = Arc::new(AtomicU64::new(0));
        let mut server = DecodeServer::with_parts(
            Box::new(reader),
            Box::new(MockDecoder::new()),
            index,
            1,
            events,
            cell,
        );

        // A frame in the vanished region is a miss, not a fatal error.
        assert!(server.decode_at(45).unwrap().is_none());
        // Frames after the gap still decode.
        assert!(server.decode_at(75).unwrap().is_some());
    }

    #[test]
    fn test_run_answers_get_frame_and_shuts_down() {
        let (server, mut rx, _cell) = test_server(30.0, 2_000, 30);
        let (tx, requests) = mpsc::channel();
        tx.send(StreamRequest::GetFrame { index: 5 }).unwrap();
        tx.send(StreamRequest::Cleanup).unwrap();

        let join = std::thread::spawn(move || {
            let mut server = server;
            server.run(requests);
        });
        join.join().unwrap();

        match rx.try_recv().unwrap() {
            StreamEvent::Frame {
                session,
                index,
                handle,
            } => {
                assert_eq!(session, 7);
                assert_eq!(index, 5);
                assert!(handle.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
