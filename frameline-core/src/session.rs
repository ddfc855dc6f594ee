//! Stream sessions
//!
//! `VideoStream::open` wires the whole engine together: it spawns the
//! decode thread, waits out indexing, and hands back a ready client plus
//! the stream metadata. `cleanup` (or drop) releases every cached frame and
//! joins the thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::unbounded_channel;

use crate::client::{FrameStream, StreamStats};
use crate::frame::FrameHandle;
use crate::protocol::{OpenRequest, StreamError, StreamEvent, StreamMetadata, StreamRequest};
use crate::reader::OpenError;
use crate::server;

pub const DEFAULT_TARGET_FPS: f64 = 30.0;
pub const DEFAULT_BUFFER_DURATION_SECS: f64 = 5.0;
pub const DEFAULT_CACHE_CAPACITY: usize = 2048;
pub const DEFAULT_SCHEDULE_LOOKAHEAD_SECS: f64 = 0.1;

/// Tuning knobs for one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Frame-index sampling rate of the timestamp table
    pub target_fps: f64,
    /// How far ahead of the playhead to keep frames decoded, in seconds
    pub buffer_duration_secs: f64,
    /// Frame cache capacity, in frames
    pub cache_capacity: usize,
    /// Audio schedule lookahead used by the playback clock, in seconds
    pub schedule_lookahead_secs: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            buffer_duration_secs: DEFAULT_BUFFER_DURATION_SECS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            schedule_lookahead_secs: DEFAULT_SCHEDULE_LOOKAHEAD_SECS,
        }
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// One open container with its decode thread and streaming client.
pub struct VideoStream {
    stream: FrameStream,
    metadata: StreamMetadata,
    requests: mpsc::Sender<StreamRequest>,
    worker: Option<thread::JoinHandle<()>>,
    session: u64,
}

impl VideoStream {
    pub async fn open(source: Bytes, config: StreamConfig) -> Result<Self, OpenError> {
        Self::open_with_progress(source, config, |_| {}).await
    }

    /// Open an in-memory container. `progress` receives indexing progress
    /// in percent; the future resolves once the stream is fully indexed
    /// and ready to serve frames.
    pub async fn open_with_progress(
        source: Bytes,
        config: StreamConfig,
        mut progress: impl FnMut(f32),
    ) -> Result<Self, OpenError> {
        let session = NEXT_SESSION.fetch_add(1, Ordering::SeqCst);
        let (req_tx, req_rx) = mpsc::channel();
        let (event_tx, mut event_rx) = unbounded_channel();
        let active_batch = Arc::new(AtomicU64::new(0));

        let open = OpenRequest {
            source,
            target_fps: config.target_fps,
            session,
        };
        let worker_cell = active_batch.clone();
        let worker = thread::spawn(move || server::run_worker(open, req_rx, event_tx, worker_cell));

        let metadata = loop {
            match event_rx.recv().await {
                Some(StreamEvent::IndexProgress { percent, .. }) => progress(percent),
                Some(StreamEvent::Metadata { metadata, .. }) => break metadata,
                Some(StreamEvent::Fatal { error, .. }) => {
                    let _ = worker.join();
                    return Err(match error {
                        StreamError::Open(e) => e,
                        other => OpenError::Malformed(other.to_string()),
                    });
                }
                // No frames can precede the metadata event.
                Some(_) => {}
                None => {
                    let _ = worker.join();
                    return Err(OpenError::Malformed(
                        "decode context exited during open".into(),
                    ));
                }
            }
        };

        let stream = FrameStream::new(
            config,
            metadata.frame_count,
            session,
            req_tx.clone(),
            active_batch,
            event_rx,
        );
        tracing::info!(
            session,
            frames = metadata.frame_count,
            duration_ms = metadata.duration_ms,
            "stream open"
        );

        Ok(Self {
            stream,
            metadata,
            requests: req_tx,
            worker: Some(worker),
            session,
        })
    }

    /// Resolve the frame shown at `index`. This is what a renderer calls
    /// per displayed frame; `prefetch` keeps the read-ahead window warm.
    pub async fn get_frame_at_index(
        &self,
        index: usize,
        prefetch: bool,
    ) -> Result<Option<FrameHandle>, StreamError> {
        self.stream.get_frame(index, prefetch).await
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    pub fn frame_count(&self) -> usize {
        self.metadata.frame_count
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    /// A shareable client handle, e.g. for a renderer on another task.
    pub fn client(&self) -> FrameStream {
        self.stream.clone()
    }

    /// Release every cached frame, stop the decode thread, and join it.
    pub fn cleanup(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        tracing::debug!(session = self.session, "cleaning up stream");
        // Marks the session closed and zeroes the batch cell, so a server
        // stuck in a long batch bails out at the next frame boundary.
        self.stream.shutdown();
        let _ = self.requests.send(StreamRequest::Cleanup);
        if worker.join().is_err() {
            tracing::warn!(session = self.session, "decode thread panicked");
        }
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.teardown();
    }
}
