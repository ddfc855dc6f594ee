//! Decode boundary protocol
//!
//! Typed messages crossing the isolation boundary between the streaming
//! client and the decode server thread. Every event carries the session id
//! of the opened container so late arrivals from a dead session are
//! identifiable and droppable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::FrameHandle;
use crate::reader::OpenError;

/// Errors crossing the decode boundary. Per-frame misses are not errors
/// (they travel as `None` handles); these are terminal for the session.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("container read failed: {0}")]
    Reader(String),
    #[error("decode context failed: {0}")]
    Decode(String),
    #[error("stream session closed")]
    SessionClosed,
}

/// Parameters handed to the decode thread at spawn.
pub struct OpenRequest {
    pub source: Bytes,
    pub target_fps: f64,
    pub session: u64,
}

/// Requests into the decode server.
#[derive(Debug)]
pub enum StreamRequest {
    GetFrame {
        index: usize,
    },
    /// Decode `start..end` in order under `request_id`.
    GetBatch {
        start: usize,
        end: usize,
        request_id: u64,
    },
    /// Advisory; actual cancellation is observed through the shared
    /// active-batch cell. Unknown or finished ids are a no-op.
    CancelBatch {
        request_id: u64,
    },
    Cleanup,
}

/// Events out of the decode server.
#[derive(Debug)]
pub enum StreamEvent {
    Metadata {
        session: u64,
        metadata: StreamMetadata,
    },
    IndexProgress {
        session: u64,
        percent: f32,
    },
    /// Answer to `GetFrame`. `None` for out-of-range or decode miss.
    Frame {
        session: u64,
        index: usize,
        handle: Option<FrameHandle>,
    },
    /// One frame of a batch, in order.
    BatchFrame {
        session: u64,
        request_id: u64,
        index: usize,
        handle: Option<FrameHandle>,
        percent: f32,
        is_complete: bool,
    },
    Fatal {
        session: u64,
        error: StreamError,
    },
}

/// What the session layer reports once a container is open and indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    pub duration_ms: u64,
    pub frame_count: usize,
}
