//! # Frameline Core
//!
//! Frame streaming and playback synchronization engine. Turns an in-memory
//! MKV/WebM container into an indexed sequence of decoded frames, served
//! through an LRU-cached, prefetching client, with a playback clock slaved
//! to the audio hardware clock.

// ============================================================================
// Container / Index
// ============================================================================
pub mod index;
pub mod reader;

// ============================================================================
// Decoding
// ============================================================================
pub mod decode;
pub mod frame;
mod server;

// ============================================================================
// Streaming
// ============================================================================
pub mod client;
pub mod protocol;
pub mod session;

// ============================================================================
// Playback
// ============================================================================
pub mod clock;

pub use client::{FrameStream, StreamStats};
pub use clock::{AudioOutput, EndAction, PlaybackClock, PlaybackStatus};
pub use decode::{Codec, DecodeError, VideoDecoder};
pub use frame::{FrameHandle, PixelFormat, ReleaseProbe};
pub use index::TimestampIndex;
pub use protocol::{StreamError, StreamMetadata};
pub use reader::{ContainerReader, MkvReader, OpenError, ReaderError, Sample};
pub use session::{StreamConfig, VideoStream};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
