//! Decoded frame handles
//!
//! A `FrameHandle` owns (a share of) a decoded image. Handles are cheap to
//! clone; the pixel buffer is released exactly once, when the last un-closed
//! handle is closed or dropped. `close()` is idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pixel format of decoded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit packed RGB (post-conversion from decoder YUV)
    Rgb8,
    /// 8-bit packed RGBA
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Counts releases of the underlying frame resources.
///
/// Attach one probe to many handles to verify that every buffer the cache
/// evicted (or the session drained) was released, and released once.
#[derive(Debug, Default)]
pub struct ReleaseProbe {
    released: AtomicU64,
}

impl ReleaseProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }
}

/// The shared pixel buffer behind a handle. Dropping the last `Arc` to this
/// is the release.
#[derive(Debug)]
struct FrameResource {
    data: Vec<u8>,
    probe: Option<Arc<ReleaseProbe>>,
}

impl Drop for FrameResource {
    fn drop(&mut self) {
        if let Some(probe) = &self.probe {
            probe.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Handle over one decoded video frame.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Presentation timestamp in seconds
    pts: f64,
    resource: Option<Arc<FrameResource>>,
}

impl FrameHandle {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, pts: f64) -> Self {
        Self {
            width,
            height,
            format,
            pts,
            resource: Some(Arc::new(FrameResource { data, probe: None })),
        }
    }

    /// Like `new`, but notifies `probe` when the pixel buffer is released.
    pub fn with_probe(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        pts: f64,
        probe: Arc<ReleaseProbe>,
    ) -> Self {
        Self {
            width,
            height,
            format,
            pts,
            resource: Some(Arc::new(FrameResource {
                data,
                probe: Some(probe),
            })),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Presentation timestamp in seconds
    pub fn pts(&self) -> f64 {
        self.pts
    }

    /// Pixel data, or `None` once this handle has been closed.
    pub fn data(&self) -> Option<&[u8]> {
        self.resource.as_ref().map(|r| r.data.as_slice())
    }

    pub fn is_closed(&self) -> bool {
        self.resource.is_none()
    }

    /// Give up this handle's share of the pixel buffer. Safe to call more
    /// than once; the buffer itself is freed when the last share goes.
    pub fn close(&mut self) {
        self.resource = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle(probe: Arc<ReleaseProbe>) -> FrameHandle {
        FrameHandle::with_probe(vec![0u8; 12], 2, 2, PixelFormat::Rgb8, 0.0, probe)
    }

    #[test]
    fn test_close_is_idempotent() {
        let probe = ReleaseProbe::new();
        let mut h = test_handle(probe.clone());
        h.close();
        h.close();
        h.close();
        assert!(h.is_closed());
        assert_eq!(probe.released(), 1);
    }

    #[test]
    fn test_release_runs_exactly_once_across_clones() {
        let probe = ReleaseProbe::new();
        let h = test_handle(probe.clone());
        let mut a = h.clone();
        let b = h.clone();

        a.close();
        assert_eq!(probe.released(), 0, "other clones still hold the buffer");
        drop(b);
        assert_eq!(probe.released(), 0);
        drop(h);
        assert_eq!(probe.released(), 1);
    }

    #[test]
    fn test_data_unavailable_after_close() {
        let probe = ReleaseProbe::new();
        let mut h = test_handle(probe);
        assert!(h.data().is_some());
        h.close();
        assert!(h.data().is_none());
    }

    #[test]
    fn test_drop_releases() {
        let probe = ReleaseProbe::new();
        {
            let _h = test_handle(probe.clone());
        }
        assert_eq!(probe.released(), 1);
    }
}
