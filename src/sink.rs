//! Frame consumers.

use bytes::Bytes;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Anything that accepts decoded frames at the end of the pipeline, such as
/// a preview window or a virtual camera device.
pub trait VideoSink: Send + Sync {
    fn push_frame(&self, frame: Bytes);
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// Counts frames and drops them. Stands in when no output device is wired
/// up, and doubles as the sink for headless runs.
pub struct NullSink {
    width: u32,
    height: u32,
    received: AtomicU64,
}

impl NullSink {
    pub fn new(width: u32, height: u32) -> Self {
        NullSink {
            width,
            height,
            received: AtomicU64::new(0),
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl VideoSink for NullSink {
    fn push_frame(&self, frame: Bytes) {
        let n = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 300 == 0 {
            debug!("sink consumed {} frames, last {} bytes", n, frame.len());
        }
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_counts_frames() {
        let sink = NullSink::new(1280, 720);
        assert_eq!(sink.frames_received(), 0);

        sink.push_frame(Bytes::from_static(b"frame"));
        sink.push_frame(Bytes::from_static(b"frame"));
        assert_eq!(sink.frames_received(), 2);
        assert_eq!((sink.width(), sink.height()), (1280, 720));
    }
}
