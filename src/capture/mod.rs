//! Frame capture sources
//!
//! Provides the capture abstraction the producer pipeline pulls frames
//! from, plus the built-in backends: a paced synthetic test pattern and a
//! worker that drives a blocking grabber on its own thread.

mod pattern;
pub use pattern::TestPatternSource;

mod worker;
pub use worker::CaptureWorker;

use crate::config::{CaptureConfig, VideoConfig};
use crate::frame::{PixelFormat, VideoFrame};
use std::fmt;
use std::time::Duration;

/// Errors from a capture backend.
#[derive(Debug)]
pub enum CaptureError {
    /// Backend could not be created or refused a request.
    Backend(String),
    /// Backend lost its device and will not recover.
    Disconnected(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Backend(msg) => write!(f, "capture backend error: {}", msg),
            CaptureError::Disconnected(msg) => write!(f, "capture device disconnected: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Pull-based frame source for the producer pipeline.
///
/// Implementations may block up to `timeout` waiting for a frame. `Ok(None)`
/// means nothing arrived in time; the pipeline decides whether to retry or
/// synthesize a filler frame.
pub trait FrameSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<VideoFrame>, CaptureError>;
}

/// Build the configured capture source.
pub fn create_source(
    capture: &CaptureConfig,
    video: &VideoConfig,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    let format = PixelFormat::parse(&video.format)
        .ok_or_else(|| CaptureError::Backend(format!("unsupported pixel format: {}", video.format)))?;

    match capture.source.as_str() {
        "pattern" => {
            let source =
                TestPatternSource::new(video.width, video.height, video.fps, format, capture.device);
            if capture.threaded {
                // Run the pattern behind the worker thread so the threaded
                // path is the same one a real device backend would take.
                Ok(Box::new(CaptureWorker::spawn(
                    Box::new(source),
                    capture.queue_capacity,
                )))
            } else {
                Ok(Box::new(source))
            }
        }
        other => Err(CaptureError::Backend(format!(
            "unknown capture source: {}",
            other
        ))),
    }
}
