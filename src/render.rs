//! Frame sinks
//!
//! Terminal consumers for decoded frames. The receiver pipeline hands every
//! frame to a [`FrameSink`]; what happens next (counting, PNG persistence)
//! is the sink's business. Sink errors are surfaced to the pipeline, which
//! treats them as per-frame failures rather than fatal conditions.

use crate::frame::VideoFrame;
use image::ImageEncoder;
use log::debug;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Errors from delivering a frame to a sink.
#[derive(Debug)]
pub enum SinkError {
    /// Filesystem problem while persisting a frame.
    Io(std::io::Error),
    /// Pixel data could not be encoded.
    Encode(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "sink I/O error: {}", e),
            SinkError::Encode(msg) => write!(f, "frame encode error: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e)
    }
}

/// Receives decoded frames from the consumer pipeline.
pub trait FrameSink: Send {
    /// Deliver one frame. Implementations must not block for long periods.
    fn accept_frame(&mut self, frame: &VideoFrame) -> Result<(), SinkError>;
}

/// Counts frames and drops them. Used when no persistence is configured.
#[derive(Debug, Default)]
pub struct NullSink {
    accepted: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

impl FrameSink for NullSink {
    fn accept_frame(&mut self, _frame: &VideoFrame) -> Result<(), SinkError> {
        self.accepted += 1;
        Ok(())
    }
}

/// Writes each frame as a numbered PNG into a directory.
pub struct PngDirSink {
    dir: PathBuf,
    written: u64,
}

impl PngDirSink {
    /// Create the sink, creating the target directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, written: 0 })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for PngDirSink {
    fn accept_frame(&mut self, frame: &VideoFrame) -> Result<(), SinkError> {
        // PNG rows are RGB; convert BGR frames before encoding.
        let rgb = frame.clone().into_rgb();
        if !rgb.payload_valid() {
            return Err(SinkError::Encode(format!(
                "payload length {} does not match {}x{}",
                rgb.data.len(),
                rgb.width,
                rgb.height
            )));
        }

        let path = self.dir.join(format!("frame_{:06}.png", self.written + 1));
        let file = File::create(&path)?;
        let writer = BufWriter::new(file);
        let encoder = image::codecs::png::PngEncoder::new(writer);
        encoder
            .write_image(&rgb.data, rgb.width, rgb.height, image::ColorType::Rgb8)
            .map_err(|e| SinkError::Encode(e.to_string()))?;

        self.written += 1;
        debug!("Saved frame pts={} to {}", frame.pts, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelFormat, TimeBase, VideoFrame};

    fn sample_frame(pts: u64) -> VideoFrame {
        let mut frame = VideoFrame::filler(32, 24, PixelFormat::Rgb24);
        frame.stamp(pts, TimeBase::per_frame(30));
        frame.data[0] = 0xFF;
        frame
    }

    #[test]
    fn test_null_sink_counts_frames() {
        let mut sink = NullSink::new();
        sink.accept_frame(&sample_frame(1)).unwrap();
        sink.accept_frame(&sample_frame(2)).unwrap();
        assert_eq!(sink.accepted(), 2);
    }

    #[test]
    fn test_png_sink_writes_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PngDirSink::new(dir.path()).unwrap();
        sink.accept_frame(&sample_frame(1)).unwrap();
        sink.accept_frame(&sample_frame(2)).unwrap();
        assert_eq!(sink.written(), 2);
        assert!(dir.path().join("frame_000001.png").is_file());
        assert!(dir.path().join("frame_000002.png").is_file());
    }

    #[test]
    fn test_png_sink_rejects_short_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PngDirSink::new(dir.path()).unwrap();
        let mut frame = sample_frame(1);
        frame.data.truncate(5);
        assert!(matches!(
            sink.accept_frame(&frame),
            Err(SinkError::Encode(_))
        ));
        assert_eq!(sink.written(), 0);
    }

    #[test]
    fn test_png_sink_converts_bgr_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PngDirSink::new(dir.path()).unwrap();
        let frame = VideoFrame::filler(16, 16, PixelFormat::Bgr24);
        sink.accept_frame(&frame).unwrap();
        assert_eq!(sink.written(), 1);
    }
}
