//! Video frame data model
//!
//! Represents a single video frame travelling through the pipeline,
//! with the presentation stamp and time-base the transport requires.

pub mod queue;

pub use queue::FrameQueue;

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Pixel layout of a raw frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 3 bytes per pixel, red first
    Rgb24,
    /// 3 bytes per pixel, blue first (camera-native order)
    Bgr24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        3
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
        }
    }

    /// Parse a format name from configuration or a negotiated payload
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rgb24" | "rgb" => Some(PixelFormat::Rgb24),
            "bgr24" | "bgr" => Some(PixelFormat::Bgr24),
            _ => None,
        }
    }

    /// Single-byte wire code
    pub fn to_wire(&self) -> u8 {
        match self {
            PixelFormat::Rgb24 => 0,
            PixelFormat::Bgr24 => 1,
        }
    }

    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(PixelFormat::Rgb24),
            1 => Some(PixelFormat::Bgr24),
            _ => None,
        }
    }
}

/// Presentation time-base (frame interval reciprocal, e.g. 1/30s)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    /// Time-base for a fixed frame rate (1/fps)
    pub fn per_frame(fps: u32) -> Self {
        Self { num: 1, den: fps.max(1) }
    }

    /// Duration of one pts step
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.num as f64 / self.den as f64)
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Frame flag: payload was synthesized because capture had nothing to offer
pub const FLAG_FILLER: u8 = 0b0000_0001;

/// A single video frame
///
/// Ownership transfers on enqueue/dequeue; no stage shares a frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel layout of `data`
    pub format: PixelFormat,

    /// Raw pixel data
    pub data: Vec<u8>,

    /// Monotonically increasing presentation stamp
    pub pts: u64,

    /// Presentation time-base
    pub time_base: TimeBase,

    /// Capture wall-clock time (microseconds since the Unix epoch)
    pub capture_ts_us: u64,

    /// True if this frame was synthesized rather than captured
    pub filler: bool,
}

impl VideoFrame {
    /// Wrap freshly captured pixel data; pts/time-base are stamped later
    /// by the producer pipeline.
    pub fn captured(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
            pts: 0,
            time_base: TimeBase::per_frame(30),
            capture_ts_us: wall_clock_micros(),
            filler: false,
        }
    }

    /// Synthesize a neutral-color (black) filler frame
    pub fn filler(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0u8; len],
            pts: 0,
            time_base: TimeBase::per_frame(30),
            capture_ts_us: wall_clock_micros(),
            filler: true,
        }
    }

    /// Payload length implied by geometry and format
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// True when the payload matches the declared geometry
    pub fn payload_valid(&self) -> bool {
        !self.data.is_empty() && self.data.len() == self.expected_len()
    }

    /// Stamp presentation metadata (producer pipeline, once per frame)
    pub fn stamp(&mut self, pts: u64, time_base: TimeBase) {
        self.pts = pts;
        self.time_base = time_base;
    }

    /// Wire flag byte
    pub fn flags(&self) -> u8 {
        if self.filler {
            FLAG_FILLER
        } else {
            0
        }
    }

    /// Convert to the renderer's RGB layout, swapping channels in place
    /// when the source was BGR. No-op for frames already in RGB.
    pub fn into_rgb(mut self) -> Self {
        if self.format == PixelFormat::Bgr24 {
            for px in self.data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            self.format = PixelFormat::Rgb24;
        }
        self
    }
}

impl fmt::Display for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({}x{} {}, {} bytes, pts={}{})",
            self.width,
            self.height,
            self.format.as_str(),
            self.data.len(),
            self.pts,
            if self.filler { ", filler" } else { "" }
        )
    }
}

/// Current wall clock in microseconds since the Unix epoch
pub fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
