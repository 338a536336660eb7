//! Synthetic test pattern source
//!
//! Generates a moving gradient at a fixed frame rate. Used for soak tests
//! and demos where no real capture device is available. The `device` seed
//! shifts the pattern colors so two senders are visually distinct.

use super::{CaptureError, FrameSource};
use crate::frame::{PixelFormat, TimeBase, VideoFrame};
use std::thread;
use std::time::{Duration, Instant};

/// Paced synthetic frame source.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    device: u32,
    interval: Duration,
    next_due: Instant,
    produced: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32, format: PixelFormat, device: u32) -> Self {
        Self {
            width,
            height,
            format,
            device,
            interval: TimeBase::per_frame(fps).interval(),
            next_due: Instant::now(),
            produced: 0,
        }
    }

    /// Frames generated so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn render(&self) -> Vec<u8> {
        let phase = (self.produced as u32).wrapping_mul(3);
        let seed = self.device.wrapping_mul(37);
        let mut data =
            Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                let r = (x.wrapping_add(phase) & 0xFF) as u8;
                let g = (y.wrapping_add(phase / 2).wrapping_add(seed) & 0xFF) as u8;
                let b = ((x ^ y) & 0xFF) as u8;
                match self.format {
                    PixelFormat::Rgb24 => data.extend_from_slice(&[r, g, b]),
                    PixelFormat::Bgr24 => data.extend_from_slice(&[b, g, r]),
                }
            }
        }
        data
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<VideoFrame>, CaptureError> {
        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                // Not due within the caller's budget.
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }

        let frame = VideoFrame::captured(self.width, self.height, self.format, self.render());
        self.produced += 1;

        // Keep cadence from the previous due time, but never schedule into
        // the past after a slow caller.
        let now = Instant::now();
        self.next_due += self.interval;
        if self.next_due < now {
            self.next_due = now + self.interval;
        }

        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_produces_valid_frames() {
        let mut source = TestPatternSource::new(32, 24, 1000, PixelFormat::Rgb24, 0);
        let frame = source
            .next_frame(Duration::from_millis(50))
            .unwrap()
            .expect("first frame is due immediately");
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 24);
        assert!(frame.payload_valid());
        assert!(!frame.filler);
        assert_eq!(source.produced(), 1);
    }

    #[test]
    fn test_pattern_moves_between_frames() {
        let mut source = TestPatternSource::new(16, 16, 1000, PixelFormat::Rgb24, 0);
        let a = source.next_frame(Duration::from_millis(50)).unwrap().unwrap();
        let b = source.next_frame(Duration::from_millis(50)).unwrap().unwrap();
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_short_timeout_returns_none_when_not_due() {
        // 1 fps: after the first frame the next is due a second later.
        let mut source = TestPatternSource::new(8, 8, 1, PixelFormat::Rgb24, 0);
        source.next_frame(Duration::from_millis(50)).unwrap().unwrap();
        let got = source.next_frame(Duration::from_millis(5)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_device_seed_changes_pattern() {
        let mut a = TestPatternSource::new(8, 8, 1000, PixelFormat::Rgb24, 0);
        let mut b = TestPatternSource::new(8, 8, 1000, PixelFormat::Rgb24, 1);
        let fa = a.next_frame(Duration::from_millis(50)).unwrap().unwrap();
        let fb = b.next_frame(Duration::from_millis(50)).unwrap().unwrap();
        assert_ne!(fa.data, fb.data);
    }
}
