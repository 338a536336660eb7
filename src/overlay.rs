//! Wall-clock timestamp overlay
//!
//! Draws the current local time into a frame's pixel data using a small
//! built-in 5x7 bitmap font. The sender stamps frames before they enter the
//! outbound queue, the receiver stamps them again after decode so the two
//! clocks can be compared side by side on screen.
//!
//! Overlay failures are reported to the caller but are never fatal to a
//! pipeline. A frame that cannot be annotated is still sent or rendered.

use crate::frame::{PixelFormat, VideoFrame};
use std::fmt;

/// Glyph cell width in pixels, excluding spacing.
const GLYPH_WIDTH: u32 = 5;
/// Glyph cell height in pixels.
const GLYPH_HEIGHT: u32 = 7;
/// Horizontal spacing between glyph cells.
const GLYPH_SPACING: u32 = 1;
/// Distance from the frame edge to the text, in pixels.
const MARGIN: u32 = 8;

/// Timestamp format rendered into the frame.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Errors from annotating a frame in place.
#[derive(Debug)]
pub enum OverlayError {
    /// Frame dimensions cannot fit the rendered text plus margins.
    FrameTooSmall { width: u32, height: u32 },
    /// Frame payload length does not match its declared geometry.
    BadPayload,
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayError::FrameTooSmall { width, height } => {
                write!(f, "frame {}x{} too small for overlay text", width, height)
            }
            OverlayError::BadPayload => write!(f, "frame payload does not match geometry"),
        }
    }
}

impl std::error::Error for OverlayError {}

/// Mutates frames in place before they are queued or rendered.
pub trait FrameAnnotator: Send {
    /// Draw the annotation into the frame's pixel data.
    fn annotate(&mut self, frame: &mut VideoFrame) -> Result<(), OverlayError>;
}

/// Frame corner the text is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayCorner {
    /// Sender-side placement.
    TopLeft,
    /// Receiver-side placement, kept clear of the sender's stamp.
    BottomLeft,
}

/// Draws the current wall-clock time in green into one corner of a frame.
pub struct TimestampOverlay {
    corner: OverlayCorner,
    scale: u32,
}

impl TimestampOverlay {
    pub fn new(corner: OverlayCorner) -> Self {
        Self { corner, scale: 2 }
    }

    /// Override the integer pixel scale of the 5x7 font (default 2).
    pub fn with_scale(mut self, scale: u32) -> Self {
        self.scale = scale.max(1);
        self
    }

    fn text_size(&self, text: &str) -> (u32, u32) {
        let cols = text.chars().count() as u32;
        let width = cols * (GLYPH_WIDTH + GLYPH_SPACING) * self.scale;
        let height = GLYPH_HEIGHT * self.scale;
        (width, height)
    }
}

impl FrameAnnotator for TimestampOverlay {
    fn annotate(&mut self, frame: &mut VideoFrame) -> Result<(), OverlayError> {
        let text = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let (text_w, text_h) = self.text_size(&text);

        if frame.width < text_w + 2 * MARGIN || frame.height < text_h + 2 * MARGIN {
            return Err(OverlayError::FrameTooSmall {
                width: frame.width,
                height: frame.height,
            });
        }
        if !frame.payload_valid() {
            return Err(OverlayError::BadPayload);
        }

        let x0 = MARGIN;
        let y0 = match self.corner {
            OverlayCorner::TopLeft => MARGIN,
            OverlayCorner::BottomLeft => frame.height - MARGIN - text_h,
        };

        // Green is symmetric across RGB/BGR channel orders, but map it
        // through the frame format anyway so other colors stay correct.
        draw_text(frame, &text, x0, y0, self.scale, [0x20, 0xE0, 0x20]);
        Ok(())
    }
}

/// Render `text` into the frame at (x0, y0). Callers must have verified the
/// text fits inside the frame bounds.
fn draw_text(frame: &mut VideoFrame, text: &str, x0: u32, y0: u32, scale: u32, rgb: [u8; 3]) {
    let pixel = match frame.format {
        PixelFormat::Rgb24 => rgb,
        PixelFormat::Bgr24 => [rgb[2], rgb[1], rgb[0]],
    };
    let stride = frame.width as usize * 3;
    let mut pen_x = x0;
    for ch in text.chars() {
        let rows = glyph(ch);
        for (gy, row) in rows.iter().enumerate() {
            for gx in 0..GLYPH_WIDTH {
                if row & (0x10 >> gx) == 0 {
                    continue;
                }
                // Scale each font pixel up to a scale x scale block.
                for sy in 0..scale {
                    for sx in 0..scale {
                        let px = (pen_x + gx * scale + sx) as usize;
                        let py = (y0 + gy as u32 * scale + sy) as usize;
                        let idx = py * stride + px * 3;
                        frame.data[idx..idx + 3].copy_from_slice(&pixel);
                    }
                }
            }
        }
        pen_x += (GLYPH_WIDTH + GLYPH_SPACING) * scale;
    }
}

/// 5x7 bitmap rows for the characters the timestamp format can produce.
/// Bit 4 is the leftmost column. Unknown characters render as blank cells.
fn glyph(ch: char) -> [u8; 7] {
    match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        _ => [0x00; 7],
    }
}
