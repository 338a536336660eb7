//! Media wire format
//!
//! Length-prefixed packet framing for the media connection:
//!
//! - 4-byte big-endian length (kind byte plus body)
//! - 1-byte packet kind
//! - kind-specific body
//!
//! Frame packets carry a fixed 30-byte header (pts, time-base, capture
//! timestamp, geometry, format, flags) followed by the raw pixel payload.
//! The decoder is stateful and tolerates arbitrary read fragmentation.

use crate::frame::{PixelFormat, TimeBase, VideoFrame, FLAG_FILLER};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Maximum media packet body size (kind + body). Covers raw 4K RGB frames.
pub const MAX_MEDIA_PACKET: usize = 32 * 1024 * 1024;

/// Frame packet header length in bytes.
const FRAME_HEADER_LEN: usize = 30;

const KIND_FRAME: u8 = 0x01;
const KIND_KEEPALIVE: u8 = 0x02;
const KIND_BYE: u8 = 0x03;

/// Errors from encoding or decoding media packets.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Declared length exceeds [`MAX_MEDIA_PACKET`].
    PacketTooLarge(usize),
    /// Declared length of zero (no kind byte).
    ZeroLength,
    /// Unrecognized packet kind byte.
    UnknownKind(u8),
    /// Frame packet body shorter than its fixed header.
    TruncatedHeader(usize),
    /// Frame geometry does not fit the wire header fields.
    GeometryOverflow { width: u32, height: u32 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::PacketTooLarge(size) => {
                write!(f, "media packet too large: {} bytes (max {})", size, MAX_MEDIA_PACKET)
            }
            WireError::ZeroLength => write!(f, "zero-length media packet"),
            WireError::UnknownKind(kind) => write!(f, "unknown media packet kind: {:#04x}", kind),
            WireError::TruncatedHeader(len) => {
                write!(f, "frame packet body too short for header: {} bytes", len)
            }
            WireError::GeometryOverflow { width, height } => {
                write!(f, "frame geometry {}x{} exceeds wire limits", width, height)
            }
        }
    }
}

impl std::error::Error for WireError {}

/// A decoded frame packet, still in wire terms.
///
/// Header fields are kept raw so the consumer can classify malformed
/// frames (unknown format, geometry mismatch) instead of losing them in
/// the decoder.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub pts: u64,
    pub tb_num: u32,
    pub tb_den: u32,
    pub capture_ts_us: u64,
    pub width: u16,
    pub height: u16,
    pub format: u8,
    pub flags: u8,
    pub payload: Bytes,
}

/// One packet off the media connection.
#[derive(Debug, Clone)]
pub enum MediaPacket {
    Frame(FramePacket),
    Keepalive,
    Bye,
}

/// Reasons a structurally valid frame packet cannot become a [`VideoFrame`].
#[derive(Debug, PartialEq, Eq)]
pub enum FrameDecodeError {
    EmptyPayload,
    UnknownFormat(u8),
    GeometryMismatch { expected: usize, actual: usize },
}

impl fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDecodeError::EmptyPayload => write!(f, "frame packet has empty payload"),
            FrameDecodeError::UnknownFormat(code) => {
                write!(f, "unknown pixel format code: {:#04x}", code)
            }
            FrameDecodeError::GeometryMismatch { expected, actual } => {
                write!(f, "payload length {} does not match geometry ({} expected)", actual, expected)
            }
        }
    }
}

impl std::error::Error for FrameDecodeError {}

impl TryFrom<FramePacket> for VideoFrame {
    type Error = FrameDecodeError;

    fn try_from(packet: FramePacket) -> Result<Self, Self::Error> {
        if packet.payload.is_empty() {
            return Err(FrameDecodeError::EmptyPayload);
        }
        let format = PixelFormat::from_wire(packet.format)
            .ok_or(FrameDecodeError::UnknownFormat(packet.format))?;
        let expected = packet.width as usize * packet.height as usize * format.bytes_per_pixel();
        if packet.payload.len() != expected {
            return Err(FrameDecodeError::GeometryMismatch {
                expected,
                actual: packet.payload.len(),
            });
        }
        Ok(VideoFrame {
            width: packet.width as u32,
            height: packet.height as u32,
            format,
            data: packet.payload.to_vec(),
            pts: packet.pts,
            // A zero time-base from a buggy peer must not break interval math.
            time_base: TimeBase {
                num: packet.tb_num.max(1),
                den: packet.tb_den.max(1),
            },
            capture_ts_us: packet.capture_ts_us,
            filler: packet.flags & FLAG_FILLER != 0,
        })
    }
}

/// Encode a frame packet ready for the socket.
pub fn encode_frame(frame: &VideoFrame) -> Result<Bytes, WireError> {
    if frame.width > u16::MAX as u32 || frame.height > u16::MAX as u32 {
        return Err(WireError::GeometryOverflow {
            width: frame.width,
            height: frame.height,
        });
    }
    let body_len = 1 + FRAME_HEADER_LEN + frame.data.len();
    if body_len > MAX_MEDIA_PACKET {
        return Err(WireError::PacketTooLarge(body_len));
    }

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(KIND_FRAME);
    buf.put_u64(frame.pts);
    buf.put_u32(frame.time_base.num);
    buf.put_u32(frame.time_base.den);
    buf.put_u64(frame.capture_ts_us);
    buf.put_u16(frame.width as u16);
    buf.put_u16(frame.height as u16);
    buf.put_u8(frame.format.to_wire());
    buf.put_u8(frame.flags());
    buf.put_slice(&frame.data);
    Ok(buf.freeze())
}

/// Encode a keepalive packet.
pub fn encode_keepalive() -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(1);
    buf.put_u8(KIND_KEEPALIVE);
    buf.freeze()
}

/// Encode the end-of-stream marker.
pub fn encode_bye() -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(1);
    buf.put_u8(KIND_BYE);
    buf.freeze()
}

/// Stateful media packet decoder.
#[derive(Debug, Default)]
pub struct MediaDecoder {
    buf: BytesMut,
}

impl MediaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to decode the next complete packet. `Ok(None)` means more bytes
    /// are needed. Errors are unrecoverable for the connection.
    pub fn next_packet(&mut self) -> Result<Option<MediaPacket>, WireError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        if body_len == 0 {
            return Err(WireError::ZeroLength);
        }
        if body_len > MAX_MEDIA_PACKET {
            return Err(WireError::PacketTooLarge(body_len));
        }
        if self.buf.len() < 4 + body_len {
            return Ok(None);
        }

        self.buf.advance(4);
        let mut body = self.buf.split_to(body_len);
        let kind = body.get_u8();
        match kind {
            KIND_FRAME => {
                if body.len() < FRAME_HEADER_LEN {
                    return Err(WireError::TruncatedHeader(body.len()));
                }
                let pts = body.get_u64();
                let tb_num = body.get_u32();
                let tb_den = body.get_u32();
                let capture_ts_us = body.get_u64();
                let width = body.get_u16();
                let height = body.get_u16();
                let format = body.get_u8();
                let flags = body.get_u8();
                Ok(Some(MediaPacket::Frame(FramePacket {
                    pts,
                    tb_num,
                    tb_den,
                    capture_ts_us,
                    width,
                    height,
                    format,
                    flags,
                    payload: body.freeze(),
                })))
            }
            KIND_KEEPALIVE => Ok(Some(MediaPacket::Keepalive)),
            KIND_BYE => Ok(Some(MediaPacket::Bye)),
            other => Err(WireError::UnknownKind(other)),
        }
    }

    /// Bytes buffered but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> VideoFrame {
        let mut frame = VideoFrame::captured(4, 2, PixelFormat::Bgr24, (0u8..24).collect());
        frame.stamp(42, TimeBase::per_frame(30));
        frame
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = sample_frame();
        let encoded = encode_frame(&frame).unwrap();

        let mut decoder = MediaDecoder::new();
        decoder.extend(&encoded);
        let packet = match decoder.next_packet().unwrap() {
            Some(MediaPacket::Frame(p)) => p,
            other => panic!("expected frame packet, got {:?}", other),
        };
        assert_eq!(packet.pts, 42);
        assert_eq!(packet.tb_den, 30);
        assert_eq!(packet.width, 4);
        assert_eq!(packet.height, 2);

        let decoded = VideoFrame::try_from(packet).unwrap();
        assert_eq!(decoded.format, PixelFormat::Bgr24);
        assert_eq!(decoded.data, frame.data);
        assert_eq!(decoded.capture_ts_us, frame.capture_ts_us);
        assert!(!decoded.filler);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_filler_flag_survives_roundtrip() {
        let mut frame = VideoFrame::filler(2, 2, PixelFormat::Rgb24);
        frame.stamp(7, TimeBase::per_frame(30));
        let encoded = encode_frame(&frame).unwrap();

        let mut decoder = MediaDecoder::new();
        decoder.extend(&encoded);
        let packet = match decoder.next_packet().unwrap() {
            Some(MediaPacket::Frame(p)) => p,
            other => panic!("expected frame packet, got {:?}", other),
        };
        assert!(VideoFrame::try_from(packet).unwrap().filler);
    }

    #[test]
    fn test_byte_at_a_time_decoding() {
        let frame = sample_frame();
        let encoded = encode_frame(&frame).unwrap();

        let mut decoder = MediaDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            decoder.extend(&[*byte]);
            let got = decoder.next_packet().unwrap();
            if i + 1 < encoded.len() {
                assert!(got.is_none(), "packet complete too early at byte {}", i);
            } else {
                assert!(matches!(got, Some(MediaPacket::Frame(_))));
            }
        }
    }

    #[test]
    fn test_control_packets_roundtrip() {
        let mut decoder = MediaDecoder::new();
        decoder.extend(&encode_keepalive());
        decoder.extend(&encode_bye());
        assert!(matches!(decoder.next_packet().unwrap(), Some(MediaPacket::Keepalive)));
        assert!(matches!(decoder.next_packet().unwrap(), Some(MediaPacket::Bye)));
        assert!(decoder.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut decoder = MediaDecoder::new();
        decoder.extend(&[0, 0, 0, 0]);
        assert!(matches!(decoder.next_packet(), Err(WireError::ZeroLength)));
    }

    #[test]
    fn test_oversized_rejected() {
        let mut decoder = MediaDecoder::new();
        decoder.extend(&(MAX_MEDIA_PACKET as u32 + 1).to_be_bytes());
        match decoder.next_packet() {
            Err(WireError::PacketTooLarge(n)) => assert_eq!(n, MAX_MEDIA_PACKET + 1),
            other => panic!("expected PacketTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut decoder = MediaDecoder::new();
        decoder.extend(&[0, 0, 0, 1, 0x7F]);
        assert!(matches!(decoder.next_packet(), Err(WireError::UnknownKind(0x7F))));
    }

    #[test]
    fn test_truncated_frame_header_rejected() {
        let mut decoder = MediaDecoder::new();
        // Frame kind with a 4-byte body, far short of the header.
        decoder.extend(&[0, 0, 0, 5, KIND_FRAME, 1, 2, 3, 4]);
        assert!(matches!(decoder.next_packet(), Err(WireError::TruncatedHeader(4))));
    }

    fn header_only_packet(width: u16, height: u16, format: u8, payload: Bytes) -> FramePacket {
        FramePacket {
            pts: 1,
            tb_num: 1,
            tb_den: 30,
            capture_ts_us: 0,
            width,
            height,
            format,
            flags: 0,
            payload,
        }
    }

    #[test]
    fn test_geometry_mismatch_classified() {
        let packet = header_only_packet(4, 4, 0, Bytes::from_static(&[0u8; 10]));
        match VideoFrame::try_from(packet) {
            Err(FrameDecodeError::GeometryMismatch { expected, actual }) => {
                assert_eq!(expected, 48);
                assert_eq!(actual, 10);
            }
            other => panic!("expected GeometryMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_format_classified() {
        let packet = header_only_packet(1, 1, 9, Bytes::from_static(&[0u8; 3]));
        assert!(matches!(
            VideoFrame::try_from(packet),
            Err(FrameDecodeError::UnknownFormat(9))
        ));
    }

    #[test]
    fn test_empty_payload_classified() {
        let packet = header_only_packet(0, 0, 0, Bytes::new());
        assert!(matches!(
            VideoFrame::try_from(packet),
            Err(FrameDecodeError::EmptyPayload)
        ));
    }
}
