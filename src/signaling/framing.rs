//! Length-prefixed framing for the signaling byte stream
//!
//! Each message is prefixed with a 4-byte big-endian length header.

/// Maximum allowed signaling message size (bytes).
/// Session descriptions are small JSON documents; anything near this
/// limit indicates a corrupt stream rather than a legitimate message.
pub const MAX_SIGNAL_FRAME: usize = 1024 * 1024;

#[derive(Debug)]
pub enum FramingError {
    FrameTooLarge(usize),
    ZeroLength,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::FrameTooLarge(len) => write!(f, "frame too large: {} bytes", len),
            FramingError::ZeroLength => write!(f, "zero-length frame"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Encode a message with a 4-byte length prefix.
pub fn frame_message(data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= MAX_SIGNAL_FRAME);
    let len = data.len() as u32;
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(data);
    framed
}

/// Stateful decoder for length-prefixed byte streams.
///
/// Handles partial reads across TCP segment boundaries.
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(4096) }
    }

    /// Append received bytes to the internal buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete message, if available
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length == 0 {
            return Err(FramingError::ZeroLength);
        }
        if length > MAX_SIGNAL_FRAME {
            return Err(FramingError::FrameTooLarge(length));
        }
        let total = 4 + length;
        if self.buf.len() < total {
            return Ok(None);
        }
        let msg = self.buf[4..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(msg))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let data = b"hello world";
        let framed = frame_message(data);
        assert_eq!(framed.len(), 4 + data.len());
        assert_eq!(&framed[0..4], &(data.len() as u32).to_be_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&framed);
        let decoded = decoder.next_message().unwrap().unwrap();
        assert_eq!(decoded, data);
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn test_partial_reads() {
        let data = b"test message";
        let framed = frame_message(data);

        let mut decoder = FrameDecoder::new();
        // Feed one byte at a time
        for &byte in &framed {
            decoder.extend(&[byte]);
        }
        let decoded = decoder.next_message().unwrap().unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_multiple_messages() {
        let mut decoder = FrameDecoder::new();
        let m1 = frame_message(b"first");
        let m2 = frame_message(b"second");
        let mut combined = m1;
        combined.extend_from_slice(&m2);
        decoder.extend(&combined);

        assert_eq!(decoder.next_message().unwrap().unwrap(), b"first");
        assert_eq!(decoder.next_message().unwrap().unwrap(), b"second");
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0, 0, 0, b'x']);
        assert!(matches!(decoder.next_message(), Err(FramingError::ZeroLength)));
    }

    #[test]
    fn test_oversized_rejected() {
        let mut decoder = FrameDecoder::new();
        let bad = ((MAX_SIGNAL_FRAME + 1) as u32).to_be_bytes();
        decoder.extend(&bad);
        assert!(matches!(decoder.next_message(), Err(FramingError::FrameTooLarge(_))));
    }
}
