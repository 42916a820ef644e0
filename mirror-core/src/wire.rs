//! Framing: 1 byte packet type + 4 bytes LE length + payload.

pub const HEADER_LEN: usize = 5;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// One decoded frame. The type byte is kept raw; see `protocol::PacketType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

/// Encode the 5-byte header for a payload of `len` bytes.
pub fn encode_header(packet_type: u8, len: usize) -> Result<[u8; HEADER_LEN], FrameEncodeError> {
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(len));
    }
    let mut out = [0u8; HEADER_LEN];
    out[0] = packet_type;
    out[1..].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(out)
}

/// Parse a header into (packet type, payload length). Rejects lengths above `MAX_FRAME_LEN`.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(u8, usize), FrameDecodeError> {
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok((header[0], len as usize))
}

/// Encode a whole frame into one buffer.
pub fn encode_frame(packet_type: u8, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let header = encode_header(packet_type, payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns NeedMore if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    let Some(header) = bytes.get(..HEADER_LEN) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let mut fixed = [0u8; HEADER_LEN];
    fixed.copy_from_slice(header);
    let (packet_type, len) = decode_header(&fixed)?;
    let end = HEADER_LEN + len;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = Frame {
        packet_type,
        payload: bytes[HEADER_LEN..end].to_vec(),
    };
    Ok((frame, end))
}

/// Error decoding a frame (need more bytes or declared length too large).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_payload_lengths() {
        for len in [0usize, 1, 2, 255, 256, 4096, 70_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = encode_frame(4, &payload).unwrap();
            assert_eq!(frame.len(), HEADER_LEN + len);
            let (decoded, n) = decode_frame(&frame).unwrap();
            assert_eq!(n, frame.len());
            assert_eq!(decoded.packet_type, 4);
            assert_eq!(decoded.payload, payload);
        }
    }

    #[test]
    fn header_is_little_endian() {
        let header = encode_header(2, 0x0102_0304).unwrap();
        assert_eq!(header, [2, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(1, b"ABCDEF").unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..HEADER_LEN + 3]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversize_length_rejected() {
        let mut header = [3u8; HEADER_LEN];
        header[1..].copy_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        assert!(matches!(
            decode_header(&header),
            Err(FrameDecodeError::TooLarge(_))
        ));
        assert!(matches!(
            encode_header(3, MAX_FRAME_LEN as usize + 1),
            Err(FrameEncodeError::TooLarge(_))
        ));
    }

    #[test]
    fn multiple_frames() {
        let fa = encode_frame(1, b"first").unwrap();
        let fb = encode_frame(2, b"").unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (a, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (b, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(a.payload, b"first");
        assert_eq!(b.packet_type, 2);
        assert!(b.payload.is_empty());
    }
}
