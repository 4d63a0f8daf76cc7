//! Framing: 2 bytes BE payload length + 2 bytes BE endpoint id + payload.

const HEADER_SIZE: usize = 4;

/// Default upper bound on an inbound payload. Anything above is treated as a corrupt header.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 8 * 1024;

/// One message on the wire, envelope already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub endpoint: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(endpoint: u16, payload: Vec<u8>) -> Self {
        Self { endpoint, payload }
    }
}

/// Largest payload the u16 length prefix can describe.
pub const MAX_ENCODABLE_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Encode a payload for `endpoint` into a single frame.
pub fn encode_frame(endpoint: u16, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    check_payload_len(payload.len())?;
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&endpoint.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Fails when a payload of `len` bytes cannot be framed.
pub fn check_payload_len(len: usize) -> Result<(), FrameEncodeError> {
    if len > MAX_ENCODABLE_PAYLOAD_LEN {
        return Err(FrameEncodeError::TooLarge {
            len,
            max: MAX_ENCODABLE_PAYLOAD_LEN,
        });
    }
    Ok(())
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("payload of {len} bytes exceeds frame limit {max}")]
    TooLarge { len: usize, max: usize },
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; `NeedMore` means try again once more data arrived.
pub fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if len > max_payload {
        return Err(FrameDecodeError::Malformed {
            len,
            max: max_payload,
        });
    }
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let endpoint = u16::from_be_bytes([bytes[2], bytes[3]]);
    let payload = bytes[HEADER_SIZE..HEADER_SIZE + len].to_vec();
    Ok((Frame { endpoint, payload }, HEADER_SIZE + len))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("malformed frame: declared payload length {len} exceeds {max}")]
    Malformed { len: usize, max: usize },
}

/// Growable receive buffer: accumulates stream bytes and yields whole frames.
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameBuffer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame. `Ok(None)` when more bytes are needed.
    ///
    /// On a malformed header one byte is dropped so the next call tries to resynchronize.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameDecodeError> {
        match decode_frame(&self.buf, self.max_payload) {
            Ok((frame, used)) => {
                self.buf.drain(..used);
                Ok(Some(frame))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => {
                self.buf.drain(..1);
                Err(e)
            }
        }
    }

    /// Bytes buffered but not yet forming a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}
