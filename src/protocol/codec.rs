//! Protocol codec for encoding/decoding frames
//!
//! Handles length-prefixed framing of tagged frames.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

use super::{Frame, DEFAULT_MAX_PAYLOAD_SIZE};

/// Length prefix size: u32, big-endian
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Tag size in bytes
pub const TAG_SIZE: usize = 1;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} payload bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Empty frame: declared length 0 has no tag byte")]
    EmptyFrame,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Encodes and decodes frames in the wire format
#[derive(Debug)]
pub struct FrameCodec {
    max_payload_size: usize,
    state: DecodeState,
}

#[derive(Debug, Default, Clone, Copy)]
enum DecodeState {
    #[default]
    Header,
    Body {
        length: usize,
    },
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size,
            state: DecodeState::Header,
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Whether a header has been consumed and its body is still pending
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::Body { .. })
    }

    /// Encode a frame into a buffer
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = frame.payload();
        if payload.len() > self.max_payload_size {
            return Err(CodecError::FrameTooLarge(payload.len(), self.max_payload_size));
        }

        buf.reserve(LENGTH_PREFIX_SIZE + frame.wire_len());
        buf.put_u32(frame.wire_len() as u32);
        buf.put_u8(frame.tag());
        buf.put_slice(payload);
        Ok(())
    }

    /// Attempt to decode a frame from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed. Bytes of an incomplete
    /// frame stay in `buf` until the rest arrives.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

                    if length < TAG_SIZE {
                        return Err(CodecError::EmptyFrame);
                    }
                    if length - TAG_SIZE > self.max_payload_size {
                        return Err(CodecError::FrameTooLarge(
                            length - TAG_SIZE,
                            self.max_payload_size,
                        ));
                    }

                    buf.advance(LENGTH_PREFIX_SIZE);
                    buf.reserve(length);
                    self.state = DecodeState::Body { length };
                }
                DecodeState::Body { length } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let mut body = buf.split_to(length);
                    let tag = body.get_u8();
                    self.state = DecodeState::Header;

                    return Ok(Some(Frame::new(tag, body.freeze())));
                }
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

/// Encode a single frame into a fresh buffer with the default limits
pub fn encode_frame(frame: &Frame) -> Result<BytesMut, CodecError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.wire_len());
    FrameCodec::default().encode(frame, &mut buf)?;
    Ok(buf)
}
