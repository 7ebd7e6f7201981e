//! Multipart frame codec.
//!
//! The transport unit is a *message*: an ordered sequence of frames delivered
//! atomically. On the wire each frame is
//!
//! ```text
//! flags: u8 (bit 0 = more frames follow) | len: u32 big-endian | payload
//! ```
//!
//! and a message ends at the first frame whose `more` bit is clear. Envelopes
//! occupy the first frame; binary payloads ride in the frames after it.
//! Works over any AsyncRead/AsyncWrite via `Framed`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Hard ceiling on a single frame, so a bad peer cannot balloon memory.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const FLAG_MORE: u8 = 0x01;
const HEADER_LEN: usize = 5;

/// One decoded message: all frames, in order. Never empty.
pub type Message = Vec<Bytes>;

/// Frames messages for a byte stream, accumulating frames until the final
/// one (more bit clear) completes a message.
pub struct FrameCodec {
    max_frame_len: usize,
    partial: Vec<Bytes>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            partial: Vec::new(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let flags = src[0];
            if flags & !FLAG_MORE != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame flags: {:#04x}", flags),
                ));
            }

            let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
            if len > self.max_frame_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds limit {}", len, self.max_frame_len),
                ));
            }

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let payload = src.split_to(len).freeze();

            if flags & FLAG_MORE != 0 {
                self.partial.push(payload);
                continue;
            }

            let mut frames = std::mem::take(&mut self.partial);
            frames.push(payload);
            return Ok(Some(frames));
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if message.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot encode an empty message",
            ));
        }

        let last = message.len() - 1;
        for (i, frame) in message.iter().enumerate() {
            if frame.len() > self.max_frame_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "frame of {} bytes exceeds limit {}",
                        frame.len(),
                        self.max_frame_len
                    ),
                ));
            }
            dst.reserve(HEADER_LEN + frame.len());
            dst.put_u8(if i < last { FLAG_MORE } else { 0 });
            dst.put_u32(frame.len() as u32);
            dst.extend_from_slice(frame);
        }
        Ok(())
    }
}
