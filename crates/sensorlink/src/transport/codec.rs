//! Wire format for frames over byte streams
//!
//! Each frame is sent as:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: opaque payload
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)       │
//! │ Big-endian u32   │ Opaque sensor sample     │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! Decoding goes through [`FrameCodec`], so partial reads are buffered and
//! any bytes past the current frame stay buffered for the next one.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::error::FramingError;
use crate::protocol::{FRAME_LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};

/// Prefix a payload with its big-endian length.
///
/// The output is always `payload.len() + 4` bytes. No size limit is applied
/// here; receivers enforce their own maximum.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_LENGTH_PREFIX_SIZE + payload.len());
    put_frame(payload, &mut buf);
    buf.freeze()
}

fn put_frame(payload: &[u8], dst: &mut BytesMut) {
    debug_assert!(payload.len() <= u32::MAX as usize);
    dst.reserve(FRAME_LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
}

/// Write one length-prefixed frame to an async writer and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&encode(payload)).await?;
    writer.flush().await
}

/// Length-prefix codec with a configurable maximum frame size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        if src.len() < FRAME_LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = (&src[..FRAME_LENGTH_PREFIX_SIZE]).get_u32() as usize;

        // Reject before reserving anything for the payload
        if declared > self.max_frame_size {
            return Err(FramingError::OversizedFrame {
                declared,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_LENGTH_PREFIX_SIZE + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(declared).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let needed = if src.len() < FRAME_LENGTH_PREFIX_SIZE {
            FRAME_LENGTH_PREFIX_SIZE
        } else {
            FRAME_LENGTH_PREFIX_SIZE + (&src[..FRAME_LENGTH_PREFIX_SIZE]).get_u32() as usize
        };
        Err(FramingError::Truncated {
            needed,
            received: src.len(),
        })
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for FrameCodec {
    type Error = FramingError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FramingError> {
        put_frame(item.as_ref(), dst);
        Ok(())
    }
}

/// Reads whole frames from an async byte stream.
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            inner: FramedRead::new(reader, FrameCodec::new(max_frame_size)),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream (no partial frame pending).
    pub async fn decode(&mut self) -> Result<Option<Bytes>, FramingError> {
        self.inner.next().await.transpose()
    }

    /// Bytes read from the stream but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.inner.read_buffer().len()
    }
}
