//! Frame channel transport
//!
//! Provides:
//! - Length-prefix framing over any async byte stream
//! - The consumer side of the broadcast connection

pub mod codec;
mod consumer;

pub use codec::{encode, write_frame, FrameCodec, FrameReader};
pub use consumer::FrameConsumer;
