//! Consumer side of the frame channel
//!
//! Connects to a broadcast server, decodes frames and hands them to a
//! [`FrameSink`]. Derived values returned by the sink are passed to a
//! callback; putting them on the control channel is the caller's business.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, ConsumerError};
use crate::sink::FrameSink;

use super::codec::FrameReader;

/// A live connection to a frame broadcast server
pub struct FrameConsumer {
    reader: FrameReader<TcpStream>,
    peer: SocketAddr,
}

impl FrameConsumer {
    /// Connect to a broadcast server.
    pub async fn connect(
        server_addr: SocketAddr,
        max_frame_size: usize,
    ) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(server_addr)
            .await
            .map_err(|source| ConnectionError::Connect {
                addr: server_addr,
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        info!(server = %server_addr, "Connected to frame server");
        Ok(Self::from_stream(stream, server_addr, max_frame_size))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            reader: FrameReader::new(stream, max_frame_size),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Receive the next frame, or `None` once the server closed cleanly.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ConsumerError> {
        Ok(self.reader.decode().await?)
    }

    /// Feed every frame to `sink` until the stream ends.
    ///
    /// Returns the number of frames delivered. A clean close or cancellation
    /// ends the loop with `Ok`; a truncated frame or a sink decode failure
    /// ends it with the error.
    pub async fn receive_loop<S, F>(
        &mut self,
        sink: &mut S,
        mut on_derived: F,
        cancel: &CancellationToken,
    ) -> Result<u64, ConsumerError>
    where
        S: FrameSink + ?Sized,
        F: FnMut(f64),
    {
        let mut frames = 0u64;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(server = %self.peer, frames, "Receive loop cancelled");
                    return Ok(frames);
                }
                next = self.reader.decode() => next,
            };

            let payload = match next {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    info!(server = %self.peer, frames, "Frame stream closed");
                    return Ok(frames);
                }
                Err(e) => {
                    warn!(
                        server = %self.peer,
                        frames,
                        boundary = e.is_boundary_violation(),
                        error = %e,
                        "Frame stream failed"
                    );
                    return Err(e.into());
                }
            };

            frames += 1;
            debug!(len = payload.len(), frame = frames, "Received frame");

            match sink.on_frame(payload).await {
                Ok(Some(value)) => on_derived(value),
                Ok(None) => {}
                Err(e) => {
                    warn!(server = %self.peer, frame = frames, error = %e, "Sink rejected frame");
                    return Err(e.into());
                }
            }
        }
    }
}
