//! Upstream frame sources
//!
//! The broadcast server pulls frames from a [`FrameSource`]. Stock sources:
//! - [`ChannelSource`]: frames pushed by an embedding application
//! - [`TestSource`]: synthetic frames at a fixed rate (no simulator needed)
//! - [`ReplaySource`]: frames replayed from a recorded length-prefixed file

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::transport::FrameReader;

/// Produces frames for the broadcast server.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `None` signals end-of-stream.
    async fn next_frame(&mut self) -> Option<Bytes>;
}

#[async_trait]
impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    async fn next_frame(&mut self) -> Option<Bytes> {
        (**self).next_frame().await
    }
}

/// Frames pushed through an mpsc channel; ends when all senders drop.
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Create a bounded channel and the source reading from it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Configuration for the synthetic test source
#[derive(Debug, Clone)]
pub struct TestSourceConfig {
    /// Frames per second
    pub fps: u32,
    /// Simulated frame size in bytes (at least the 12-byte header)
    pub frame_size: usize,
    /// Stop after this many frames (None = run until shutdown)
    pub frame_count: Option<u64>,
}

impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            frame_size: 64 * 1024,
            frame_count: None,
        }
    }
}

/// Size of the header the test source writes into each frame
pub const TEST_FRAME_HEADER_SIZE: usize = 4 + 8;

/// Synthetic frame source.
///
/// Each frame starts with a big-endian u32 frame number and u64 timestamp
/// (microseconds since start), padded with a per-frame byte pattern.
pub struct TestSource {
    config: TestSourceConfig,
    ticker: Interval,
    frame_num: u32,
    produced: u64,
    start: Instant,
}

impl TestSource {
    pub fn new(config: TestSourceConfig) -> Self {
        let fps = config.fps.max(1) as u64;
        let mut ticker = interval(Duration::from_micros(1_000_000 / fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Test frame source: {}fps, {}B frames, limit {:?}",
            fps, config.frame_size, config.frame_count
        );

        Self {
            config,
            ticker,
            frame_num: 0,
            produced: 0,
            start: Instant::now(),
        }
    }

    fn build_frame(&self) -> Bytes {
        let size = self.config.frame_size.max(TEST_FRAME_HEADER_SIZE);
        let timestamp_us = self.start.elapsed().as_micros() as u64;

        let mut data = Vec::with_capacity(size);
        data.extend_from_slice(&self.frame_num.to_be_bytes());
        data.extend_from_slice(&timestamp_us.to_be_bytes());
        data.resize(size, (self.frame_num & 0xFF) as u8);
        Bytes::from(data)
    }
}

#[async_trait]
impl FrameSource for TestSource {
    async fn next_frame(&mut self) -> Option<Bytes> {
        if let Some(limit) = self.config.frame_count {
            if self.produced >= limit {
                return None;
            }
        }

        self.ticker.tick().await;
        let frame = self.build_frame();
        self.frame_num = self.frame_num.wrapping_add(1);
        self.produced += 1;
        Some(frame)
    }
}

/// Replays a file of length-prefixed frames (the same format as the wire).
///
/// A truncated or oversized record ends the replay with a warning.
pub struct ReplaySource {
    reader: FrameReader<File>,
    ticker: Option<Interval>,
    replayed: u64,
}

impl ReplaySource {
    /// Open a recording. `pace` spaces frames out; `None` replays as fast
    /// as the server consumes them.
    pub async fn open(
        path: impl AsRef<Path>,
        max_frame_size: usize,
        pace: Option<Duration>,
    ) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        info!(path = %path.display(), ?pace, "Replaying frames from file");

        let ticker = pace.filter(|p| !p.is_zero()).map(|p| {
            let mut ticker = interval(p);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        Ok(Self {
            reader: FrameReader::new(file, max_frame_size),
            ticker,
            replayed: 0,
        })
    }

    pub fn replayed(&self) -> u64 {
        self.replayed
    }
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn next_frame(&mut self) -> Option<Bytes> {
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.tick().await;
        }

        match self.reader.decode().await {
            Ok(Some(frame)) => {
                self.replayed += 1;
                Some(frame)
            }
            Ok(None) => {
                info!(frames = self.replayed, "Replay finished");
                None
            }
            Err(e) => {
                warn!(
                    frames = self.replayed,
                    pending = self.reader.buffered(),
                    error = %e,
                    "Replay ended on bad record"
                );
                None
            }
        }
    }
}
