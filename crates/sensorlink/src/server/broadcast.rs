//! Frame broadcast server: fixed-count accept phase, then fan-out streaming

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::protocol::{DEFAULT_FRAME_PORT, DEFAULT_WRITE_TIMEOUT, MAX_FRAME_SIZE};
use crate::source::FrameSource;
use crate::transport::encode;

use super::subscribers::{Subscriber, SubscriberId, SubscriberSet};

/// Back-off after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Broadcast server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// Consumers to wait for before streaming starts
    pub expected_consumers: usize,
    /// Per-connection bound on writing one frame
    pub write_timeout: Duration,
    /// Frames larger than this are not broadcast
    pub max_frame_size: usize,
    /// Keep accepting consumers while streaming
    pub accept_late_joiners: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_FRAME_PORT)),
            expected_consumers: 1,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            accept_late_joiners: false,
        }
    }
}

/// Statistics about server state (returned as a snapshot from atomic counters)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub consumers_connected: usize,
    pub consumers_accepted: u64,
    pub consumers_dropped: u64,
    pub frames_produced: u64,
    pub frames_oversized: u64,
    /// Sum of successful per-consumer deliveries
    pub frames_delivered: u64,
}

/// Internal atomic counters for lock-free stats tracking
#[derive(Default)]
struct AtomicServerStats {
    consumers_connected: AtomicUsize,
    consumers_accepted: AtomicU64,
    consumers_dropped: AtomicU64,
    frames_produced: AtomicU64,
    frames_oversized: AtomicU64,
    frames_delivered: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            consumers_connected: self.consumers_connected.load(Ordering::Relaxed),
            consumers_accepted: self.consumers_accepted.load(Ordering::Relaxed),
            consumers_dropped: self.consumers_dropped.load(Ordering::Relaxed),
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            frames_oversized: self.frames_oversized.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
        }
    }
}

struct ServerShared {
    subscribers: SubscriberSet,
    stats: AtomicServerStats,
    next_id: AtomicU64,
}

impl ServerShared {
    async fn register(&self, stream: TcpStream, peer: SocketAddr) -> SubscriberId {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = self
            .subscribers
            .insert(Subscriber::new(id, peer, stream))
            .await;
        self.stats
            .consumers_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .consumers_connected
            .store(count, Ordering::Relaxed);
        id
    }
}

/// Handle for observing a running server
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn stats(&self) -> ServerStats {
        self.shared.stats.snapshot()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len().await
    }
}

/// A bound, not yet running, broadcast server
pub struct BroadcastServer {
    listener: TcpListener,
    config: ServerConfig,
    shared: Arc<ServerShared>,
}

impl BroadcastServer {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ConnectionError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        info!(
            addr = %config.listen_addr,
            expected = config.expected_consumers,
            late_join = config.accept_late_joiners,
            "Frame server listening"
        );

        Ok(Self {
            listener,
            config,
            shared: Arc::new(ServerShared {
                subscribers: SubscriberSet::default(),
                stats: AtomicServerStats::default(),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accept the expected consumers, then broadcast every frame from
    /// `source` until it ends or `cancel` fires. All connections are closed
    /// before returning.
    pub async fn run<S>(self, source: &mut S, cancel: CancellationToken) -> ServerStats
    where
        S: FrameSource + ?Sized,
    {
        let Self {
            listener,
            config,
            shared,
        } = self;

        if !accept_expected(&listener, &config, &shared, &cancel).await {
            info!("Cancelled during accept phase");
            return finish(&shared, &config).await;
        }

        // Fixed membership drops the listener so late connects are refused
        let late_cancel = cancel.child_token();
        let late_accept = if config.accept_late_joiners {
            let shared = Arc::clone(&shared);
            let cancel = late_cancel.clone();
            Some(tokio::spawn(accept_late(listener, shared, cancel)))
        } else {
            drop(listener);
            None
        };

        let consumers = shared.subscribers.len().await;
        info!(consumers, "Streaming started");
        stream_frames(source, &config, &shared, &cancel).await;

        late_cancel.cancel();
        if let Some(task) = late_accept {
            if let Err(e) = task.await {
                warn!(error = %e, "Late accept task failed");
            }
        }

        finish(&shared, &config).await
    }
}

/// Bind, accept and stream in one call.
pub async fn serve<S>(
    config: ServerConfig,
    source: &mut S,
    cancel: CancellationToken,
) -> Result<ServerStats, ConnectionError>
where
    S: FrameSource + ?Sized,
{
    let server = BroadcastServer::bind(config).await?;
    Ok(server.run(source, cancel).await)
}

/// Returns false if cancelled before enough consumers connected.
async fn accept_expected(
    listener: &TcpListener,
    config: &ServerConfig,
    shared: &ServerShared,
    cancel: &CancellationToken,
) -> bool {
    let mut accepted = 0;
    while accepted < config.expected_consumers {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    shared.register(stream, peer).await;
                    accepted += 1;
                    info!(
                        peer = %peer,
                        accepted,
                        expected = config.expected_consumers,
                        "Consumer connected"
                    );
                }
                Err(e) => {
                    warn!(error = %ConnectionError::Accept(e), "Accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
    true
}

async fn accept_late(listener: TcpListener, shared: Arc<ServerShared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let id = shared.register(stream, peer).await;
                    info!(peer = %peer, subscriber = id, "Late consumer joined");
                }
                Err(e) => {
                    warn!(error = %ConnectionError::Accept(e), "Accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
    debug!("Late accept loop stopped");
}

async fn stream_frames<S>(
    source: &mut S,
    config: &ServerConfig,
    shared: &ServerShared,
    cancel: &CancellationToken,
) where
    S: FrameSource + ?Sized,
{
    let stats = &shared.stats;
    let mut reported_empty = false;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Streaming cancelled");
                return;
            }
            frame = source.next_frame() => frame,
        };

        let Some(frame) = frame else {
            info!("Frame source ended");
            return;
        };
        stats.frames_produced.fetch_add(1, Ordering::Relaxed);

        if frame.len() > config.max_frame_size {
            stats.frames_oversized.fetch_add(1, Ordering::Relaxed);
            warn!(
                len = frame.len(),
                max = config.max_frame_size,
                "Dropping oversized frame"
            );
            continue;
        }

        let encoded = encode(&frame);
        let Some(fan_out) = shared
            .subscribers
            .broadcast(&encoded, config.write_timeout, cancel)
            .await
        else {
            info!("Streaming cancelled during fan-out");
            return;
        };

        stats
            .frames_delivered
            .fetch_add(fan_out.delivered as u64, Ordering::Relaxed);
        stats
            .consumers_dropped
            .fetch_add(fan_out.dropped as u64, Ordering::Relaxed);
        stats
            .consumers_connected
            .store(fan_out.remaining, Ordering::Relaxed);
        debug!(
            len = frame.len(),
            delivered = fan_out.delivered,
            "Frame broadcast"
        );

        if fan_out.remaining == 0 && !reported_empty {
            info!("No consumers connected");
            reported_empty = true;
        } else if fan_out.remaining > 0 {
            reported_empty = false;
        }
    }
}

async fn finish(shared: &ServerShared, config: &ServerConfig) -> ServerStats {
    let closed = shared.subscribers.close_all(config.write_timeout).await;
    shared.stats.consumers_connected.store(0, Ordering::Relaxed);
    let stats = shared.stats.snapshot();
    info!(
        closed,
        produced = stats.frames_produced,
        delivered = stats.frames_delivered,
        dropped = stats.consumers_dropped,
        "Frame server stopped"
    );
    stats
}
