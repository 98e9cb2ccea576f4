//! Live consumer connections and per-frame fan-out

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, WriteTimeoutError};

/// Identifier assigned to each accepted consumer
pub type SubscriberId = u64;

/// One consumer connection in the Streaming state
pub(crate) struct Subscriber {
    id: SubscriberId,
    peer: SocketAddr,
    stream: TcpStream,
}

impl Subscriber {
    pub(crate) fn new(id: SubscriberId, peer: SocketAddr, stream: TcpStream) -> Self {
        Self { id, peer, stream }
    }

    /// Write one encoded frame, bounded by `timeout`.
    ///
    /// A timed-out write may leave a partial frame on the wire, so any
    /// error means the connection must be dropped.
    async fn deliver(&mut self, encoded: &Bytes, timeout: Duration) -> Result<(), DeliveryError> {
        match tokio::time::timeout(timeout, self.stream.write_all(encoded)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(DeliveryError::Io {
                peer: self.peer,
                source,
            }),
            Err(_) => Err(WriteTimeoutError {
                peer: self.peer,
                timeout,
            }
            .into()),
        }
    }

    async fn close(mut self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.stream.shutdown())
            .await
            .is_err()
        {
            debug!(subscriber = self.id, peer = %self.peer, "Shutdown timed out, dropping socket");
        }
    }
}

/// Outcome of fanning one frame out to every subscriber
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
    pub remaining: usize,
}

/// The set of live connections.
///
/// Insertion (accept), removal (delivery failure) and iteration (fan-out)
/// all go through the same lock.
#[derive(Default)]
pub(crate) struct SubscriberSet {
    inner: Mutex<Vec<Subscriber>>,
}

impl SubscriberSet {
    pub(crate) async fn insert(&self, subscriber: Subscriber) -> usize {
        let mut subs = self.inner.lock().await;
        info!(subscriber = subscriber.id, peer = %subscriber.peer, "Consumer registered");
        subs.push(subscriber);
        subs.len()
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Write `encoded` to every subscriber concurrently.
    ///
    /// Failed or timed-out subscribers are removed; the rest are untouched.
    /// Returns `None` if `cancel` fires first. Pending writes are abandoned
    /// and may leave a partial frame on the wire, so the caller must close
    /// every connection afterwards.
    pub(crate) async fn broadcast(
        &self,
        encoded: &Bytes,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<FanOut> {
        let mut subs = self.inner.lock().await;

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            results = join_all(subs.iter_mut().map(|s| s.deliver(encoded, timeout))) => results,
        };

        let mut fan_out = FanOut::default();
        let current = std::mem::take(&mut *subs);
        for (sub, result) in current.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    fan_out.delivered += 1;
                    subs.push(sub);
                }
                Err(e) => {
                    warn!(subscriber = sub.id, peer = %sub.peer, error = %e, "Dropping consumer");
                    fan_out.dropped += 1;
                }
            }
        }
        fan_out.remaining = subs.len();
        Some(fan_out)
    }

    /// Shut down and remove every subscriber.
    pub(crate) async fn close_all(&self, timeout: Duration) -> usize {
        let drained: Vec<Subscriber> = std::mem::take(&mut *self.inner.lock().await);
        let count = drained.len();
        join_all(drained.into_iter().map(|s| s.close(timeout))).await;
        count
    }
}
