//! Receiving side of a control path

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, MalformedValueError, ReceiveError};
use crate::protocol::MAX_DATAGRAM_SIZE;

use super::value::{parse_value, ChannelKind};

/// Counters for a receiver (snapshot)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub values_received: u64,
    pub malformed: u64,
    pub io_errors: u64,
}

/// Datagram receiver bound to a fixed local address.
///
/// Every value is an independent latest sample; gaps, duplicates and
/// reordering are expected.
pub struct ValueReceiver {
    socket: UdpSocket,
    kind: ChannelKind,
    values_received: AtomicU64,
    malformed: AtomicU64,
    io_errors: AtomicU64,
}

impl ValueReceiver {
    pub async fn bind(kind: ChannelKind, addr: SocketAddr) -> Result<Self, ConnectionError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ConnectionError::Bind { addr, source })?;
        info!(channel = %kind, addr = %addr, "Control receiver bound");

        Ok(Self {
            socket,
            kind,
            values_received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Wait for one datagram and parse it.
    ///
    /// A datagram longer than [`MAX_DATAGRAM_SIZE`] is rejected, not parsed
    /// from its first bytes.
    pub async fn receive_value(&self) -> Result<f64, ReceiveError> {
        // One spare byte so a full buffer means the datagram was cut
        let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
        let (len, from) = self.socket.recv_from(&mut buf).await?;

        let parsed = if len > MAX_DATAGRAM_SIZE {
            Err(format!("datagram exceeds {MAX_DATAGRAM_SIZE} bytes"))
        } else {
            parse_value(&buf[..len])
        };

        match parsed {
            Ok(value) => {
                self.values_received.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(reason) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                Err(MalformedValueError { from, reason }.into())
            }
        }
    }

    /// Receive until cancelled, handing each value to `on_value`.
    ///
    /// Malformed datagrams and socket errors are logged and skipped.
    pub async fn run<F>(&self, mut on_value: F, cancel: CancellationToken) -> ReceiverStats
    where
        F: FnMut(f64),
    {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.receive_value() => result,
            };

            match result {
                Ok(value) => {
                    debug!(channel = %self.kind, value, "Value received");
                    on_value(value);
                }
                Err(ReceiveError::Malformed(e)) => {
                    warn!(channel = %self.kind, error = %e, "Skipping malformed datagram");
                }
                Err(ReceiveError::Io(e)) => {
                    // e.g. ICMP port-unreachable surfaced on some platforms
                    self.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %self.kind, error = %e, "Datagram receive error");
                }
            }
        }

        let stats = self.stats();
        info!(
            channel = %self.kind,
            received = stats.values_received,
            malformed = stats.malformed,
            "Control receiver stopped"
        );
        stats
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            values_received: self.values_received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn bound() -> (Arc<ValueReceiver>, UdpSocket, SocketAddr) {
        let receiver = ValueReceiver::bind(ChannelKind::Telemetry, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (Arc::new(receiver), sender, addr)
    }

    #[tokio::test]
    async fn receive_value_parses_decimal() {
        let (receiver, sender, addr) = bound().await;
        sender.send_to(b"10", addr).await.unwrap();
        assert_eq!(receiver.receive_value().await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn receive_value_reports_malformed() {
        let (receiver, sender, addr) = bound().await;
        sender.send_to(b"ten", addr).await.unwrap();
        match receiver.receive_value().await {
            Err(ReceiveError::Malformed(e)) => {
                assert_eq!(e.from, sender.local_addr().unwrap());
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
        assert_eq!(receiver.stats().malformed, 1);
    }

    #[tokio::test]
    async fn oversized_datagram_is_malformed_not_truncated() {
        let (receiver, sender, addr) = bound().await;
        // Its first MAX_DATAGRAM_SIZE bytes would parse as a number
        let digits = vec![b'0'; 1500];
        sender.send_to(&digits, addr).await.unwrap();
        match receiver.receive_value().await {
            Err(ReceiveError::Malformed(e)) => {
                assert!(e.reason.contains("exceeds"), "reason: {}", e.reason);
            }
            other => panic!("expected Malformed, got {other:?}"),
        }

        // Exactly at the limit is still accepted
        let mut at_limit = vec![b' '; MAX_DATAGRAM_SIZE];
        at_limit[..2].copy_from_slice(b"15");
        sender.send_to(&at_limit, addr).await.unwrap();
        assert_eq!(receiver.receive_value().await.unwrap(), 15.0);

        let stats = receiver.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.values_received, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_survives_malformed_datagram() {
        let (receiver, sender, addr) = bound().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let loop_receiver = Arc::clone(&receiver);
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop_receiver
                .run(
                    move |v| {
                        let _ = tx.send(v);
                    },
                    loop_cancel,
                )
                .await
        });

        sender.send_to(b"not a number", addr).await.unwrap();
        sender.send_to(b"42.5", addr).await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("valid value after malformed one")
            .unwrap();
        assert_eq!(value, 42.5);

        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.values_received, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (receiver, _sender, _addr) = bound().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(2), receiver.run(|_| {}, cancel))
            .await
            .expect("cancelled receiver returns");
        assert_eq!(stats, ReceiverStats::default());
    }

    #[tokio::test]
    async fn bind_conflict_is_bind_error() {
        let (receiver, _sender, addr) = bound().await;
        let result = ValueReceiver::bind(ChannelKind::Command, addr).await;
        assert!(matches!(result, Err(ConnectionError::Bind { .. })));
        drop(receiver);
    }
}
