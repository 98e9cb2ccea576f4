//! Sending side of a control path

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, ControlError};

use super::value::{encode_value, ChannelKind};

/// Counters for a sender (snapshot)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub values_sent: u64,
    pub send_errors: u64,
}

/// Fire-and-forget datagram sender bound to one target address
pub struct ValueSender {
    socket: UdpSocket,
    target: SocketAddr,
    kind: ChannelKind,
    values_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl ValueSender {
    /// Bind an ephemeral local socket for sending to `target`.
    pub async fn bind(kind: ChannelKind, target: SocketAddr) -> Result<Self, ConnectionError> {
        let local = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| ConnectionError::Bind {
                addr: local,
                source,
            })?;
        debug!(channel = %kind, target = %target, "Control sender ready");

        Ok(Self {
            socket,
            target,
            kind,
            values_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Send one value as a single datagram.
    ///
    /// Success means the datagram left this host; nothing is known about
    /// delivery. Non-finite values are refused with `InvalidInput`.
    pub async fn send_value(&self, value: f64) -> std::io::Result<()> {
        let Some(text) = encode_value(value) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot send non-finite value {value}"),
            ));
        };

        match self.socket.send_to(text.as_bytes(), self.target).await {
            Ok(_) => {
                self.values_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            values_sent: self.values_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// What a paced sender does on each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Resend the latest value every tick (setpoints)
    Repeat,
    /// Send only samples published since the last tick (measurements)
    OnChange,
}

/// Sends the latest published value at a fixed cadence.
pub struct PacedSender {
    sender: ValueSender,
    period: Duration,
    mode: SendMode,
}

impl PacedSender {
    pub fn new(
        sender: ValueSender,
        period: Duration,
        mode: SendMode,
    ) -> Result<Self, ControlError> {
        if period.is_zero() {
            return Err(ControlError::InvalidInterval);
        }
        Ok(Self {
            sender,
            period,
            mode,
        })
    }

    /// Run until cancelled or until the value publisher is dropped. In
    /// `OnChange` mode a sample published just before the drop is still sent.
    ///
    /// Send errors are logged and counted; they never stop the loop.
    pub async fn run(
        self,
        mut latest: watch::Receiver<Option<f64>>,
        cancel: CancellationToken,
    ) -> SenderStats {
        let kind = self.sender.kind();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            channel = %kind,
            target = %self.sender.target(),
            period_ms = self.period.as_millis() as u64,
            mode = ?self.mode,
            "Paced sender started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let closed = latest.has_changed().is_err();
            let value = {
                let current = latest.borrow_and_update();
                match self.mode {
                    SendMode::Repeat if !closed => *current,
                    SendMode::OnChange if current.has_changed() => *current,
                    _ => None,
                }
            };

            if let Some(value) = value {
                if let Err(e) = self.sender.send_value(value).await {
                    warn!(channel = %kind, value, error = %e, "Control send failed");
                }
            }

            if closed {
                debug!(channel = %kind, "Value publisher dropped");
                break;
            }
        }

        let stats = self.sender.stats();
        info!(
            channel = %kind,
            sent = stats.values_sent,
            errors = stats.send_errors,
            "Paced sender stopped"
        );
        stats
    }
}
