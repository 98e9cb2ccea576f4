//! Datagram control channel
//!
//! Two independent paths, telemetry and command, each carrying one decimal
//! value per datagram. Delivery is best-effort: receivers treat every value
//! as the newest sample and senders never wait for acknowledgment.

mod receiver;
mod sender;
mod value;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{
    DEFAULT_COMMAND_INTERVAL, DEFAULT_COMMAND_PORT, DEFAULT_TELEMETRY_INTERVAL,
    DEFAULT_TELEMETRY_PORT,
};

pub use receiver::{ReceiverStats, ValueReceiver};
pub use sender::{PacedSender, SendMode, SenderStats, ValueSender};
pub use value::{encode_value, parse_value, ChannelKind};

/// Control channel endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    /// Where the coordinator receives telemetry
    pub telemetry_addr: SocketAddr,
    /// Where the vehicle receives commands
    pub command_addr: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            telemetry_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_TELEMETRY_PORT)),
            command_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_COMMAND_PORT)),
        }
    }
}

impl ControlConfig {
    pub fn addr(&self, kind: ChannelKind) -> SocketAddr {
        match kind {
            ChannelKind::Telemetry => self.telemetry_addr,
            ChannelKind::Command => self.command_addr,
        }
    }
}

/// Cadence and resend policy for a paced sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub interval: Duration,
    pub mode: SendMode,
}

impl PacingConfig {
    /// Setpoints are resent every tick.
    pub fn command() -> Self {
        Self {
            interval: DEFAULT_COMMAND_INTERVAL,
            mode: SendMode::Repeat,
        }
    }

    /// Measurements are sent once each.
    pub fn telemetry() -> Self {
        Self {
            interval: DEFAULT_TELEMETRY_INTERVAL,
            mode: SendMode::OnChange,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}
