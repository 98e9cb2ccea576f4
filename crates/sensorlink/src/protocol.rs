//! Protocol constants for SensorLink

use std::time::Duration;

/// Size of the big-endian length prefix in front of every frame.
pub const FRAME_LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame payload size (16 MB, generous for uncompressed camera frames)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest control datagram a receiver will read.
///
/// A decimal `f64` never needs more than a few dozen bytes.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Default loopback port the vehicle serves frames on
pub const DEFAULT_FRAME_PORT: u16 = 6011;

/// Default loopback port the coordinator receives telemetry on
pub const DEFAULT_TELEMETRY_PORT: u16 = 6021;

/// Default loopback port the vehicle receives commands on
pub const DEFAULT_COMMAND_PORT: u16 = 6031;

/// Default per-connection write timeout for frame fan-out
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default pacing for the command sender (10 Hz)
pub const DEFAULT_COMMAND_INTERVAL: Duration = Duration::from_millis(100);

/// Default pacing for the telemetry sender (20 Hz)
pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on how long tasks get to drain after shutdown is requested
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
