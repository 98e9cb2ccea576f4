//! Control datagram payloads: one decimal number, no header

use std::fmt;

/// Which logical control path a socket serves.
///
/// Only used for logging; on the wire the two are told apart by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Sensor side → coordinator
    Telemetry,
    /// Coordinator → actuator side
    Command,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Telemetry => f.write_str("telemetry"),
            ChannelKind::Command => f.write_str("command"),
        }
    }
}

/// Encode a value as decimal text. Returns `None` for NaN and infinities,
/// which receivers would reject.
pub fn encode_value(value: f64) -> Option<String> {
    value.is_finite().then(|| value.to_string())
}

/// Parse a datagram payload as a finite decimal number.
///
/// Surrounding ASCII whitespace is ignored. The error is a human-readable
/// reason suitable for logging.
pub fn parse_value(payload: &[u8]) -> Result<f64, String> {
    let text = std::str::from_utf8(payload).map_err(|e| format!("not UTF-8: {e}"))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty payload".to_string());
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|e| format!("{trimmed:?} is not a number: {e}"))?;
    if !value.is_finite() {
        return Err(format!("{trimmed:?} is not finite"));
    }
    Ok(value)
}
