//! SensorLink - sensor fan-out and control loop transport
//!
//! Links a vehicle's sensor stream to downstream consumers and closes the
//! control loop with scalar telemetry and command values:
//!
//! - **Frames** (`transport`, `server`): length-prefixed payloads over TCP,
//!   broadcast to a fixed set of consumers with per-connection isolation
//! - **Control** (`control`): one decimal value per UDP datagram, best-effort,
//!   latest value wins
//! - **Collaborators** (`source`, `sink`): where frames come from and where
//!   frames, telemetry and commands go
//! - **Roles** (`roles`): vehicle, perception and coordinator runners

// Core modules
mod error;
mod protocol;

pub use error::*;
pub use protocol::*;

// Frame channel: codec and consumer
pub mod transport;

// Frame broadcast server
pub mod server;

// Datagram telemetry/command channel
pub mod control;

// Collaborator traits and stock implementations
pub mod sink;
pub mod source;

// Process composition
pub mod roles;

pub use sink::{CommandSink, FrameSink, TelemetryBridge};
pub use source::FrameSource;
