//! Frame broadcast server
//!
//! The server is the producer side of the frame channel:
//! - Accepts a fixed number of consumer connections
//! - Pulls frames from a `FrameSource`
//! - Writes each frame to every live consumer, dropping the ones that fail

mod broadcast;
mod subscribers;

pub use broadcast::{serve, BroadcastServer, ServerConfig, ServerHandle, ServerStats};
