//! SensorLink Vehicle
//!
//! Serves the sensor frame stream to perception consumers and applies the
//! speed commands the coordinator sends back.
//!
//! ## Usage
//!
//! ```bash
//! # Synthetic frames at 30 fps to one consumer on 127.0.0.1:6011
//! sensorlink-vehicle
//!
//! # Replay a recording to two consumers, admitting late joiners
//! SENSORLINK_REPLAY_PATH=drive.frames SENSORLINK_CONSUMERS=2 SENSORLINK_LATE_JOIN=1 sensorlink-vehicle
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use sensorlink::roles::{Vehicle, VehicleConfig};
use sensorlink::server::ServerConfig;
use sensorlink::sink::LogCommandSink;
use sensorlink::source::{ReplaySource, TestSource, TestSourceConfig};
use sensorlink::{FrameSource, DEFAULT_COMMAND_PORT, DEFAULT_FRAME_PORT, MAX_FRAME_SIZE};

/// Vehicle configuration from environment
struct Config {
    frame_addr: SocketAddr,
    command_addr: SocketAddr,
    consumers: usize,
    late_join: bool,
    write_timeout_ms: u64,
    max_frame_bytes: usize,
    replay_path: Option<PathBuf>,
    fps: u32,
    frame_count: Option<u64>,
}

impl Config {
    fn from_env() -> Result<Self> {
        let frame_addr = addr_from_env("SENSORLINK_FRAME_ADDR", DEFAULT_FRAME_PORT)?;
        let command_addr = addr_from_env("SENSORLINK_COMMAND_ADDR", DEFAULT_COMMAND_PORT)?;

        let consumers: usize = std::env::var("SENSORLINK_CONSUMERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let late_join = std::env::var("SENSORLINK_LATE_JOIN")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let write_timeout_ms: u64 = std::env::var("SENSORLINK_WRITE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000);

        let max_frame_bytes: usize = std::env::var("SENSORLINK_MAX_FRAME_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(MAX_FRAME_SIZE);

        let replay_path = std::env::var("SENSORLINK_REPLAY_PATH")
            .map(PathBuf::from)
            .ok();

        let fps: u32 = std::env::var("SENSORLINK_FPS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let frame_count = std::env::var("SENSORLINK_FRAME_COUNT")
            .ok()
            .and_then(|s| s.parse().ok());

        Ok(Self {
            frame_addr,
            command_addr,
            consumers,
            late_join,
            write_timeout_ms,
            max_frame_bytes,
            replay_path,
            fps,
            frame_count,
        })
    }
}

/// Address from `var`, or loopback on `default_port` when unset
fn addr_from_env(var: &str, default_port: u16) -> Result<SocketAddr> {
    match std::env::var(var) {
        Ok(s) => s.parse().with_context(|| format!("Invalid {var}: {s:?}")),
        Err(_) => Ok(SocketAddr::from(([127, 0, 0, 1], default_port))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env()?;

    info!("SensorLink Vehicle starting");
    info!(
        "  Frames: {} ({} consumer(s), late join: {})",
        config.frame_addr, config.consumers, config.late_join
    );
    info!("  Commands: {}", config.command_addr);

    let source: Box<dyn FrameSource> = match config.replay_path {
        Some(ref path) => {
            let pace = Duration::from_secs(1) / config.fps.max(1);
            let replay = ReplaySource::open(path, config.max_frame_bytes, Some(pace))
                .await
                .with_context(|| format!("Failed to open replay file {}", path.display()))?;
            Box::new(replay)
        }
        None => {
            info!("  Source: synthetic, {} fps", config.fps);
            Box::new(TestSource::new(TestSourceConfig {
                fps: config.fps,
                frame_count: config.frame_count,
                ..TestSourceConfig::default()
            }))
        }
    };

    let vehicle = Vehicle::bind(VehicleConfig {
        server: ServerConfig {
            listen_addr: config.frame_addr,
            expected_consumers: config.consumers,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            max_frame_size: config.max_frame_bytes,
            accept_late_joiners: config.late_join,
        },
        command_addr: config.command_addr,
    })
    .await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_cancel.cancel();
        }
    });

    let report = vehicle
        .run(source, LogCommandSink::default(), cancel)
        .await?;

    info!(
        "Stats: {} frames produced, {} delivered, {} consumer(s) dropped, {} commands",
        report.server.frames_produced,
        report.server.frames_delivered,
        report.server.consumers_dropped,
        report.commands.values_received
    );
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sensorlink=info".parse().unwrap()),
        )
        .init();
}
