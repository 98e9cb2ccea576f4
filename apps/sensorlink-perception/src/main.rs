//! SensorLink Perception
//!
//! Consumes the vehicle's frame stream and reports a distance estimate per
//! frame to the coordinator as paced telemetry.
//!
//! ## Usage
//!
//! ```bash
//! # Connect to 127.0.0.1:6011, report to 127.0.0.1:6021
//! sensorlink-perception
//!
//! # Simulate half a second of detection work per frame
//! SENSORLINK_PROCESSING_MS=500 sensorlink-perception
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use sensorlink::control::PacingConfig;
use sensorlink::roles::{run_perception, PerceptionConfig};
use sensorlink::sink::FixedEstimateSink;
use sensorlink::{DEFAULT_FRAME_PORT, DEFAULT_TELEMETRY_PORT, MAX_FRAME_SIZE};

/// Perception configuration from environment
struct Config {
    frame_addr: SocketAddr,
    telemetry_addr: SocketAddr,
    max_frame_bytes: usize,
    telemetry_interval_ms: u64,
    estimate: f64,
    processing_ms: u64,
}

impl Config {
    fn from_env() -> Result<Self> {
        let frame_addr = addr_from_env("SENSORLINK_FRAME_ADDR", DEFAULT_FRAME_PORT)?;
        let telemetry_addr = addr_from_env("SENSORLINK_TELEMETRY_ADDR", DEFAULT_TELEMETRY_PORT)?;

        let max_frame_bytes: usize = std::env::var("SENSORLINK_MAX_FRAME_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(MAX_FRAME_SIZE);

        let telemetry_interval_ms: u64 = std::env::var("SENSORLINK_TELEMETRY_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);

        let estimate: f64 = std::env::var("SENSORLINK_ESTIMATE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10.0);

        let processing_ms: u64 = std::env::var("SENSORLINK_PROCESSING_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            frame_addr,
            telemetry_addr,
            max_frame_bytes,
            telemetry_interval_ms,
            estimate,
            processing_ms,
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

    info!("SensorLink Perception starting");
    info!("  Frame server: {}", config.frame_addr);
    info!("  Telemetry: {} every {} ms", config.telemetry_addr, config.telemetry_interval_ms);
    info!("  Estimate: {} (processing {} ms)", config.estimate, config.processing_ms);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_cancel.cancel();
        }
    });

    let sink = FixedEstimateSink::new(
        config.estimate,
        Duration::from_millis(config.processing_ms),
    );
    let report = run_perception(
        PerceptionConfig {
            frame_addr: config.frame_addr,
            max_frame_size: config.max_frame_bytes,
            telemetry_addr: config.telemetry_addr,
            pacing: PacingConfig::telemetry()
                .with_interval(Duration::from_millis(config.telemetry_interval_ms)),
        },
        sink,
        cancel,
    )
    .await?;

    info!(
        "Stats: {} frames, {} telemetry values sent",
        report.frames, report.telemetry.values_sent
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
