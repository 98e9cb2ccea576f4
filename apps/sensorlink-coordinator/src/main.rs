//! SensorLink Coordinator
//!
//! Receives telemetry from perception, republishes it, and holds the speed
//! setpoint on the command path at a fixed rate.
//!
//! ## Usage
//!
//! ```bash
//! # Listen on 127.0.0.1:6021, command 127.0.0.1:6031 at 10 Hz
//! sensorlink-coordinator
//!
//! # Different setpoint, 20 Hz
//! SENSORLINK_SETPOINT=8.5 SENSORLINK_COMMAND_INTERVAL_MS=50 sensorlink-coordinator
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use sensorlink::control::{ControlConfig, PacingConfig};
use sensorlink::roles::{Coordinator, CoordinatorConfig, DEFAULT_SETPOINT};
use sensorlink::sink::LogBridge;
use sensorlink::{DEFAULT_COMMAND_PORT, DEFAULT_TELEMETRY_PORT};

/// Coordinator configuration from environment
struct Config {
    telemetry_addr: SocketAddr,
    command_addr: SocketAddr,
    command_interval_ms: u64,
    setpoint: f64,
}

impl Config {
    fn from_env() -> Result<Self> {
        let telemetry_addr = addr_from_env("SENSORLINK_TELEMETRY_ADDR", DEFAULT_TELEMETRY_PORT)?;
        let command_addr = addr_from_env("SENSORLINK_COMMAND_ADDR", DEFAULT_COMMAND_PORT)?;

        let command_interval_ms: u64 = std::env::var("SENSORLINK_COMMAND_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let setpoint: f64 = std::env::var("SENSORLINK_SETPOINT")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|v: &f64| v.is_finite())
            .unwrap_or(DEFAULT_SETPOINT);

        Ok(Self {
            telemetry_addr,
            command_addr,
            command_interval_ms,
            setpoint,
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

    info!("SensorLink Coordinator starting");
    info!("  Telemetry: {}", config.telemetry_addr);
    info!("  Commands: {} every {} ms", config.command_addr, config.command_interval_ms);
    info!("  Setpoint: {}", config.setpoint);

    let coordinator = Coordinator::bind(CoordinatorConfig {
        control: ControlConfig {
            telemetry_addr: config.telemetry_addr,
            command_addr: config.command_addr,
        },
        pacing: PacingConfig::command()
            .with_interval(Duration::from_millis(config.command_interval_ms)),
        setpoint: config.setpoint,
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

    let report = coordinator.run(LogBridge::new("distance"), cancel).await?;

    info!(
        "Stats: {} telemetry values ({} malformed), {} commands sent",
        report.telemetry.values_received, report.telemetry.malformed, report.commands.values_sent
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
