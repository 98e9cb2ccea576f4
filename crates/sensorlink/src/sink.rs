//! Downstream collaborators: frame sinks, command sinks and telemetry bridges

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::DecodeError;

/// Consumes decoded frame payloads.
///
/// May return a derived scalar (e.g. a distance estimate) which the
/// composition layer forwards as telemetry.
#[async_trait]
pub trait FrameSink: Send {
    async fn on_frame(&mut self, payload: Bytes) -> Result<Option<f64>, DecodeError>;
}

/// Receives command values from the control channel.
#[async_trait]
pub trait CommandSink: Send {
    async fn on_command(&mut self, value: f64);
}

/// Optional external republication of received telemetry.
#[async_trait]
pub trait TelemetryBridge: Send {
    async fn publish(&mut self, value: f64);
}

/// Stand-in perception stage: waits for `processing` then reports a fixed
/// estimate for every frame.
#[derive(Debug, Clone)]
pub struct FixedEstimateSink {
    estimate: f64,
    processing: Duration,
    frames: u64,
}

impl FixedEstimateSink {
    pub fn new(estimate: f64, processing: Duration) -> Self {
        Self {
            estimate,
            processing,
            frames: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[async_trait]
impl FrameSink for FixedEstimateSink {
    async fn on_frame(&mut self, payload: Bytes) -> Result<Option<f64>, DecodeError> {
        if !self.processing.is_zero() {
            tokio::time::sleep(self.processing).await;
        }
        self.frames += 1;
        debug!(len = payload.len(), estimate = self.estimate, "Frame processed");
        Ok(Some(self.estimate))
    }
}

/// Forwards payloads into an mpsc channel.
///
/// A closed receiver is reported as a decode failure so the receive loop
/// stops instead of silently discarding frames.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn on_frame(&mut self, payload: Bytes) -> Result<Option<f64>, DecodeError> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| DecodeError::new("frame channel closed"))?;
        Ok(None)
    }
}

/// Logs every command it receives.
#[derive(Debug, Default)]
pub struct LogCommandSink {
    last: Option<f64>,
}

impl LogCommandSink {
    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

#[async_trait]
impl CommandSink for LogCommandSink {
    async fn on_command(&mut self, value: f64) {
        if self.last != Some(value) {
            info!(command = value, "Command setpoint changed");
        } else {
            debug!(command = value, "Command received");
        }
        self.last = Some(value);
    }
}

/// Republishes telemetry to the log.
#[derive(Debug)]
pub struct LogBridge {
    topic: String,
}

impl LogBridge {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl TelemetryBridge for LogBridge {
    async fn publish(&mut self, value: f64) {
        info!(topic = %self.topic, value, "Telemetry published");
    }
}

/// Forwards values into an mpsc channel; full or closed channels drop the
/// value, matching the control channel's lossy contract.
pub struct ChannelValueSink {
    tx: mpsc::Sender<f64>,
}

impl ChannelValueSink {
    pub fn new(tx: mpsc::Sender<f64>) -> Self {
        Self { tx }
    }

    fn forward(&self, value: f64) {
        if self.tx.try_send(value).is_err() {
            debug!(value, "Value sink full or closed, dropping");
        }
    }
}

#[async_trait]
impl CommandSink for ChannelValueSink {
    async fn on_command(&mut self, value: f64) {
        self.forward(value);
    }
}

#[async_trait]
impl TelemetryBridge for ChannelValueSink {
    async fn publish(&mut self, value: f64) {
        self.forward(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_estimate_reports_constant() {
        let mut sink = FixedEstimateSink::new(10.0, Duration::ZERO);
        assert_eq!(sink.on_frame(Bytes::from_static(b"x")).await.unwrap(), Some(10.0));
        assert_eq!(sink.on_frame(Bytes::new()).await.unwrap(), Some(10.0));
        assert_eq!(sink.frames(), 2);
    }

    #[tokio::test]
    async fn fixed_estimate_simulates_processing_delay() {
        let mut sink = FixedEstimateSink::new(1.5, Duration::from_millis(50));
        let start = tokio::time::Instant::now();
        sink.on_frame(Bytes::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn channel_sink_errors_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);
        drop(rx);
        assert!(sink.on_frame(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn log_command_sink_tracks_last_value() {
        let mut sink = LogCommandSink::default();
        assert_eq!(sink.last(), None);
        sink.on_command(15.0).await;
        sink.on_command(15.0).await;
        sink.on_command(7.5).await;
        assert_eq!(sink.last(), Some(7.5));
    }

    #[tokio::test]
    async fn channel_value_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ChannelValueSink::new(tx);
        sink.on_command(1.0).await;
        sink.on_command(2.0).await;
        assert_eq!(rx.recv().await, Some(1.0));
        assert!(rx.try_recv().is_err());
    }
}
