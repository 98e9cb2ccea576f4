//! Role runners: the vehicle, perception and coordinator processes
//!
//! Each runner spawns its long-running loops on a `TaskTracker`, ties them
//! to one cancellation token and drains them within [`SHUTDOWN_TIMEOUT`].
//!
//! ```text
//! vehicle ──frames/TCP──▶ perception ──telemetry/UDP──▶ coordinator
//!    ▲                                                      │
//!    └──────────────────command/UDP─────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::control::{
    ChannelKind, ControlConfig, PacedSender, PacingConfig, ReceiverStats, SenderStats,
    ValueReceiver, ValueSender,
};
use crate::protocol::{DEFAULT_FRAME_PORT, MAX_FRAME_SIZE, SHUTDOWN_TIMEOUT};
use crate::server::{BroadcastServer, ServerConfig, ServerStats};
use crate::sink::{CommandSink, FrameSink, TelemetryBridge};
use crate::source::FrameSource;
use crate::transport::FrameConsumer;

/// Speed setpoint the coordinator holds when nothing else is configured
pub const DEFAULT_SETPOINT: f64 = 15.0;

#[derive(Debug, Clone)]
pub struct VehicleConfig {
    pub server: ServerConfig,
    /// Where commands are received
    pub command_addr: SocketAddr,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            command_addr: ControlConfig::default().command_addr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerceptionConfig {
    /// Frame server to connect to
    pub frame_addr: SocketAddr,
    pub max_frame_size: usize,
    /// Where telemetry is sent
    pub telemetry_addr: SocketAddr,
    pub pacing: PacingConfig,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            frame_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_FRAME_PORT)),
            max_frame_size: MAX_FRAME_SIZE,
            telemetry_addr: ControlConfig::default().telemetry_addr,
            pacing: PacingConfig::telemetry(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub control: ControlConfig,
    pub pacing: PacingConfig,
    pub setpoint: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            pacing: PacingConfig::command(),
            setpoint: DEFAULT_SETPOINT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VehicleReport {
    pub server: ServerStats,
    pub commands: ReceiverStats,
}

#[derive(Debug, Clone, Default)]
pub struct PerceptionReport {
    pub frames: u64,
    pub telemetry: SenderStats,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorReport {
    pub telemetry: ReceiverStats,
    pub commands: SenderStats,
}

/// Vehicle side with its sockets bound: frame server plus command receiver
pub struct Vehicle {
    server: BroadcastServer,
    commands: ValueReceiver,
}

impl Vehicle {
    pub async fn bind(config: VehicleConfig) -> Result<Self> {
        let server = BroadcastServer::bind(config.server)
            .await
            .context("Failed to bind frame server")?;
        let commands = ValueReceiver::bind(ChannelKind::Command, config.command_addr)
            .await
            .context("Failed to bind command receiver")?;
        Ok(Self { server, commands })
    }

    pub fn frame_addr(&self) -> std::io::Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn command_addr(&self) -> std::io::Result<SocketAddr> {
        self.commands.local_addr()
    }

    /// Stream frames from `source` and hand received commands to `commands`.
    ///
    /// Returns when the source ends or `cancel` fires.
    pub async fn run<S, C>(
        self,
        source: S,
        commands: C,
        cancel: CancellationToken,
    ) -> Result<VehicleReport>
    where
        S: FrameSource + 'static,
        C: CommandSink + 'static,
    {
        let tracker = TaskTracker::new();
        let tasks = cancel.child_token();
        let receiver = Arc::new(self.commands);
        let (latest_tx, latest_rx) = watch::channel(None);

        let recv_receiver = Arc::clone(&receiver);
        let recv_cancel = tasks.clone();
        tracker.spawn(async move {
            recv_receiver
                .run(
                    move |v| {
                        latest_tx.send_replace(Some(v));
                    },
                    recv_cancel,
                )
                .await
        });
        tracker.spawn(dispatch_commands(latest_rx, commands, tasks.clone()));

        let server = self.server;
        let handle = server.handle();
        let server_cancel = tasks.clone();
        let mut server_task = tracker.spawn(async move {
            let mut source = source;
            server.run(&mut source, server_cancel).await
        });

        // On cancel the server gets the same drain budget as everything else
        let joined = tokio::select! {
            joined = &mut server_task => Some(joined),
            _ = cancel.cancelled() => None,
        };
        tasks.cancel();
        drain("vehicle", &tracker).await;

        let server_stats = match joined {
            Some(joined) => joined.context("Frame server task failed")?,
            None => finished(server_task)
                .await
                .unwrap_or_else(|| handle.stats()),
        };
        Ok(VehicleReport {
            server: server_stats,
            commands: receiver.stats(),
        })
    }
}

pub async fn run_vehicle<S, C>(
    config: VehicleConfig,
    source: S,
    commands: C,
    cancel: CancellationToken,
) -> Result<VehicleReport>
where
    S: FrameSource + 'static,
    C: CommandSink + 'static,
{
    Vehicle::bind(config).await?.run(source, commands, cancel).await
}

/// Consume frames, turning each sink-derived value into paced telemetry.
///
/// Returns when the frame stream ends or `cancel` fires. A truncated frame
/// or a sink decode failure is returned as an error after the telemetry
/// sender has drained.
pub async fn run_perception<S>(
    config: PerceptionConfig,
    sink: S,
    cancel: CancellationToken,
) -> Result<PerceptionReport>
where
    S: FrameSink + 'static,
{
    let mut consumer = FrameConsumer::connect(config.frame_addr, config.max_frame_size)
        .await
        .context("Failed to connect to frame server")?;
    let sender = ValueSender::bind(ChannelKind::Telemetry, config.telemetry_addr)
        .await
        .context("Failed to bind telemetry sender")?;
    let paced = PacedSender::new(sender, config.pacing.interval, config.pacing.mode)
        .context("Invalid telemetry pacing")?;
    info!(server = %consumer.peer(), telemetry = %config.telemetry_addr, "Perception started");

    let tracker = TaskTracker::new();
    let (latest_tx, latest_rx) = watch::channel(None);

    // Ends by itself once the receive loop drops the publisher
    let telemetry_task = tracker.spawn(paced.run(latest_rx, cancel.clone()));

    let receive_cancel = cancel.clone();
    let receive_task = tracker.spawn(async move {
        let mut sink = sink;
        consumer
            .receive_loop(
                &mut sink,
                |v| {
                    latest_tx.send_replace(Some(v));
                },
                &receive_cancel,
            )
            .await
    });

    let received = receive_task.await.context("Receive task failed");
    drain("perception", &tracker).await;
    let telemetry = finished(telemetry_task).await.unwrap_or_default();

    let frames = received?.context("Frame stream failed")?;
    Ok(PerceptionReport { frames, telemetry })
}

/// Coordinator side with its telemetry socket bound
pub struct Coordinator {
    config: CoordinatorConfig,
    telemetry: ValueReceiver,
    commands: PacedSender,
}

impl Coordinator {
    pub async fn bind(config: CoordinatorConfig) -> Result<Self> {
        let telemetry = ValueReceiver::bind(ChannelKind::Telemetry, config.control.telemetry_addr)
            .await
            .context("Failed to bind telemetry receiver")?;
        let sender = ValueSender::bind(ChannelKind::Command, config.control.command_addr)
            .await
            .context("Failed to bind command sender")?;
        let commands = PacedSender::new(sender, config.pacing.interval, config.pacing.mode)
            .context("Invalid command pacing")?;
        Ok(Self {
            config,
            telemetry,
            commands,
        })
    }

    pub fn telemetry_addr(&self) -> std::io::Result<SocketAddr> {
        self.telemetry.local_addr()
    }

    /// Hold the setpoint on the command path and republish telemetry to
    /// `bridge` until `cancel` fires.
    pub async fn run<B>(self, bridge: B, cancel: CancellationToken) -> Result<CoordinatorReport>
    where
        B: TelemetryBridge + 'static,
    {
        let tracker = TaskTracker::new();
        let receiver = Arc::new(self.telemetry);
        let (latest_tx, latest_rx) = watch::channel(None);
        let (setpoint_tx, setpoint_rx) = watch::channel(Some(self.config.setpoint));
        info!(
            setpoint = self.config.setpoint,
            command = %self.config.control.command_addr,
            "Coordinator started"
        );

        let recv_receiver = Arc::clone(&receiver);
        let recv_cancel = cancel.clone();
        tracker.spawn(async move {
            recv_receiver
                .run(
                    move |v| {
                        latest_tx.send_replace(Some(v));
                    },
                    recv_cancel,
                )
                .await
        });
        tracker.spawn(republish(latest_rx, bridge, cancel.clone()));
        let command_task = tracker.spawn(self.commands.run(setpoint_rx, cancel.clone()));

        cancel.cancelled().await;
        drain("coordinator", &tracker).await;
        drop(setpoint_tx);

        Ok(CoordinatorReport {
            telemetry: receiver.stats(),
            commands: finished(command_task).await.unwrap_or_default(),
        })
    }
}

pub async fn run_coordinator<B>(
    config: CoordinatorConfig,
    bridge: B,
    cancel: CancellationToken,
) -> Result<CoordinatorReport>
where
    B: TelemetryBridge + 'static,
{
    Coordinator::bind(config).await?.run(bridge, cancel).await
}

/// Deliver the newest command to `sink`; intermediate values may be skipped.
async fn dispatch_commands<C: CommandSink>(
    mut latest: watch::Receiver<Option<f64>>,
    mut sink: C,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                let value = *latest.borrow_and_update();
                if let Some(value) = value {
                    sink.on_command(value).await;
                }
            }
        }
    }
    debug!("Command dispatch stopped");
}

async fn republish<B: TelemetryBridge>(
    mut latest: watch::Receiver<Option<f64>>,
    mut bridge: B,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                let value = *latest.borrow_and_update();
                if let Some(value) = value {
                    bridge.publish(value).await;
                }
            }
        }
    }
    debug!("Telemetry republish stopped");
}

async fn drain(role: &'static str, tracker: &TaskTracker) {
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait())
        .await
        .is_err()
    {
        warn!(role, "Shutdown timed out after {}s", SHUTDOWN_TIMEOUT.as_secs());
    }
}

/// Output of a task that has already finished; stragglers are aborted.
async fn finished<T>(handle: JoinHandle<T>) -> Option<T> {
    if !handle.is_finished() {
        handle.abort();
        return None;
    }
    match handle.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "Task failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelValueSink, FixedEstimateSink};
    use crate::source::ChannelSource;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::net::{TcpStream, UdpSocket};
    use tokio::sync::mpsc;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn udp_target() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind(loopback()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_text(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram expected")
            .unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn coordinator_holds_setpoint_and_republishes_telemetry() {
        let (command_socket, command_addr) = udp_target().await;
        let config = CoordinatorConfig {
            control: ControlConfig {
                telemetry_addr: loopback(),
                command_addr,
            },
            pacing: PacingConfig::command().with_interval(Duration::from_millis(20)),
            setpoint: 15.0,
        };
        let coordinator = Coordinator::bind(config).await.unwrap();
        let telemetry_addr = coordinator.telemetry_addr().unwrap();

        let (bridge_tx, mut bridge_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(coordinator.run(ChannelValueSink::new(bridge_tx), cancel.clone()));

        assert_eq!(recv_text(&command_socket).await, "15");
        assert_eq!(recv_text(&command_socket).await, "15");

        let sender = ValueSender::bind(ChannelKind::Telemetry, telemetry_addr).await.unwrap();
        sender.send_value(10.0).await.unwrap();
        let published = tokio::time::timeout(Duration::from_secs(2), bridge_rx.recv())
            .await
            .unwrap();
        assert_eq!(published, Some(10.0));

        cancel.cancel();
        let report = tokio::time::timeout(SHUTDOWN_TIMEOUT + Duration::from_secs(1), run)
            .await
            .expect("coordinator drains within the shutdown bound")
            .unwrap()
            .unwrap();
        assert_eq!(report.telemetry.values_received, 1);
        assert!(report.commands.values_sent >= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn vehicle_streams_frames_and_dispatches_commands() {
        let config = VehicleConfig {
            server: ServerConfig {
                listen_addr: loopback(),
                expected_consumers: 1,
                ..ServerConfig::default()
            },
            command_addr: loopback(),
        };
        let vehicle = Vehicle::bind(config).await.unwrap();
        let frame_addr = vehicle.frame_addr().unwrap();
        let command_addr = vehicle.command_addr().unwrap();

        let (frame_tx, source) = ChannelSource::channel(4);
        let (command_tx, mut command_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(vehicle.run(
            source,
            ChannelValueSink::new(command_tx),
            cancel.clone(),
        ));

        let mut consumer = FrameConsumer::connect(frame_addr, MAX_FRAME_SIZE).await.unwrap();
        frame_tx.send(Bytes::from_static(b"camera")).await.unwrap();
        assert_eq!(consumer.recv().await.unwrap().unwrap(), Bytes::from_static(b"camera"));

        let sender = ValueSender::bind(ChannelKind::Command, command_addr).await.unwrap();
        sender.send_value(15.0).await.unwrap();
        let command = tokio::time::timeout(Duration::from_secs(2), command_rx.recv())
            .await
            .unwrap();
        assert_eq!(command, Some(15.0));

        // Source end stops the vehicle
        drop(frame_tx);
        let report = tokio::time::timeout(SHUTDOWN_TIMEOUT + Duration::from_secs(1), run)
            .await
            .expect("vehicle stops when its source ends")
            .unwrap()
            .unwrap();
        assert_eq!(report.server.frames_produced, 1);
        assert_eq!(report.commands.values_received, 1);
        assert!(consumer.recv().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn vehicle_shutdown_not_held_by_stalled_consumer() {
        let config = VehicleConfig {
            server: ServerConfig {
                listen_addr: loopback(),
                expected_consumers: 1,
                write_timeout: Duration::from_secs(12),
                ..ServerConfig::default()
            },
            command_addr: loopback(),
        };
        let vehicle = Vehicle::bind(config).await.unwrap();
        let frame_addr = vehicle.frame_addr().unwrap();

        let (frame_tx, source) = ChannelSource::channel(1);
        let (command_tx, _command_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(vehicle.run(
            source,
            ChannelValueSink::new(command_tx),
            cancel.clone(),
        ));

        // Never reads
        let _stalled = TcpStream::connect(frame_addr).await.unwrap();
        tokio::spawn(async move {
            for _ in 0..40 {
                if frame_tx.send(Bytes::from(vec![1u8; 1024 * 1024])).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = std::time::Instant::now();
        cancel.cancel();
        let report = tokio::time::timeout(SHUTDOWN_TIMEOUT + Duration::from_secs(1), run)
            .await
            .expect("vehicle shutdown bounded by the drain timeout")
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < SHUTDOWN_TIMEOUT);
        assert_eq!(report.server.consumers_accepted, 1);
        assert!(report.server.frames_produced > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn perception_turns_frames_into_telemetry() {
        let server = BroadcastServer::bind(ServerConfig {
            listen_addr: loopback(),
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        let frame_addr = server.local_addr().unwrap();
        let (frame_tx, mut source) = ChannelSource::channel(4);
        let server_task = tokio::spawn(async move {
            server.run(&mut source, CancellationToken::new()).await
        });

        let (telemetry_socket, telemetry_addr) = udp_target().await;
        let config = PerceptionConfig {
            frame_addr,
            max_frame_size: MAX_FRAME_SIZE,
            telemetry_addr,
            pacing: PacingConfig::telemetry().with_interval(Duration::from_millis(10)),
        };
        let cancel = CancellationToken::new();
        let run = tokio::spawn(run_perception(
            config,
            FixedEstimateSink::new(10.0, Duration::ZERO),
            cancel.clone(),
        ));

        frame_tx.send(Bytes::from_static(b"frame-1")).await.unwrap();
        assert_eq!(recv_text(&telemetry_socket).await, "10");

        frame_tx.send(Bytes::from_static(b"frame-2")).await.unwrap();
        drop(frame_tx);
        server_task.await.unwrap();

        let report = tokio::time::timeout(SHUTDOWN_TIMEOUT + Duration::from_secs(1), run)
            .await
            .expect("perception stops when the stream closes")
            .unwrap()
            .unwrap();
        assert_eq!(report.frames, 2);
        assert!(report.telemetry.values_sent >= 1);
    }

    #[tokio::test]
    async fn perception_fails_without_server() {
        let unused = tokio::net::TcpListener::bind(loopback()).await.unwrap();
        let frame_addr = unused.local_addr().unwrap();
        drop(unused);

        let config = PerceptionConfig {
            frame_addr,
            ..PerceptionConfig::default()
        };
        let result = run_perception(
            config,
            FixedEstimateSink::new(10.0, Duration::ZERO),
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn coordinator_bind_conflict_is_fatal() {
        let (_taken, telemetry_addr) = udp_target().await;
        let config = CoordinatorConfig {
            control: ControlConfig {
                telemetry_addr,
                command_addr: loopback(),
            },
            ..CoordinatorConfig::default()
        };
        assert!(Coordinator::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn zero_pacing_is_rejected_at_startup() {
        let config = CoordinatorConfig {
            control: ControlConfig {
                telemetry_addr: loopback(),
                command_addr: loopback(),
            },
            pacing: PacingConfig::command().with_interval(Duration::ZERO),
            ..CoordinatorConfig::default()
        };
        assert!(Coordinator::bind(config).await.is_err());
    }
}
