//! Async driver that runs an [AshEngine] over a port.
//!
//! The driver is single-task and run-to-completion: each call to [UartAsh::poll] runs the engine's
//!  send path, writes its output, waits (bounded) for bytes from the NCP and feeds them to the
//!  engine. Received DATA payloads and fatal errors are forwarded to the client through a bounded
//!  channel. If the client falls behind, payloads stay in the engine's receive queue, and the
//!  engine's flow control eventually tells the NCP to stop sending.

use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use crate::config::AshConfig;
use crate::consts::{TIME_RST, TIME_RST_CHECK};
use crate::counters::AshCounters;
use crate::engine::{AshEngine, AshEvent};
use crate::port::{AshPort, PortOpener};
use crate::status::AshStatus;

const NOTIFICATION_QUEUE_LEN: usize = 16;
const READ_BUF_LEN: usize = 256;

/// What the client receives from the driver
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AshNotification {
    /// a DATA payload, in the order in which the NCP sent them
    Frame(Bytes),
    /// The link is dead and needs [UartAsh::reset_ncp] and [UartAsh::start] to recover. Raised once
    ///  per failure.
    FatalError(AshStatus),
}

pub struct UartAsh {
    config: AshConfig,
    opener: Arc<dyn PortOpener>,
    engine: AshEngine,
    port: Option<Box<dyn AshPort>>,
    read_buf: Vec<u8>,
    notifications: mpsc::Sender<AshNotification>,
    /// a fatal error that could not be forwarded yet
    pending_fatal: Option<AshStatus>,
}

impl UartAsh {
    pub fn new(config: AshConfig, opener: Arc<dyn PortOpener>) -> anyhow::Result<(UartAsh, mpsc::Receiver<AshNotification>)> {
        config.validate()?;

        let (send, recv) = mpsc::channel(NOTIFICATION_QUEUE_LEN);
        let engine = AshEngine::new(config.xon_xoff_is_error());
        Ok((UartAsh {
            config,
            opener,
            engine,
            port: None,
            read_buf: vec![0; READ_BUF_LEN],
            notifications: send,
            pending_fatal: None,
        }, recv))
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    pub fn is_idle(&self) -> bool {
        self.engine.is_idle()
    }

    pub fn counters(&self) -> &AshCounters {
        self.engine.counters()
    }

    pub fn read_and_clear_counters(&mut self) -> AshCounters {
        self.engine.read_and_clear_counters()
    }

    /// see [AshEngine::response_timeout]
    pub fn response_timeout(&self) -> Duration {
        AshEngine::response_timeout()
    }

    /// (Re-)opens the port and arms sending RST. The RST is sent by [UartAsh::start].
    pub async fn reset_ncp(&mut self) -> AshStatus {
        info!("resetting NCP on {}", self.config.path);
        self.close_port().await;
        self.engine.reset();
        self.pending_fatal = None;

        match self.opener.open(&self.config).await {
            Ok(port) => {
                self.port = Some(port);
                AshStatus::Success
            }
            Err(e) => {
                error!("error opening port {}: {}", self.config.path, e);
                self.engine.fail(AshStatus::ErrorSerialInit);
                self.forward_notifications();
                AshStatus::HostFatalError
            }
        }
    }

    /// Sends RST and waits for the NCP's RSTACK. The port is opened first if necessary. RST is
    ///  sent only once: if the NCP does not answer in time, the client needs to reset and start
    ///  again.
    pub async fn start(&mut self) -> AshStatus {
        if self.engine.is_connected() {
            return AshStatus::InvalidCall;
        }
        if self.port.is_none() {
            let status = self.reset_ncp().await;
            if !status.is_success() {
                return status;
            }
        }

        info!("ASH starting");
        let deadline = Instant::now() + TIME_RST;
        while Instant::now() < deadline {
            if let Err(e) = self.poll(TIME_RST_CHECK).await {
                error!("error while waiting for RSTACK: {}", e);
                break;
            }

            if self.engine.is_connected() {
                return AshStatus::Success;
            }
            if self.engine.fatal_status().is_some() {
                break;
            }
        }

        error!("ASH start failed, no valid RSTACK from NCP");
        AshStatus::HostFatalError
    }

    /// Tears down the session and closes the port. Received payloads that were not forwarded
    ///  yet are discarded.
    pub async fn stop(&mut self) {
        self.engine.stop();
        self.close_port().await;
        info!("ASH stopped");
    }

    /// Queues a DATA payload and sends as much as the window allows
    pub async fn send(&mut self, payload: &[u8]) -> AshStatus {
        let status = self.engine.send(payload);
        if status.is_success() {
            if let Err(e) = self.flush().await {
                debug!("error sending DATA frame: {}", e);
            }
        }
        self.forward_notifications();
        status
    }

    /// One engine tick: sends pending output, waits up to `max_wait` for bytes from the NCP and
    ///  processes them. This must be called regularly for timers to work.
    pub async fn poll(&mut self, max_wait: Duration) -> anyhow::Result<()> {
        let result = self.do_poll(max_wait).await;
        self.forward_notifications();
        result
    }

    /// Polls repeatedly for the given duration
    pub async fn poll_for(&mut self, duration: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.poll((deadline - now).min(TIME_RST_CHECK)).await?;
        }
    }

    async fn do_poll(&mut self, max_wait: Duration) -> anyhow::Result<()> {
        self.engine.send_exec();
        self.flush().await?;

        let Some(port) = self.port.as_mut() else {
            bail!("port is not open");
        };

        match timeout(max_wait, port.read(&mut self.read_buf)).await {
            Err(_) => {}
            Ok(Ok(0)) => {
                self.on_port_failure();
                bail!("port was closed by the NCP side");
            }
            Ok(Ok(n)) => {
                self.engine.receive(&self.read_buf[..n]);
            }
            Ok(Err(e)) => {
                self.on_port_failure();
                return Err(e.into());
            }
        }

        self.flush().await
    }

    /// Writes the engine's output to the port until the engine has nothing more to send
    async fn flush(&mut self) -> anyhow::Result<()> {
        loop {
            let out = self.engine.take_output();
            if out.is_empty() {
                return Ok(());
            }

            let Some(port) = self.port.as_mut() else {
                bail!("port is not open, discarding {} bytes", out.len());
            };

            let written = match port.write_all(&out).await {
                Ok(()) => port.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                self.on_port_failure();
                return Err(e.into());
            }

            self.engine.send_exec();
        }
    }

    fn on_port_failure(&mut self) {
        error!("lost connection to NCP on {}", self.config.path);
        self.port = None;
        self.engine.fail(AshStatus::ErrorSerialInit);
    }

    async fn close_port(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.shutdown().await {
                debug!("error closing port: {}", e);
            }
        }
    }

    /// Moves received payloads and fatal errors from the engine to the notification channel, as
    ///  far as the channel has room
    fn forward_notifications(&mut self) {
        while let Some(event) = self.engine.next_event() {
            if let AshEvent::FatalError(status) = event {
                self.pending_fatal = Some(status);
            }
        }

        while self.engine.pending_frames() > 0 {
            let permit = match self.notifications.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(_)) => return,
                Err(TrySendError::Closed(_)) => {
                    warn!("notification receiver was dropped, discarding received frames");
                    while self.engine.take_frame().is_some() {}
                    break;
                }
            };
            if let Some(frame) = self.engine.take_frame() {
                permit.send(AshNotification::Frame(frame));
            }
        }

        if let Some(status) = self.pending_fatal {
            match self.notifications.try_send(AshNotification::FatalError(status)) {
                Ok(()) | Err(TrySendError::Closed(_)) => self.pending_fatal = None,
                Err(TrySendError::Full(_)) => {}
            }
        }
    }
}

/// Drains all notifications that are currently available, without waiting
pub fn drain_notifications(recv: &mut mpsc::Receiver<AshNotification>) -> Vec<AshNotification> {
    let mut result = Vec::new();
    loop {
        match recv.try_recv() {
            Ok(n) => result.push(n),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return result,
        }
    }
}
