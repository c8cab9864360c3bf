//! Per-device serial channel owner: command dispatch, response
//! correlation, and timeout (§4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shared::{Command, Device, Fault, FaultKind, Outcome, Token};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error_monitor::ErrorMonitor;
use crate::heartbeat::HeartbeatRegistry;
use crate::rpc::inflight::InFlightTable;
use crate::rpc::transport::{BoxedTransport, DialFn};

const READER_POLL_INTERVAL: Duration = Duration::from_millis(10);
const TIMER_TICK: Duration = Duration::from_millis(1);
const RECONNECT_BUDGET: Duration = Duration::from_secs(5);
const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("failed to connect to {0}")]
    ConnectFailed(Device),
    #[error("channel for {0} is permanently unavailable")]
    ChannelUnavailable(Device),
    #[error("multiplexer is already connected")]
    AlreadyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelStatus {
    Disconnected,
    Connected,
    PermanentlyFailed,
}

struct Channel {
    device: Device,
    write_half: AsyncMutex<Option<tokio::io::WriteHalf<BoxedTransport>>>,
    status: std::sync::Mutex<ChannelStatus>,
    table: InFlightTable,
}

impl Channel {
    fn new(device: Device) -> Self {
        Self {
            device,
            write_half: AsyncMutex::new(None),
            status: std::sync::Mutex::new(ChannelStatus::Disconnected),
            table: InFlightTable::new(),
        }
    }

    fn status(&self) -> ChannelStatus {
        *self.status.lock().expect("channel status poisoned")
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().expect("channel status poisoned") = status;
    }
}

/// A dispatched command awaiting its terminal [`Outcome`]. Returned by
/// [`RpcMultiplexer::send`] with the token already assigned, so the caller
/// can log `CommandSent` before awaiting the response.
pub struct PendingCommand {
    pub token: Token,
    pub device: Device,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingCommand {
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Outcome::Cancelled)
    }
}

/// Owns one serial channel per [`Device`]; see §4.4.
pub struct RpcMultiplexer {
    dial: DialFn,
    crc_enabled: bool,
    error_monitor: Arc<ErrorMonitor>,
    heartbeats: Arc<HeartbeatRegistry>,
    channels: HashMap<Device, Arc<Channel>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    connected: std::sync::atomic::AtomicBool,
}

impl RpcMultiplexer {
    pub fn new(dial: DialFn, crc_enabled: bool, error_monitor: Arc<ErrorMonitor>, heartbeats: Arc<HeartbeatRegistry>) -> Arc<Self> {
        let channels = Device::ALL
            .into_iter()
            .map(|d| (d, Arc::new(Channel::new(d))))
            .collect();
        Arc::new(Self {
            dial,
            crc_enabled,
            error_monitor,
            heartbeats,
            channels,
            tasks: std::sync::Mutex::new(Vec::new()),
            connected: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Opens all channels. Idempotent: re-entering when already connected
    /// is a no-op. On any failure, closes those already opened.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RpcError> {
        if self.connected.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }

        let mut opened = Vec::new();
        for device in Device::ALL {
            match (self.dial)(device).await {
                Ok(transport) => {
                    let channel = self.channels[&device].clone();
                    let (read_half, write_half) = tokio::io::split(transport);
                    *channel.write_half.lock().await = Some(write_half);
                    channel.set_status(ChannelStatus::Connected);
                    opened.push(device);

                    let task = tokio::spawn(Self::reader_loop(
                        self.clone(),
                        channel,
                        read_half,
                    ));
                    self.tasks.lock().expect("task list poisoned").push(task);
                }
                Err(_) => {
                    for d in opened {
                        self.channels[&d].set_status(ChannelStatus::Disconnected);
                    }
                    return Err(RpcError::ConnectFailed(device));
                }
            }
        }

        let timer = tokio::spawn(Self::timer_loop(self.clone()));
        self.tasks.lock().expect("task list poisoned").push(timer);

        self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Dispatches a command to `device`, returning a handle whose token is
    /// already assigned. Never holds a lock across the system call.
    pub async fn send(
        &self,
        device: Device,
        opcode: &'static str,
        args: &str,
        deadline: Instant,
    ) -> Result<PendingCommand, RpcError> {
        let channel = self
            .channels
            .get(&device)
            .expect("Device is a closed enum covering every channel");

        if channel.status() == ChannelStatus::PermanentlyFailed {
            return Err(RpcError::ChannelUnavailable(device));
        }

        let (tx, rx) = oneshot::channel();
        let token = channel.table.allocate_and_insert(device, deadline, tx);
        let command = Command::new(device, token, opcode, args);
        let line = shared::wire::encode_command(&command, self.crc_enabled);

        let write_result = {
            let mut guard = channel.write_half.lock().await;
            match guard.as_mut() {
                Some(w) => w.write_all(line.as_bytes()).await,
                None => Err(std::io::Error::other("channel not connected")),
            }
        };

        if let Err(e) = write_result {
            channel.table.remove(token);
            self.error_monitor.notify(Fault::new(
                FaultKind::SerialIo,
                "rpc_multiplexer",
                format!("write to {device} failed: {e}"),
            ));
            return Err(RpcError::ChannelUnavailable(device));
        }

        Ok(PendingCommand { token, device, rx })
    }

    /// Cancels all in-flight requests for `device`.
    pub async fn abort_in_flight(&self, device: Device) {
        if let Some(channel) = self.channels.get(&device) {
            for entry in channel.table.drain_all() {
                let _ = entry.waiter.send(Outcome::Cancelled);
            }
        }
    }

    /// Aborts all in-flight requests and closes all channels.
    pub async fn shutdown(&self) {
        for device in Device::ALL {
            self.abort_in_flight(device).await;
            if let Some(channel) = self.channels.get(&device) {
                *channel.write_half.lock().await = None;
                channel.set_status(ChannelStatus::Disconnected);
            }
        }
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        self.connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Re-dials `device` and spawns a fresh reader task, abandoning
    /// whatever reader task is currently registered for it (used to recover
    /// from a `ThreadStall` — the old task is presumed hung, not just
    /// disconnected, so there is nothing to hand back to it).
    pub async fn restart_channel(self: &Arc<Self>, device: Device) -> Result<(), RpcError> {
        let channel = self.channels[&device].clone();
        channel.set_status(ChannelStatus::Disconnected);
        *channel.write_half.lock().await = None;

        match (self.dial)(device).await {
            Ok(transport) => {
                let (read_half, write_half) = tokio::io::split(transport);
                *channel.write_half.lock().await = Some(write_half);
                channel.set_status(ChannelStatus::Connected);
                let task = tokio::spawn(Self::reader_loop(self.clone(), channel, read_half));
                self.tasks.lock().expect("task list poisoned").push(task);
                Ok(())
            }
            Err(_) => Err(RpcError::ConnectFailed(device)),
        }
    }

    pub fn is_permanently_failed(&self, device: Device) -> bool {
        self.channels
            .get(&device)
            .map(|c| c.status() == ChannelStatus::PermanentlyFailed)
            .unwrap_or(true)
    }

    async fn reader_loop(
        mux: Arc<RpcMultiplexer>,
        channel: Arc<Channel>,
        read_half: tokio::io::ReadHalf<BoxedTransport>,
    ) {
        let heartbeat_name: &'static str = match channel.device {
            Device::PowerSupply => "reader:power_supply",
            Device::PulseGen => "reader:pulse_gen",
            Device::Pump => "reader:pump",
        };

        let mut reader = BufReader::new(read_half);

        loop {
            if channel.status() == ChannelStatus::PermanentlyFailed {
                return;
            }

            let mut line = String::new();
            mux.heartbeats.publish(heartbeat_name);
            let read_result = tokio::time::timeout(READER_POLL_INTERVAL, reader.read_line(&mut line)).await;

            match read_result {
                Err(_elapsed) => continue, // poll interval only, not an error
                Ok(Ok(0)) => {
                    // EOF
                    Self::on_channel_lost(&mux, &channel, "end of stream").await;
                }
                Ok(Ok(_n)) => {
                    Self::handle_line(&mux, &channel, &line);
                }
                Ok(Err(e)) => {
                    Self::on_channel_lost(&mux, &channel, &e.to_string()).await;
                }
            }

            if channel.status() == ChannelStatus::Disconnected {
                match Self::reconnect(&mux, &channel).await {
                    Some(new_read_half) => reader = BufReader::new(new_read_half),
                    None => return, // permanently failed; reader task exits
                }
            }
        }
    }

    fn handle_line(mux: &Arc<RpcMultiplexer>, channel: &Arc<Channel>, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match shared::wire::decode_response(line, mux.crc_enabled, std::time::SystemTime::now()) {
            Ok(response) => {
                if let Some(entry) = channel.table.remove(response.token) {
                    let _ = entry.waiter.send(Outcome::Response(response));
                } else {
                    debug!(device = %channel.device, token = response.token, "response with no matching in-flight entry");
                }
            }
            Err(e) => {
                debug!(device = %channel.device, error = %e, "frame rejected");
                // Keep the fault message constant per device: `e`'s Display
                // embeds the offending CRC/parse values, which would defeat
                // dedup by making every mismatch look like a distinct fault.
                mux.error_monitor.notify(Fault::new(
                    FaultKind::SerialCrc,
                    "rpc_multiplexer",
                    format!("{}: frame rejected", channel.device),
                ));
            }
        }
    }

    async fn on_channel_lost(mux: &Arc<RpcMultiplexer>, channel: &Arc<Channel>, reason: &str) {
        if channel.status() != ChannelStatus::Connected {
            return; // already handled by a previous iteration
        }
        channel.set_status(ChannelStatus::Disconnected);
        *channel.write_half.lock().await = None;
        mux.error_monitor.notify(Fault::new(
            FaultKind::SerialIo,
            "rpc_multiplexer",
            format!("{} lost: {reason}", channel.device),
        ));
        warn!(device = %channel.device, reason, "serial channel lost, will attempt reconnect");
    }

    /// Attempts reconnect with exponential backoff, capped at 5 s total
    /// wall-clock (§4.4 Reconnect policy). Returns the new read half on
    /// success, or `None` once the budget is exhausted, at which point the
    /// channel is marked permanently failed and every in-flight entry is
    /// resolved with `ChannelUnavailable` (scenario S3).
    async fn reconnect(
        mux: &Arc<RpcMultiplexer>,
        channel: &Arc<Channel>,
    ) -> Option<tokio::io::ReadHalf<BoxedTransport>> {
        let started = Instant::now();
        let mut backoff = RECONNECT_INITIAL_BACKOFF;

        loop {
            if started.elapsed() >= RECONNECT_BUDGET {
                channel.set_status(ChannelStatus::PermanentlyFailed);
                for entry in channel.table.drain_all() {
                    let _ = entry.waiter.send(Outcome::ChannelUnavailable);
                }
                mux.error_monitor.notify(Fault::new(
                    FaultKind::SerialIo,
                    "rpc_multiplexer",
                    format!("{} permanently failed after reconnect budget exhausted", channel.device),
                ));
                return None;
            }

            match (mux.dial)(channel.device).await {
                Ok(transport) => {
                    let (new_read, new_write) = tokio::io::split(transport);
                    *channel.write_half.lock().await = Some(new_write);
                    channel.set_status(ChannelStatus::Connected);
                    return Some(new_read);
                }
                Err(_) => {
                    tokio::time::sleep(backoff.min(RECONNECT_MAX_BACKOFF)).await;
                    backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
                }
            }
        }
    }

    async fn timer_loop(mux: Arc<RpcMultiplexer>) {
        let mut interval = tokio::time::interval(TIMER_TICK);
        loop {
            interval.tick().await;
            let now = Instant::now();
            for device in Device::ALL {
                let channel = &mux.channels[&device];
                for entry in channel.table.take_expired(now) {
                    let _ = entry.waiter.send(Outcome::Timeout);
                    mux.error_monitor.notify(Fault::new(
                        FaultKind::SerialTimeout,
                        "rpc_multiplexer",
                        format!("{device} token {} timed out", entry.token),
                    ));
                }
            }
        }
    }
}
