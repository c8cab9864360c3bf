//! `--simulate` mode: in-process synthetic peripherals standing in for the
//! real USB-serial hardware, and a timer-driven input source standing in
//! for the gpio rotary encoder. Demos and integration tests without a
//! bench (§6 CLI surface).

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use instrumentd_core::{BoxedTransport, ChannelInput, DialFn, HeartbeatRegistry, InputEvent};
use shared::Device;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const INPUT_POLLER_HEARTBEAT: &str = "input_poller";
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);

/// A synthetic peripheral always answers `ok` immediately; it exists to
/// exercise the runtime backbone end to end, not to model real instrument
/// timing or failure modes.
async fn run_peripheral(server: tokio::io::DuplexStream) {
    let (read_half, mut write_half) = tokio::io::split(server);
    let mut reader = BufReader::new(read_half);
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let token = line.split_whitespace().next().unwrap_or("0");
        let reply = format!("{token} ok\r\n");
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

pub fn dial() -> DialFn {
    Arc::new(|_device: Device| {
        async move {
            let (client, server) = tokio::io::duplex(4096);
            tokio::spawn(run_peripheral(server));
            Ok(Box::new(client) as BoxedTransport)
        }
        .boxed()
    })
}

/// Drives a `ChannelInput` from a fixed cadence instead of a real encoder,
/// so `--simulate` runs can exercise a full idle→run→finished cycle
/// unattended: one short press every 5 s, nothing else. Publishes its own
/// heartbeat on a much shorter tick so the coordinator's stall detection
/// (3 s threshold) never mistakes the 5 s action cadence for a hang.
async fn run_input_poller(tx: mpsc::Sender<InputEvent>, heartbeats: Arc<HeartbeatRegistry>) {
    let mut action_ticker = tokio::time::interval(Duration::from_secs(5));
    let mut heartbeat_ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = heartbeat_ticker.tick() => {
                heartbeats.publish(INPUT_POLLER_HEARTBEAT);
            }
            _ = action_ticker.tick() => {
                if tx.send(InputEvent::ShortPress).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Spawns the synthetic input poller and returns the sender (kept alive by
/// the caller so the `ChannelInput` doesn't observe a closed channel) and
/// the `ChannelInput` itself.
pub fn spawn(heartbeats: Arc<HeartbeatRegistry>) -> (mpsc::Sender<InputEvent>, ChannelInput) {
    let (tx, input) = ChannelInput::new(16);
    tokio::spawn(run_input_poller(tx.clone(), heartbeats));
    (tx, input)
}
