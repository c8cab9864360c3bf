//! Background CSV event-trail writer with quota-based rotation (§4.5).

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use shared::{Fault, FaultKind, LogEvent, LogEventKind, RunId, RunOutcome};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error_monitor::ErrorMonitor;
use crate::heartbeat::HeartbeatRegistry;
use crate::ring_buffer::{OverflowPolicy, RingBuffer};

pub const LOG_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_QUOTA_BYTES: u64 = 512 * 1024 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const FLUSH_BYTES: usize = 4096;
const DRAIN_BATCH: usize = 64;
const DROPPED_EVENT_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_TASK: &str = "logger";
const CONTROL_QUEUE_CAPACITY: usize = 8;

/// Control-plane commands the worker processes between queue drains
/// (§4.5 `start_run`/`finish_run`/`stop`). Each carries an acknowledgement
/// channel so the caller can await the file actually having switched (or
/// closed) before proceeding, rather than racing the worker.
enum WorkerCommand {
    StartRun(RunId, oneshot::Sender<()>),
    FinishRun(RunOutcome, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("storage root missing: {0}")]
    StorageMissing(PathBuf),
    #[error("storage full or write failed: {0}")]
    StorageFull(#[source] std::io::Error),
}

impl From<&LoggerError> for FaultKind {
    fn from(e: &LoggerError) -> Self {
        match e {
            LoggerError::StorageMissing(_) => FaultKind::StorageMissing,
            LoggerError::StorageFull(_) => FaultKind::StorageFull,
        }
    }
}

fn escape_field(s: &str) -> String {
    s.replace('\\', "\\\\").replace(',', "\\,").replace('\n', "\\n")
}

fn format_line(event: &LogEvent, epoch: Instant, run_id: RunId) -> String {
    let monotonic_ns = event.monotonic_ns_since(epoch);
    let wall: DateTime<Utc> = SystemTime::now().into();
    let (kind, device, token, status, message) = match &event.kind {
        LogEventKind::StepEntered { protocol, step } => {
            ("step_entered", String::new(), String::new(), String::new(), format!("{protocol}/{step}"))
        }
        LogEventKind::CommandSent { device, token, opcode } => {
            ("command_sent", device.to_string(), token.to_string(), String::new(), opcode.to_string())
        }
        LogEventKind::ResponseReceived { token, status, latency_us } => (
            "response_received",
            String::new(),
            token.to_string(),
            status.to_string(),
            format!("latency_us={latency_us}"),
        ),
        LogEventKind::ParameterChanged { key, old, new } => {
            ("parameter_changed", String::new(), String::new(), String::new(), format!("{key}: {old} -> {new}"))
        }
        LogEventKind::Fault { kind, message } => {
            ("fault", String::new(), String::new(), String::new(), format!("{kind}: {message}"))
        }
        LogEventKind::HeartbeatMissed { thread } => {
            ("heartbeat_missed", String::new(), String::new(), String::new(), thread.to_string())
        }
        LogEventKind::RunStart { run_id } => ("run_start", String::new(), String::new(), String::new(), run_id.to_string()),
        LogEventKind::RunEnd { run_id, outcome } => {
            ("run_end", String::new(), String::new(), String::new(), format!("{run_id}: {outcome}"))
        }
        LogEventKind::EventsDropped { count } => {
            ("events_dropped", String::new(), String::new(), String::new(), count.to_string())
        }
    };

    format!(
        "{monotonic_ns},{wall},{run_id},{state},{kind},{device},{token},{status},{message}\n",
        wall = wall.to_rfc3339(),
        state = event.state,
        device = escape_field(&device),
        token = token,
        status = status,
        message = escape_field(&message),
    )
}

const CSV_HEADER: &str =
    "monotonic_ns,wall_utc_iso,run_id,state,kind,device,token,status,message\n";

/// Handle producers use to enqueue events; cheap to clone, never blocks
/// (§4.5 Back-pressure).
#[derive(Clone)]
pub struct LoggerHandle {
    queue: Arc<RingBuffer<LogEvent>>,
}

impl LoggerHandle {
    /// Enqueues `event`. Never fails; if the ring is full the event is
    /// dropped and counted (the worker surfaces this as `EventsDropped`).
    pub fn log(&self, event: LogEvent) {
        self.queue.try_push(event);
    }
}

/// Owns the background worker that drains the event queue to the CSV trail
/// under `<root>/logs/` (§4.5, §6 Persistent layout).
pub struct Logger {
    handle: LoggerHandle,
    worker: Option<JoinHandle<()>>,
    control: mpsc::Sender<WorkerCommand>,
}

struct Worker {
    queue: Arc<RingBuffer<LogEvent>>,
    control: mpsc::Receiver<WorkerCommand>,
    logs_dir: PathBuf,
    quota_bytes: u64,
    error_monitor: Arc<ErrorMonitor>,
    heartbeats: Arc<HeartbeatRegistry>,
    epoch: Instant,
    file: Option<std::fs::File>,
    current_path: Option<PathBuf>,
    run_id: RunId,
    bytes_since_flush: usize,
    last_flush: Instant,
    last_dropped_report: Instant,
    last_reported_dropped: usize,
}

impl Logger {
    /// Spawns the worker task. `logs_dir` is created if missing and a run
    /// file for the boot-time (pre-`start_run`) period is opened
    /// immediately, keyed by a run id synthesized from the current time.
    pub fn start(
        logs_dir: PathBuf,
        quota_bytes: u64,
        error_monitor: Arc<ErrorMonitor>,
        heartbeats: Arc<HeartbeatRegistry>,
    ) -> Self {
        let queue = Arc::new(RingBuffer::new(LOG_QUEUE_CAPACITY, OverflowPolicy::DropNewest));
        let handle = LoggerHandle { queue: queue.clone() };
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);

        let mut worker = Worker {
            queue,
            control: control_rx,
            logs_dir,
            quota_bytes,
            error_monitor,
            heartbeats,
            epoch: Instant::now(),
            file: None,
            current_path: None,
            run_id: RunId::new_at(SystemTime::now()),
            bytes_since_flush: 0,
            last_flush: Instant::now(),
            last_dropped_report: Instant::now(),
            last_reported_dropped: 0,
        };

        let task = tokio::spawn(async move { worker.run().await });
        Self {
            handle,
            worker: Some(task),
            control: control_tx,
        }
    }

    pub fn handle(&self) -> LoggerHandle {
        self.handle.clone()
    }

    pub fn log(&self, event: LogEvent) {
        self.handle.log(event);
    }

    /// Drains events queued under the old run id, then opens a fresh run
    /// file keyed by `run_id` and stamps subsequent rows with it (§4.5,
    /// §6 Persistent layout: `<timestamp>_<run_id>.csv`). Awaits the
    /// worker having switched before returning, so the caller's own
    /// `RunStart` event is guaranteed to land in the new file.
    pub async fn start_run(&self, run_id: RunId) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control.send(WorkerCommand::StartRun(run_id, ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Drains and flushes the current run file so its terminating event is
    /// durable before the coordinator moves on (§4.5 Shutdown: "`finish_run`
    /// writes a terminating event including the outcome" — the event
    /// itself is enqueued by the caller via [`Logger::log`]; this ensures
    /// it reaches storage).
    pub async fn finish_run(&self, outcome: RunOutcome) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control.send(WorkerCommand::FinishRun(outcome, ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Signals the worker to drain fully, flush, close, and join (§4.5
    /// Shutdown).
    pub async fn stop(&mut self) {
        if let Some(task) = self.worker.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self.control.send(WorkerCommand::Shutdown(ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
            let _ = task.await;
        }
    }
}

impl Worker {
    async fn run(&mut self) {
        if let Err(e) = self.open_new_run_file() {
            self.report(&e);
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeats.publish(HEARTBEAT_TASK);
                    self.drain_batch();
                    self.maybe_flush();
                    self.maybe_report_dropped();
                }
                cmd = self.control.recv() => {
                    match cmd {
                        Some(WorkerCommand::StartRun(run_id, ack)) => {
                            self.drain_all();
                            self.flush_now();
                            self.run_id = run_id;
                            if let Err(e) = self.open_new_run_file() {
                                self.report(&e);
                            }
                            let _ = ack.send(());
                        }
                        Some(WorkerCommand::FinishRun(outcome, ack)) => {
                            debug!(%outcome, run_id = %self.run_id, "logger finishing run");
                            self.drain_all();
                            self.flush_now();
                            let _ = ack.send(());
                        }
                        Some(WorkerCommand::Shutdown(ack)) => {
                            self.drain_all();
                            self.flush_now();
                            self.file = None;
                            let _ = ack.send(());
                            return;
                        }
                        None => {
                            // All senders dropped without an explicit `stop()`.
                            self.drain_all();
                            self.flush_now();
                            self.file = None;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_batch(&mut self) {
        for _ in 0..DRAIN_BATCH {
            let Some(event) = self.queue.try_pop() else {
                break;
            };
            let line = format_line(&event, self.epoch, self.run_id);
            self.write_line(&line);
        }
    }

    /// Drains the queue to exhaustion, ignoring the per-iteration batch
    /// cap — used only at run/process boundaries, never on the regular
    /// tick, so an unbounded producer can't starve the control path.
    fn drain_all(&mut self) {
        while let Some(event) = self.queue.try_pop() {
            let line = format_line(&event, self.epoch, self.run_id);
            self.write_line(&line);
        }
    }

    fn flush_now(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        self.bytes_since_flush = 0;
        self.last_flush = Instant::now();
    }

    fn write_line(&mut self, line: &str) {
        let Some(file) = self.file.as_mut() else {
            return; // dropped to memory-only mode until reopen succeeds
        };
        match file.write_all(line.as_bytes()) {
            Ok(()) => {
                self.bytes_since_flush += line.len();
            }
            Err(e) => {
                self.file = None;
                self.report(&LoggerError::StorageFull(e));
            }
        }
    }

    fn maybe_flush(&mut self) {
        let due = self.bytes_since_flush >= FLUSH_BYTES || self.last_flush.elapsed() >= FLUSH_INTERVAL;
        if !due {
            return;
        }
        self.flush_now();
        self.enforce_quota();

        if self.file.is_none() {
            if let Err(e) = self.open_new_run_file() {
                self.report(&e);
            }
        }
    }

    fn maybe_report_dropped(&mut self) {
        if self.last_dropped_report.elapsed() < DROPPED_EVENT_INTERVAL {
            return;
        }
        self.last_dropped_report = Instant::now();
        let total = self.queue.dropped();
        if total > self.last_reported_dropped {
            let delta = (total - self.last_reported_dropped) as u64;
            self.last_reported_dropped = total;
            let event = LogEvent::new(
                shared::SystemState::Idle,
                LogEventKind::EventsDropped { count: delta },
            );
            debug!(dropped = delta, "log events dropped since last report");
            let line = format_line(&event, self.epoch, self.run_id);
            self.write_line(&line);
        }
    }

    fn open_new_run_file(&mut self) -> Result<(), LoggerError> {
        std::fs::create_dir_all(&self.logs_dir)
            .map_err(|_| LoggerError::StorageMissing(self.logs_dir.clone()))?;

        let now: DateTime<Utc> = SystemTime::now().into();
        let filename = format!("{}_{}.csv", now.to_rfc3339(), self.run_id);
        let path = self.logs_dir.join(filename);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(LoggerError::StorageFull)?;
        file.write_all(CSV_HEADER.as_bytes()).map_err(LoggerError::StorageFull)?;

        self.file = Some(file);
        self.current_path = Some(path);
        Ok(())
    }

    /// Deletes oldest completed run files until `storage_bytes_used` is
    /// under `quota_bytes` (§4.5, §8 boundary: exactly at quota rotates at
    /// least one file before the next write is accepted).
    fn enforce_quota(&mut self) {
        let Ok(entries) = std::fs::read_dir(&self.logs_dir) else {
            return;
        };

        let mut files: Vec<(PathBuf, std::time::SystemTime, u64)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "csv"))
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                let modified = meta.modified().ok()?;
                Some((e.path(), modified, meta.len()))
            })
            .collect();

        let mut total: u64 = files.iter().map(|(_, _, len)| len).sum();
        if total <= self.quota_bytes {
            return;
        }

        files.sort_by_key(|(_, modified, _)| *modified);

        for (path, _, len) in files {
            if total <= self.quota_bytes {
                break;
            }
            if Some(&path) == self.current_path.as_ref() {
                continue; // never rotate the run currently being written
            }
            if std::fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(len);
            }
        }

        if total > self.quota_bytes {
            warn!(logs_dir = %self.logs_dir.display(), "storage still over quota after rotating all eligible run files");
        }
        self.report(&LoggerError::StorageFull(std::io::Error::other("quota exceeded, rotated oldest runs")));
    }

    fn report(&self, e: &LoggerError) {
        let kind: FaultKind = e.into();
        error!(error = %e, "logger storage failure");
        self.error_monitor
            .notify(Fault::new(kind, "logger", e.to_string()));
    }
}

/// Total bytes used by completed run files under `logs_dir`.
pub fn storage_bytes_used(logs_dir: &Path) -> u64 {
    std::fs::read_dir(logs_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::SystemState;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_events_to_run_file() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mut logger = Logger::start(dir.path().to_path_buf(), DEFAULT_QUOTA_BYTES, monitor, heartbeats);

        logger.log(LogEvent::new(
            SystemState::Idle,
            LogEventKind::RunStart { run_id: RunId::new_at(SystemTime::now()) },
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        logger.stop().await;

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert!(content.starts_with(CSV_HEADER));
        assert!(content.contains("run_start"));
    }

    #[tokio::test]
    async fn start_run_opens_a_new_file_keyed_by_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mut logger = Logger::start(dir.path().to_path_buf(), DEFAULT_QUOTA_BYTES, monitor, heartbeats);

        let run_id = RunId::new_at(SystemTime::now());
        logger.start_run(run_id).await;
        logger.log(LogEvent::new(SystemState::Running, LogEventKind::RunStart { run_id }));
        logger.finish_run(RunOutcome::Completed).await;
        logger.stop().await;

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        // One file for the boot-time period opened by `start()`, one for the run.
        assert_eq!(files.len(), 2);
        let run_file = files
            .iter()
            .map(|e| e.as_ref().unwrap().path())
            .find(|p| p.to_string_lossy().contains(&run_id.to_string()))
            .expect("run file keyed by run_id");
        let content = std::fs::read_to_string(run_file).unwrap();
        assert!(content.contains(&format!(",{run_id},")));
    }

    #[test]
    fn escapes_commas_and_newlines() {
        assert_eq!(escape_field("a,b\nc"), "a\\,b\\nc");
    }

    #[tokio::test]
    async fn full_ring_buffer_increments_dropped_counter() {
        let queue = Arc::new(RingBuffer::<LogEvent>::new(2, OverflowPolicy::DropNewest));
        let handle = LoggerHandle { queue: queue.clone() };
        for _ in 0..4 {
            handle.log(LogEvent::new(SystemState::Idle, LogEventKind::HeartbeatMissed { thread: "x" }));
        }
        assert_eq!(queue.dropped(), 2);
    }
}
