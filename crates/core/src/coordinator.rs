//! The supervisor FSM (§4.7). Owns one instance each of the long-lived
//! subsystems and, only in `Running`/`Aborting`, at most one
//! [`ProtocolEngine`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use shared::{Device, Fault, FaultKind, LogEvent, LogEventKind, RunId, RunOutcome, SystemState};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::DeviceConfig;
use crate::display::{DisplayDriver, DisplayFrame};
use crate::error_monitor::ErrorMonitor;
use crate::heartbeat::HeartbeatRegistry;
use crate::input::{InputEvent, InputSource};
use crate::logger::{Logger, LoggerHandle};
use crate::parameter_store::ParameterStore;
use crate::protocol::engine::CancelToken;
use crate::protocol::{Protocol, ProtocolEngine};
use crate::rpc::RpcMultiplexer;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const KNOWN_READER_TASKS: [&str; 3] = ["reader:power_supply", "reader:pulse_gen", "reader:pump"];
const INPUT_POLLER_TASK: &str = "input_poller";

/// Maps a reader task's heartbeat name back to the device it serves, so a
/// `ThreadStall` fault on that task can be resolved by restarting just that
/// channel instead of escalating to `Error` (§4.3 restart policy).
fn reader_device_for_task(task: &str) -> Option<Device> {
    match task {
        "reader:power_supply" => Some(Device::PowerSupply),
        "reader:pulse_gen" => Some(Device::PulseGen),
        "reader:pump" => Some(Device::Pump),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("config error at boot: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("required device permanently unavailable at boot: {0}")]
    DeviceUnavailable(shared::Device),
    #[error("persistent storage unavailable at boot: {0}")]
    StorageUnavailable(String),
}

/// Why the main loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
}

struct RunningEngine {
    run_id: RunId,
    cancel: CancelToken,
    outcome_rx: oneshot::Receiver<RunOutcome>,
}

/// The supervisor. Single-threaded from the perspective of state
/// transitions (§4.3 Escalation, §5 Ordering guarantees).
pub struct SystemCoordinator<D: DisplayDriver, I: InputSource> {
    state: SystemState,
    /// Mirrors `state`, refreshed once per tick, so the parameter-change
    /// observer (registered once at boot, invoked on whatever thread calls
    /// `ParameterStore::set`) can stamp `ParameterChanged` events without
    /// borrowing the coordinator (§4.2 logging from a held lock is
    /// forbidden, so the observer can't call back into the coordinator).
    current_state: Arc<std::sync::Mutex<SystemState>>,
    root: PathBuf,
    protocol: Protocol,
    params: Arc<ParameterStore>,
    error_monitor: Arc<ErrorMonitor>,
    heartbeats: Arc<HeartbeatRegistry>,
    rpc: Arc<RpcMultiplexer>,
    logger: Logger,
    logger_handle: LoggerHandle,
    display: D,
    input: I,
    selected_parameter: shared::Parameter,
    running: Option<RunningEngine>,
    last_heartbeat_check: Instant,
}

impl<D: DisplayDriver, I: InputSource> SystemCoordinator<D, I> {
    /// Runs the `Boot -> Init -> Idle` sequence (§4.7 State machine).
    /// `error_monitor` and `heartbeats` must be the same instances `rpc`
    /// was constructed with, so faults the multiplexer reports and
    /// heartbeats its readers publish are visible to this coordinator's
    /// main loop.
    pub async fn boot(
        root: PathBuf,
        config: &DeviceConfig,
        quota_bytes: u64,
        rpc: Arc<RpcMultiplexer>,
        error_monitor: Arc<ErrorMonitor>,
        heartbeats: Arc<HeartbeatRegistry>,
        display: D,
        input: I,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let params = Arc::new(ParameterStore::with_defaults());
        for default in &config.parameter_defaults {
            let _ = params.set(default.key, default.value);
        }

        rpc.connect().await.map_err(|e| match e {
            crate::rpc::RpcError::ConnectFailed(device) => CoordinatorError::DeviceUnavailable(device),
            other => CoordinatorError::StorageUnavailable(other.to_string()),
        })?;

        let logs_dir = root.join("logs");
        let logger = Logger::start(logs_dir, quota_bytes, error_monitor.clone(), heartbeats.clone());
        let logger_handle = logger.handle();

        // Restartable `ThreadStall` sources resolve themselves by re-dialing
        // the affected channel; anything else (e.g. the logger) is handed
        // back to the coordinator's tick, which escalates to `Error`.
        error_monitor.register_escalation({
            let rpc = rpc.clone();
            Arc::new(move |fault: Fault| -> BoxFuture<'static, bool> {
                let rpc = rpc.clone();
                Box::pin(async move {
                    if fault.kind != FaultKind::ThreadStall {
                        return false;
                    }
                    let Some(device) = reader_device_for_task(fault.origin) else {
                        return false;
                    };
                    warn!(%device, "restarting stalled reader channel");
                    rpc.restart_channel(device).await.is_ok()
                })
            })
        });

        let current_state = Arc::new(std::sync::Mutex::new(SystemState::Idle));

        params.subscribe({
            let logger_handle = logger_handle.clone();
            let current_state = current_state.clone();
            Box::new(move |change: crate::parameter_store::Change| {
                let state = *current_state.lock().expect("current_state poisoned");
                logger_handle.log(LogEvent::new(
                    state,
                    LogEventKind::ParameterChanged {
                        key: change.parameter,
                        old: change.old,
                        new: change.new,
                    },
                ));
            })
        });

        info!(protocol = %config.protocol_name, "coordinator booted");

        Ok(Self {
            state: SystemState::Idle,
            current_state,
            root,
            protocol: config.to_protocol(),
            params,
            error_monitor,
            heartbeats,
            rpc,
            logger,
            logger_handle,
            display,
            input,
            selected_parameter: shared::Parameter::Voltage,
            running: None,
            last_heartbeat_check: Instant::now(),
        })
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    /// The main loop (§4.7 Main loop): drain faults, service transitions,
    /// check heartbeats, refresh the display, every `TICK_INTERVAL`. Runs
    /// until `shutdown` resolves.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<ShutdownReason>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                event = self.input.next() => {
                    if let Some(event) = event {
                        self.handle_input(event).await;
                    }
                }
                reason = &mut shutdown => {
                    let reason = reason.unwrap_or(ShutdownReason::Signal);
                    info!(?reason, "coordinator shutting down");
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    async fn tick(&mut self) {
        *self.current_state.lock().expect("current_state poisoned") = self.state;
        self.drain_faults().await;
        self.poll_running_engine().await;
        self.check_heartbeats();
        self.refresh_display();
    }

    async fn drain_faults(&mut self) {
        for fault in self.error_monitor.dispatch().await {
            self.escalate(fault).await;
        }
    }

    async fn escalate(&mut self, fault: Fault) {
        warn!(%fault, "fault escalated to coordinator");
        self.logger_handle.log(LogEvent::new(
            self.state,
            LogEventKind::Fault { kind: fault.kind, message: fault.message },
        ));

        let unrecoverable = matches!(
            fault.kind,
            FaultKind::StorageMissing | FaultKind::ThreadStall
        );

        if unrecoverable && self.state != SystemState::Error {
            self.enter_error().await;
        }
    }

    async fn enter_error(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let outcome = running.outcome_rx.await.unwrap_or(RunOutcome::Aborted);
            self.logger_handle.log(LogEvent::new(
                SystemState::Aborting,
                LogEventKind::RunEnd { run_id: running.run_id, outcome: outcome.clone() },
            ));
            self.logger.finish_run(outcome).await;
        }
        self.state = SystemState::Error;
        error!("coordinator entered Error state");
    }

    async fn poll_running_engine(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };

        match running.outcome_rx.try_recv() {
            Ok(outcome) => {
                let run_id = running.run_id;
                self.running = None;
                self.logger_handle
                    .log(LogEvent::new(self.state, LogEventKind::RunEnd { run_id, outcome: outcome.clone() }));
                self.logger.finish_run(outcome.clone()).await;
                self.state = match outcome {
                    RunOutcome::Completed => SystemState::Finished,
                    RunOutcome::Aborted | RunOutcome::Failed { .. } => SystemState::Idle,
                };
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
            Err(oneshot::error::TryRecvError::Closed) => {
                self.running = None;
                self.state = SystemState::Error;
            }
        }
    }

    fn check_heartbeats(&mut self) {
        if self.last_heartbeat_check.elapsed() < HEARTBEAT_CHECK_INTERVAL {
            return;
        }
        self.last_heartbeat_check = Instant::now();

        let mut known: Vec<&'static str> = KNOWN_READER_TASKS.to_vec();
        known.push("logger");
        known.push(INPUT_POLLER_TASK);

        for task in self.heartbeats.stalled(&known, Instant::now()) {
            self.logger_handle
                .log(LogEvent::new(self.state, LogEventKind::HeartbeatMissed { thread: task }));
            self.error_monitor
                .notify(Fault::new(FaultKind::ThreadStall, task, format!("{task} missed its heartbeat")));
        }
    }

    fn refresh_display(&mut self) {
        let frame = DisplayFrame {
            state: self.state,
            selected_parameter: Some(self.selected_parameter),
            selected_value: Some(self.params.get(self.selected_parameter)),
            message: None,
        };
        if let Err(e) = self.display.render(&frame) {
            self.error_monitor
                .notify(Fault::new(FaultKind::DisplayIo, "coordinator", e.to_string()));
        }
    }

    async fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::Rotate(delta) => self.rotate_parameter(delta),
            InputEvent::ShortPress => self.handle_short_press().await,
            InputEvent::LongPress => self.handle_long_press().await,
        }
    }

    /// In `Idle`, rotation cycles which parameter is selected. In `Running`
    /// (and `Aborting`), the selection is already fixed for the run, so
    /// rotation instead adjusts the selected parameter's live value —
    /// scenario S6: the run keeps using the pre-snapshot value, and the
    /// resulting `ParameterChanged` event lands after the run's `RunEnd` in
    /// the log, since it is only enqueued once `ParameterStore::set`
    /// actually changes the value. Any other state ignores rotation.
    fn rotate_parameter(&mut self, delta: i8) {
        match self.state {
            SystemState::Idle => {
                let all = shared::Parameter::ALL;
                let current = all.iter().position(|p| *p == self.selected_parameter).unwrap_or(0);
                let len = all.len() as i64;
                let next = (current as i64 + delta as i64).rem_euclid(len) as usize;
                self.selected_parameter = all[next];
            }
            SystemState::Running | SystemState::Aborting => {
                let step = self.selected_parameter.step() * delta as f64;
                let current = self.params.get(self.selected_parameter);
                let _ = self.params.set(self.selected_parameter, current + step);
            }
            _ => {}
        }
    }

    async fn handle_short_press(&mut self) {
        match self.state {
            SystemState::Idle => self.start_run().await,
            SystemState::Finished | SystemState::Error => self.acknowledge().await,
            _ => {}
        }
    }

    async fn handle_long_press(&mut self) {
        if self.state == SystemState::Running {
            self.abort_run();
        }
    }

    async fn start_run(&mut self) {
        let run_id = RunId::new_at(std::time::SystemTime::now());
        self.logger.start_run(run_id).await;
        let snapshot = self.params.snapshot();
        let (cancel, outcome_rx) = ProtocolEngine::spawn(
            self.protocol.clone(),
            run_id,
            snapshot,
            self.rpc.clone(),
            self.logger_handle.clone(),
            self.error_monitor.clone(),
        );
        self.running = Some(RunningEngine { run_id, cancel, outcome_rx });
        self.state = SystemState::Running;
    }

    fn abort_run(&mut self) {
        if let Some(running) = self.running.as_ref() {
            running.cancel.cancel();
            self.state = SystemState::Aborting;
        }
    }

    async fn acknowledge(&mut self) {
        match self.state {
            SystemState::Finished => self.state = SystemState::Idle,
            SystemState::Error => {
                if self.rpc.connect().await.is_ok() {
                    self.state = SystemState::Idle;
                } // else: stay in Error (§4.7)
            }
            _ => {}
        }
    }

    /// Flushes the logger, closes the multiplexer, and returns once every
    /// task has joined (§4.7, depth-first: engine -> multiplexer -> logger).
    async fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let _ = running.outcome_rx.await;
        }
        self.rpc.shutdown().await;
        self.logger.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::NullDisplay;
    use crate::input::ChannelInput;
    use crate::rpc::transport::DialFn;
    use futures::FutureExt;

    fn echo_dial() -> DialFn {
        Arc::new(|_device| {
            async move {
                let (client, server) = tokio::io::duplex(1024);
                tokio::spawn(async move {
                    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
                    let (read_half, mut write_half) = tokio::io::split(server);
                    let mut reader = tokio::io::BufReader::new(read_half);
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
                });
                Ok(Box::new(client) as crate::rpc::BoxedTransport)
            }
            .boxed()
        })
    }

    fn sample_config() -> DeviceConfig {
        use crate::config::{ParameterDefault, StepConfig};
        DeviceConfig {
            protocol_name: "lysis_reference".into(),
            steps: vec![
                StepConfig {
                    name: "prepare".into(),
                    device: shared::Device::PowerSupply,
                    opcode: "enable".into(),
                    arguments: String::new(),
                    args_param: Some(shared::Parameter::Voltage),
                    deadline_ms: 2000,
                    retry_count: 2,
                },
                StepConfig {
                    name: "pulse".into(),
                    device: shared::Device::PulseGen,
                    opcode: "fire".into(),
                    arguments: String::new(),
                    args_param: Some(shared::Parameter::Frequency),
                    deadline_ms: 2000,
                    retry_count: 2,
                },
            ],
            abort_sequence: vec![],
            parameter_defaults: vec![ParameterDefault { key: shared::Parameter::Voltage, value: 12.0 }],
        }
    }

    #[tokio::test]
    async fn boots_into_idle() {
        let config = sample_config();
        let error_monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let rpc = RpcMultiplexer::new(echo_dial(), false, error_monitor.clone(), heartbeats.clone());
        let dir = tempfile::tempdir().unwrap();
        let (_tx, input) = ChannelInput::new(4);
        let coordinator = SystemCoordinator::boot(
            dir.path().to_path_buf(),
            &config,
            crate::logger::DEFAULT_QUOTA_BYTES,
            rpc,
            error_monitor,
            heartbeats,
            NullDisplay::default(),
            input,
        )
        .await
        .unwrap();
        assert_eq!(coordinator.state(), SystemState::Idle);
    }

    #[tokio::test]
    async fn short_press_in_idle_starts_and_completes_a_run() {
        let config = sample_config();
        let error_monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let rpc = RpcMultiplexer::new(echo_dial(), false, error_monitor.clone(), heartbeats.clone());
        let dir = tempfile::tempdir().unwrap();
        let (tx, input) = ChannelInput::new(4);
        let mut coordinator = SystemCoordinator::boot(
            dir.path().to_path_buf(),
            &config,
            crate::logger::DEFAULT_QUOTA_BYTES,
            rpc,
            error_monitor,
            heartbeats,
            NullDisplay::default(),
            input,
        )
        .await
        .unwrap();

        coordinator.handle_short_press().await;
        assert_eq!(coordinator.state(), SystemState::Running);

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            coordinator.poll_running_engine().await;
            if coordinator.state() == SystemState::Finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.state(), SystemState::Finished);
        drop(tx);
    }

    #[tokio::test]
    async fn rotate_parameter_wraps_around() {
        let config = sample_config();
        let error_monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let rpc = RpcMultiplexer::new(echo_dial(), false, error_monitor.clone(), heartbeats.clone());
        let dir = tempfile::tempdir().unwrap();
        let (_tx, input) = ChannelInput::new(4);
        let mut coordinator = SystemCoordinator::boot(
            dir.path().to_path_buf(),
            &config,
            crate::logger::DEFAULT_QUOTA_BYTES,
            rpc,
            error_monitor,
            heartbeats,
            NullDisplay::default(),
            input,
        )
        .await
        .unwrap();
        let start = coordinator.selected_parameter;
        for _ in 0..shared::Parameter::ALL.len() {
            coordinator.rotate_parameter(1);
        }
        assert_eq!(coordinator.selected_parameter, start);
    }

    #[tokio::test]
    async fn rotate_parameter_adjusts_value_while_running() {
        let config = sample_config();
        let error_monitor = Arc::new(ErrorMonitor::new());
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let rpc = RpcMultiplexer::new(echo_dial(), false, error_monitor.clone(), heartbeats.clone());
        let dir = tempfile::tempdir().unwrap();
        let (_tx, input) = ChannelInput::new(4);
        let mut coordinator = SystemCoordinator::boot(
            dir.path().to_path_buf(),
            &config,
            crate::logger::DEFAULT_QUOTA_BYTES,
            rpc,
            error_monitor,
            heartbeats,
            NullDisplay::default(),
            input,
        )
        .await
        .unwrap();

        coordinator.handle_short_press().await;
        assert_eq!(coordinator.state(), SystemState::Running);

        let selected = coordinator.selected_parameter;
        let before = coordinator.params.get(selected);
        coordinator.rotate_parameter(1);
        let after = coordinator.params.get(selected);
        assert_eq!(after, before + selected.step());
        // Selection itself does not move while a run owns it.
        assert_eq!(coordinator.selected_parameter, selected);
    }
}
