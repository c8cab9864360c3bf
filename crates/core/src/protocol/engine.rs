//! Executes one [`super::Protocol`] as a finite-state program (§4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shared::{Fault, FaultKind, LogEvent, LogEventKind, Outcome, RunId, RunOutcome, Status, SystemState};
use tokio::sync::{oneshot, Notify};

use super::{Next, Protocol, StepDef};
use crate::error_monitor::ErrorMonitor;
use crate::logger::LoggerHandle;
use crate::parameter_store::Snapshot;
use crate::rpc::RpcMultiplexer;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const ABORT_STEP_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol has no steps")]
    EmptyProtocol,
}

/// Cooperative cancellation signal shared between the coordinator and a
/// running engine task (§9 Design Notes, "prefer explicit cancellation
/// tokens over signal-style interrupts").
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelToken::cancel`] has been called, immediately
    /// if it already has (§5 Cancellation & timeouts: "unblocks any current
    /// await within 10 ms").
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the running-protocol task. The coordinator holds the `CancelToken`
/// and awaits the outcome receiver; at most one instance exists at a time,
/// only in `Running`/`Aborting` (§4.7).
pub struct ProtocolEngine;

impl ProtocolEngine {
    /// Spawns the protocol task and returns a cancellation handle plus the
    /// one-shot outcome channel (§4.6 Termination outcomes).
    pub fn spawn(
        protocol: Protocol,
        run_id: RunId,
        params: Snapshot,
        rpc: Arc<RpcMultiplexer>,
        logger: LoggerHandle,
        error_monitor: Arc<ErrorMonitor>,
    ) -> (CancelToken, oneshot::Receiver<RunOutcome>) {
        let cancel = CancelToken::new();
        let cancel_for_task = cancel.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = run_protocol(protocol, run_id, params, rpc, logger, error_monitor, cancel_for_task).await;
            let _ = tx.send(outcome);
        });

        (cancel, rx)
    }
}

fn resolve_args(step: &StepDef, params: &Snapshot) -> String {
    match step.args_param {
        Some(key) => format!("{:.3}", params.get(key)),
        None => step.args.to_string(),
    }
}

async fn run_protocol(
    protocol: Protocol,
    run_id: RunId,
    params: Snapshot,
    rpc: Arc<RpcMultiplexer>,
    logger: LoggerHandle,
    error_monitor: Arc<ErrorMonitor>,
    cancel: CancelToken,
) -> RunOutcome {
    logger.log(LogEvent::new(SystemState::Running, LogEventKind::RunStart { run_id }));

    let mut idx = 0usize;
    while idx < protocol.steps.len() {
        if cancel.is_cancelled() {
            let outcome = run_abort(&protocol, &rpc, &logger, &error_monitor).await;
            logger.log(LogEvent::new(SystemState::Aborting, LogEventKind::RunEnd { run_id, outcome: outcome.clone() }));
            return outcome;
        }

        let step = &protocol.steps[idx];
        logger.log(LogEvent::new(
            SystemState::Running,
            LogEventKind::StepEntered { protocol: protocol.name, step: step.name },
        ));

        match run_step(step, &params, &rpc, &logger, &cancel).await {
            Ok(next) => idx = next,
            Err(reason) => {
                error_monitor.notify(Fault::new(FaultKind::ProtocolAbort, "protocol_engine", &reason));
                let outcome = run_abort(&protocol, &rpc, &logger, &error_monitor).await;
                logger.log(LogEvent::new(SystemState::Aborting, LogEventKind::RunEnd { run_id, outcome: outcome.clone() }));
                return outcome;
            }
        }
    }

    logger.log(LogEvent::new(
        SystemState::Running,
        LogEventKind::RunEnd { run_id, outcome: RunOutcome::Completed },
    ));
    RunOutcome::Completed
}

/// Runs one step to completion, retrying per its policy. Returns the index
/// of the next step, or a failure reason once attempts are exhausted.
async fn run_step(
    step: &StepDef,
    params: &Snapshot,
    rpc: &Arc<RpcMultiplexer>,
    logger: &LoggerHandle,
    cancel: &CancelToken,
) -> Result<usize, String> {
    let args = resolve_args(step, params);
    let max_attempts = step.retry_count.max(1);

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            rpc.abort_in_flight(step.device).await;
            return Err(format!("{}: cancelled", step.name));
        }

        let deadline = Instant::now() + step.deadline;
        let pending = match rpc.send(step.device, step.opcode, &args, deadline).await {
            Ok(p) => p,
            Err(e) => return Err(format!("{}: {e}", step.name)),
        };
        logger.log(LogEvent::new(
            SystemState::Running,
            LogEventKind::CommandSent { device: step.device, token: pending.token, opcode: step.opcode },
        ));
        let started = Instant::now();

        let outcome = tokio::select! {
            o = pending.wait() => o,
            _ = cancel.cancelled() => {
                rpc.abort_in_flight(step.device).await;
                return Err(format!("{}: cancelled", step.name));
            }
        };

        match outcome {
            Outcome::Response(resp) if resp.status == Status::Ok => {
                logger.log(LogEvent::new(
                    SystemState::Running,
                    LogEventKind::ResponseReceived {
                        token: resp.token,
                        status: resp.status,
                        latency_us: started.elapsed().as_micros() as u64,
                    },
                ));
                return Ok(match step.next {
                    Next::Unconditional(n) => n,
                    Next::Guarded(f) => f(&resp),
                });
            }
            Outcome::Response(resp) => {
                logger.log(LogEvent::new(
                    SystemState::Running,
                    LogEventKind::ResponseReceived {
                        token: resp.token,
                        status: resp.status,
                        latency_us: started.elapsed().as_micros() as u64,
                    },
                ));
                if attempt == max_attempts {
                    return Err(format!("{}: device returned {}", step.name, resp.status));
                }
            }
            Outcome::Timeout => {
                if attempt == max_attempts {
                    return Err(format!("{}: timed out", step.name));
                }
            }
            Outcome::Cancelled => return Err(format!("{}: cancelled", step.name)),
            Outcome::ChannelUnavailable => return Err(format!("{}: channel unavailable", step.name)),
        }

        tokio::time::sleep(RETRY_BACKOFF).await;
    }

    unreachable!("final attempt always returns before falling through the loop")
}

/// Runs the protocol's cleanup commands best-effort; a failure is logged
/// but never chains another abort (§4.6 Abort path).
async fn run_abort(
    protocol: &Protocol,
    rpc: &Arc<RpcMultiplexer>,
    logger: &LoggerHandle,
    error_monitor: &Arc<ErrorMonitor>,
) -> RunOutcome {
    for step in &protocol.abort_sequence {
        let deadline = Instant::now() + ABORT_STEP_DEADLINE;
        match rpc.send(step.device, step.opcode, step.args, deadline).await {
            Ok(pending) => match pending.wait().await {
                Outcome::Response(r) if r.status == Status::Ok => {}
                other => {
                    error_monitor.notify(Fault::new(
                        FaultKind::ProtocolAbort,
                        "protocol_engine",
                        format!("abort step {} {} did not succeed: {other:?}", step.device, step.opcode),
                    ));
                }
            },
            Err(e) => {
                error_monitor.notify(Fault::new(
                    FaultKind::ProtocolAbort,
                    "protocol_engine",
                    format!("abort step {} {} could not be sent: {e}", step.device, step.opcode),
                ));
            }
        }
    }
    RunOutcome::Aborted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(10), token.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }
}
