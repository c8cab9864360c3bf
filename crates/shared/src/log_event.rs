use std::time::{Duration, Instant};

use crate::command::Token;
use crate::device::Device;
use crate::fault::FaultKind;
use crate::inline::Message;
use crate::parameter::Parameter;
use crate::response::Status;
use crate::run::{RunId, RunOutcome};
use crate::state::SystemState;

/// The payload of a single structured record (§3 Data Model, LogEvent).
#[derive(Debug, Clone)]
pub enum LogEventKind {
    StepEntered {
        protocol: &'static str,
        step: &'static str,
    },
    CommandSent {
        device: Device,
        token: Token,
        opcode: &'static str,
    },
    ResponseReceived {
        token: Token,
        status: Status,
        latency_us: u64,
    },
    ParameterChanged {
        key: Parameter,
        old: f64,
        new: f64,
    },
    Fault {
        kind: FaultKind,
        message: Message,
    },
    HeartbeatMissed {
        thread: &'static str,
    },
    RunStart {
        run_id: RunId,
    },
    RunEnd {
        run_id: RunId,
        outcome: RunOutcome,
    },
    /// Synthetic event the logger emits periodically when producers have
    /// dropped events because the ring buffer was full (§4.5 Back-pressure).
    EventsDropped {
        count: u64,
    },
}

/// A tagged record. Every event carries a monotonic timestamp and the
/// current [`SystemState`] at emission (§3 Data Model).
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub monotonic: Instant,
    pub state: SystemState,
    pub kind: LogEventKind,
}

impl LogEvent {
    pub fn new(state: SystemState, kind: LogEventKind) -> Self {
        Self {
            monotonic: Instant::now(),
            state,
            kind,
        }
    }

    /// Nanoseconds elapsed since an arbitrary epoch, for the CSV column
    /// `<monotonic_ns>` (§6); callers supply the epoch so output is
    /// reproducible in tests.
    pub fn monotonic_ns_since(&self, epoch: Instant) -> u128 {
        self.monotonic
            .checked_duration_since(epoch)
            .unwrap_or(Duration::ZERO)
            .as_nanos()
    }
}
