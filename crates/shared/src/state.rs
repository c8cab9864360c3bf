use std::fmt;

/// The coordinator's FSM states (§4.7, §3 Data Model).
///
/// Terminal state on process exit is `Idle` (clean shutdown) or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SystemState {
    Boot,
    Init,
    Idle,
    Running,
    Finished,
    Aborting,
    Error,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemState::Boot => "boot",
            SystemState::Init => "init",
            SystemState::Idle => "idle",
            SystemState::Running => "running",
            SystemState::Finished => "finished",
            SystemState::Aborting => "aborting",
            SystemState::Error => "error",
        };
        f.write_str(s)
    }
}
