use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier unique per experiment execution, derived from
/// wall-clock time at run start (§3 Data Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(u128);

impl RunId {
    /// Derive a new run id from the current wall-clock time.
    pub fn new_at(now: SystemTime) -> Self {
        let nanos = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self(nanos)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of a protocol execution (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RunOutcome {
    Completed,
    Aborted,
    Failed { reason: String },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::Aborted => f.write_str("aborted"),
            RunOutcome::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}
