//! Liveness registry for long-lived background tasks (§4.7 Heartbeat
//! supervision).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Any timestamp older than this, as observed by the coordinator's tick, is
/// a `ThreadStall` fault.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(3);

#[derive(Default)]
pub struct HeartbeatRegistry {
    last_seen: Mutex<HashMap<&'static str, Instant>>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by a background task (logger worker, per-device reader,
    /// input poller) at least every 250 ms.
    pub fn publish(&self, task: &'static str) {
        self.last_seen
            .lock()
            .expect("heartbeat registry poisoned")
            .insert(task, Instant::now());
    }

    /// Returns the names of tasks whose last heartbeat is older than
    /// [`STALL_THRESHOLD`], or that have never published one.
    pub fn stalled(&self, known_tasks: &[&'static str], now: Instant) -> Vec<&'static str> {
        let last_seen = self.last_seen.lock().expect("heartbeat registry poisoned");
        known_tasks
            .iter()
            .copied()
            .filter(|task| match last_seen.get(task) {
                Some(t) => now.duration_since(*t) > STALL_THRESHOLD,
                None => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heartbeat_is_not_stalled() {
        let reg = HeartbeatRegistry::new();
        reg.publish("reader:pump");
        assert!(reg.stalled(&["reader:pump"], Instant::now()).is_empty());
    }

    #[test]
    fn missing_heartbeat_is_stalled() {
        let reg = HeartbeatRegistry::new();
        assert_eq!(reg.stalled(&["reader:pump"], Instant::now()), vec!["reader:pump"]);
    }

    #[test]
    fn old_heartbeat_is_stalled() {
        let reg = HeartbeatRegistry::new();
        reg.publish("logger");
        let future = Instant::now() + STALL_THRESHOLD + Duration::from_millis(1);
        assert_eq!(reg.stalled(&["logger"], future), vec!["logger"]);
    }
}
