//! Per-device in-flight command table (§3 InFlightEntry, §4.4).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use shared::{Device, Outcome, Token};
use tokio::sync::oneshot;

/// Size of the "recently used" token bitmap. Must be a power of two; tokens
/// are allocated modulo 2^32 but a just-retired token is not reissued until
/// it has cycled out of this window (§4.4 Timeout discipline).
const RECENT_WINDOW: usize = 4096;

pub struct InFlightEntry {
    pub device: Device,
    pub token: Token,
    pub deadline: Instant,
    pub waiter: oneshot::Sender<Outcome>,
}

struct State {
    next_token: Token,
    recently_used: Box<[bool; RECENT_WINDOW]>,
    entries: HashMap<Token, InFlightEntry>,
}

/// Owns correlation-token allocation and the in-flight table for one
/// device. Guarded by a single mutex held only across table mutations,
/// never across I/O (§4.4 Concurrency).
pub struct InFlightTable {
    state: Mutex<State>,
}

impl Default for InFlightTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_token: 1,
                recently_used: Box::new([false; RECENT_WINDOW]),
                entries: HashMap::new(),
            }),
        }
    }

    /// Allocates a fresh token, unique among currently in-flight commands
    /// for this device, and records the entry.
    pub fn allocate_and_insert(
        &self,
        device: Device,
        deadline: Instant,
        waiter: oneshot::Sender<Outcome>,
    ) -> Token {
        let mut state = self.state.lock().expect("in-flight table poisoned");
        let token = loop {
            let candidate = state.next_token;
            state.next_token = state.next_token.wrapping_add(1).max(1);
            let slot = (candidate as usize) % RECENT_WINDOW;
            if !state.recently_used[slot] {
                state.recently_used[slot] = true;
                break candidate;
            }
        };
        state.entries.insert(
            token,
            InFlightEntry {
                device,
                token,
                deadline,
                waiter,
            },
        );
        token
    }

    /// Removes and returns the entry for `token`, if still in-flight.
    pub fn remove(&self, token: Token) -> Option<InFlightEntry> {
        let mut state = self.state.lock().expect("in-flight table poisoned");
        let entry = state.entries.remove(&token);
        if entry.is_some() {
            state.recently_used[(token as usize) % RECENT_WINDOW] = false;
        }
        entry
    }

    /// Removes and returns every entry whose deadline is `<= now`. A
    /// deadline exactly equal to `now` counts as expired (§8 Boundary
    /// behaviors).
    pub fn take_expired(&self, now: Instant) -> Vec<InFlightEntry> {
        let mut state = self.state.lock().expect("in-flight table poisoned");
        let expired_tokens: Vec<Token> = state
            .entries
            .values()
            .filter(|e| e.deadline <= now)
            .map(|e| e.token)
            .collect();
        let mut out = Vec::with_capacity(expired_tokens.len());
        for token in expired_tokens {
            if let Some(entry) = state.entries.remove(&token) {
                state.recently_used[(token as usize) % RECENT_WINDOW] = false;
                out.push(entry);
            }
        }
        out
    }

    /// Removes and returns every currently in-flight entry (used by
    /// `abort_in_flight` and `shutdown`).
    pub fn drain_all(&self) -> Vec<InFlightEntry> {
        let mut state = self.state.lock().expect("in-flight table poisoned");
        state.recently_used = Box::new([false; RECENT_WINDOW]);
        state.entries.drain().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("in-flight table poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn allocates_unique_tokens() {
        let table = InFlightTable::new();
        let mut tokens = std::collections::HashSet::new();
        for _ in 0..1000 {
            let (tx, _rx) = oneshot::channel();
            let token =
                table.allocate_and_insert(Device::Pump, Instant::now() + Duration::from_secs(1), tx);
            assert!(tokens.insert(token), "token reused while in-flight");
        }
    }

    #[test]
    fn expired_entries_are_removed_and_returned() {
        let table = InFlightTable::new();
        let (tx, _rx) = oneshot::channel();
        let past = Instant::now() - Duration::from_millis(1);
        table.allocate_and_insert(Device::Pump, past, tx);
        let expired = table.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn deadline_equal_to_now_counts_as_expired() {
        let table = InFlightTable::new();
        let (tx, _rx) = oneshot::channel();
        let now = Instant::now();
        table.allocate_and_insert(Device::Pump, now, tx);
        let expired = table.take_expired(now);
        assert_eq!(expired.len(), 1);
    }
}
