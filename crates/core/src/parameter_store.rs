//! Mutex-guarded typed key/value map with change notification (§4.2).

use std::collections::HashMap;
use std::sync::Mutex;

use shared::Parameter;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq)]
#[error("{parameter} = {value} is outside bounds {min}..={max}")]
pub struct OutOfRange {
    pub parameter: Parameter,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// A change delivered to observers after the guarding mutex is released.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Change {
    pub parameter: Parameter,
    pub old: f64,
    pub new: f64,
}

/// A registered observer. Invoked on the setting thread, in registration
/// order, after the lock is released (§4.2). Must not block more than 1 ms
/// — a contract, not enforced here.
pub type Observer = Box<dyn Fn(Change) + Send + Sync>;

/// A frozen copy of all parameter values, so a reader sees a consistent
/// view across multiple lookups without holding the lock (§4.2, "snapshot").
#[derive(Debug, Clone)]
pub struct Snapshot(HashMap<Parameter, f64>);

impl Snapshot {
    pub fn get(&self, key: Parameter) -> f64 {
        self.0[&key]
    }
}

struct Inner {
    values: HashMap<Parameter, f64>,
}

/// The shared parameter table. The only mutable structure shared across
/// threads besides the ErrorMonitor's dedup table (§5 Shared-resource
/// policy).
pub struct ParameterStore {
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Observer>>,
}

impl ParameterStore {
    /// Builds a store populated with each [`Parameter`]'s factory default.
    pub fn with_defaults() -> Self {
        let values = Parameter::ALL
            .into_iter()
            .map(|p| (p, p.default_value()))
            .collect();
        Self {
            inner: Mutex::new(Inner { values }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, key: Parameter) -> f64 {
        self.inner.lock().expect("parameter store poisoned").values[&key]
    }

    /// Validates `value` against `key`'s bounds and, on an actual change,
    /// notifies observers after the lock is released. Two successive
    /// `set(key, v)` calls with the same value notify exactly once (the
    /// second is a no-op change).
    pub fn set(&self, key: Parameter, value: f64) -> Result<Option<Change>, OutOfRange> {
        let (min, max) = key.bounds();
        if !key.in_bounds(value) {
            return Err(OutOfRange {
                parameter: key,
                value,
                min,
                max,
            });
        }

        let change = {
            let mut inner = self.inner.lock().expect("parameter store poisoned");
            let old = inner.values[&key];
            if old == value {
                None
            } else {
                inner.values.insert(key, value);
                Some(Change {
                    parameter: key,
                    old,
                    new: value,
                })
            }
        };

        if let Some(change) = change {
            let observers = self.observers.lock().expect("observer list poisoned");
            for observer in observers.iter() {
                observer(change);
            }
        }

        Ok(change)
    }

    pub fn subscribe(&self, observer: Observer) {
        self.observers
            .lock()
            .expect("observer list poisoned")
            .push(observer);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot(
            self.inner
                .lock()
                .expect("parameter store poisoned")
                .values
                .clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn rejects_out_of_range() {
        let store = ParameterStore::with_defaults();
        let err = store.set(Parameter::Voltage, 1_000.0).unwrap_err();
        assert_eq!(err.parameter, Parameter::Voltage);
    }

    #[test]
    fn notifies_observers_after_unlock_once_per_actual_change() {
        let store = ParameterStore::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        store.subscribe(Box::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        store.set(Parameter::Voltage, 15.0).unwrap();
        store.set(Parameter::Voltage, 15.0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_is_consistent_view() {
        let store = ParameterStore::with_defaults();
        store.set(Parameter::FlowRate, 5.0).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.get(Parameter::FlowRate), 5.0);
        store.set(Parameter::FlowRate, 10.0).unwrap();
        // Snapshot taken before the second write still reflects the old value.
        assert_eq!(snap.get(Parameter::FlowRate), 5.0);
        assert_eq!(store.get(Parameter::FlowRate), 10.0);
    }
}
