//! [`ValueStore`] – latest sensor value per label.
//!
//! The store keeps no history: every update overwrites the previous value
//! of each key it carries and leaves the other keys untouched.  Reading a
//! label that was never written yields `0.0`.

use std::sync::{Arc, PoisonError, RwLock};

use robohub_types::{SensorLabel, SensorReading};

/// Shared, cheaply cloneable handle to the hub's sensor values.
///
/// # Example
///
/// ```
/// use robohub_middleware::ValueStore;
/// use robohub_types::{SensorLabel, SensorReading};
///
/// let store = ValueStore::new();
/// store.update(&SensorReading::from([(SensorLabel::Temperature, 22.5)]));
///
/// assert_eq!(store.get(SensorLabel::Temperature), 22.5);
/// assert_eq!(store.get(SensorLabel::Gas), 0.0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ValueStore {
    values: Arc<RwLock<SensorReading>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value for `label`, or `0.0` when nothing was reported yet.
    pub fn get(&self, label: SensorLabel) -> f64 {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(&label).copied().unwrap_or_default()
    }

    /// Merge `partial` into the store, overwriting the keys it carries.
    pub fn update(&self, partial: &SensorReading) {
        if partial.is_empty() {
            return;
        }
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.extend(partial.iter().map(|(label, value)| (*label, *value)));
    }

    /// Copy of every value currently held.
    pub fn snapshot(&self) -> SensorReading {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_get_returns_value() {
        let store = ValueStore::new();
        store.update(&SensorReading::from([(SensorLabel::Humidity, 40.0)]));
        assert_eq!(store.get(SensorLabel::Humidity), 40.0);
    }

    #[test]
    fn unknown_label_reads_zero() {
        let store = ValueStore::new();
        assert_eq!(store.get(SensorLabel::Pulse), 0.0);
    }

    #[test]
    fn update_preserves_untouched_keys() {
        let store = ValueStore::new();
        store.update(&SensorReading::from([
            (SensorLabel::Temperature, 20.0),
            (SensorLabel::Rain, 5.0),
        ]));
        store.update(&SensorReading::from([(SensorLabel::Temperature, 25.0)]));

        assert_eq!(store.get(SensorLabel::Temperature), 25.0);
        assert_eq!(store.get(SensorLabel::Rain), 5.0);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn clones_share_state() {
        let store = ValueStore::new();
        let reader = store.clone();
        store.update(&SensorReading::from([(SensorLabel::Light, 70.0)]));
        assert_eq!(reader.get(SensorLabel::Light), 70.0);
    }

    #[test]
    fn concurrent_readers_see_writer_updates() {
        let store = ValueStore::new();
        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                writer.update(&SensorReading::from([(SensorLabel::Distance, f64::from(i))]));
            }
        });
        for _ in 0..100 {
            let v = store.get(SensorLabel::Distance);
            assert!((0.0..100.0).contains(&v));
        }
        handle.join().unwrap();
        assert_eq!(store.get(SensorLabel::Distance), 99.0);
    }
}
