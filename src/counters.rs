use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::metrics::MetricsCollector;

/// Named integer counters for external telemetry collection.
///
/// `harvest` atomically reads and clears every counter, so a collector that
/// polls periodically sees each increment exactly once.
#[derive(Debug, Default)]
pub struct Counters {
    values: Mutex<BTreeMap<String, i64>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) -> i64 {
        self.increment_by(name, 1)
    }

    pub fn increment_by(&self, name: &str, delta: i64) -> i64 {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let value = values.entry(name.to_string()).or_insert(0);
        *value += delta;
        *value
    }

    pub fn decrement(&self, name: &str) -> i64 {
        self.increment_by(name, -1)
    }

    pub fn decrement_by(&self, name: &str, delta: i64) -> i64 {
        self.increment_by(name, -delta)
    }

    /// Current value, zero for a counter never touched.
    pub fn get(&self, name: &str) -> i64 {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(name).copied().unwrap_or(0)
    }

    pub fn reset(&self, name: &str) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(name);
    }

    /// Returns every counter and clears them in one step.
    pub fn harvest(&self) -> BTreeMap<String, i64> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *values)
    }
}

impl MetricsCollector for Counters {
    fn chunk_read(&self) {
        self.increment("chunks_read");
    }

    fn chunk_written(&self) {
        self.increment("chunks_written");
    }

    fn read_before_write(&self) {
        self.increment("read_before_write");
    }

    fn bytes_read(&self, amount: usize) {
        self.increment_by("bytes_read", amount as i64);
    }

    fn bytes_written(&self, amount: usize) {
        self.increment_by("bytes_written", amount as i64);
    }

    fn cache_hit(&self) {
        self.increment("cache_hits");
    }

    fn cache_miss(&self) {
        self.increment("cache_misses");
    }

    fn deferred_flush(&self, entries: usize) {
        self.increment("deferred_flushes");
        self.increment_by("deferred_entries_flushed", entries as i64);
    }

    fn retry(&self, op: &'static str) {
        self.increment(&format!("retries.{}", op));
    }

    fn retry_exhausted(&self, op: &'static str) {
        self.increment(&format!("retries_exhausted.{}", op));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_decrement_get() {
        let counters = Counters::new();
        assert_eq!(counters.get("a"), 0);
        assert_eq!(counters.increment("a"), 1);
        assert_eq!(counters.increment_by("a", 4), 5);
        assert_eq!(counters.decrement("a"), 4);
        assert_eq!(counters.get("a"), 4);
        counters.reset("a");
        assert_eq!(counters.get("a"), 0);
    }

    #[test]
    fn test_harvest_clears() {
        let counters = Counters::new();
        counters.increment("x");
        counters.increment_by("y", 3);

        let harvested = counters.harvest();
        assert_eq!(harvested.get("x"), Some(&1));
        assert_eq!(harvested.get("y"), Some(&3));
        assert_eq!(counters.get("x"), 0);
        assert!(counters.harvest().is_empty());
    }
}
