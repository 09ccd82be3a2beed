use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Live counters for one queue or subscription
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    received: AtomicU64,
    completed: AtomicU64,
    dead_lettered: AtomicU64,
    /// Failures that could not be dead-lettered (receive-and-delete, lost lock)
    unsettled_failures: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unsettled_failures(&self) {
        self.unsettled_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one handler invocation as running until the guard drops.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn unsettled_failures(&self) -> u64 {
        self.unsettled_failures.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            received: self.received(),
            completed: self.completed(),
            dead_lettered: self.dead_lettered(),
            unsettled_failures: self.unsettled_failures(),
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight(),
        }
    }
}

pub struct InFlightGuard {
    metrics: Arc<DispatchMetrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchSnapshot {
    pub received: u64,
    pub completed: u64,
    pub dead_lettered: u64,
    pub unsettled_failures: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
}

/// Metrics for every entity a host serves, plus sender-side counters
#[derive(Debug, Default)]
pub struct BusMetrics {
    entities: DashMap<String, Arc<DispatchMetrics>>,
    messages_sent: AtomicU64,
    messages_missed: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_entity(&self, entity: &str) -> Arc<DispatchMetrics> {
        self.entities
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(DispatchMetrics::new()))
            .clone()
    }

    pub fn increment_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_missed(&self) {
        self.messages_missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_missed(&self) -> u64 {
        self.messages_missed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HashMap<String, DispatchSnapshot> {
        self.entities
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_guard_tracks_peak() {
        let metrics = Arc::new(DispatchMetrics::new());

        let a = metrics.enter();
        let b = metrics.enter();
        assert_eq!(metrics.in_flight(), 2);
        drop(a);
        let _c = metrics.enter();
        drop(b);

        assert_eq!(metrics.in_flight(), 1);
        assert_eq!(metrics.peak_in_flight(), 2);
    }

    #[test]
    fn bus_metrics_share_per_entity_counters() {
        let bus = BusMetrics::new();
        bus.for_entity("orders").increment_completed();
        bus.for_entity("orders").increment_completed();
        bus.increment_missed();

        assert_eq!(bus.snapshot()["orders"].completed, 2);
        assert_eq!(bus.messages_missed(), 1);
    }
}
