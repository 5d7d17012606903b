//! Run-wide counters shared by every worker.

use dashmap::DashMap;
use para_core::PhaseKind;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Counters {
    registered: u64,
    failed: u64,
    total_points: u64,
    publish_failures: u64,
    throughput: f64,
    sample_started: Instant,
    sample_count: u64,
}

/// Counters live under one mutex; the per-device phase table is a DashMap
/// so workers never contend on it.
#[derive(Debug)]
pub struct Statistics {
    started: Instant,
    requested: usize,
    counters: Mutex<Counters>,
    phases: DashMap<String, PhaseKind>,
}

/// Point-in-time copy for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub elapsed: Duration,
    pub requested: usize,
    pub registered: u64,
    pub failed: u64,
    pub total_points: u64,
    pub publish_failures: u64,
    pub average_rate: f64,
    pub throughput: f64,
    pub phases: BTreeMap<PhaseKind, usize>,
}

impl StatsSnapshot {
    pub fn active(&self) -> usize {
        self.phases.values().sum()
    }
}

impl Statistics {
    pub fn new(requested: usize) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            requested,
            counters: Mutex::new(Counters {
                registered: 0,
                failed: 0,
                total_points: 0,
                publish_failures: 0,
                throughput: 0.0,
                sample_started: now,
                sample_count: 0,
            }),
            phases: DashMap::new(),
        }
    }

    fn with_counters<T>(&self, f: impl FnOnce(&mut Counters) -> T) -> T {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut counters)
    }

    /// Count a registration; returns the new total.
    pub fn record_registered(&self) -> u64 {
        self.with_counters(|c| {
            c.registered += 1;
            c.registered
        })
    }

    pub fn record_failed(&self) {
        self.with_counters(|c| c.failed += 1);
    }

    /// Count a delivered point and refresh the throughput estimate once a
    /// full sample window has passed.
    pub fn record_point(&self) {
        let now = Instant::now();
        self.with_counters(|c| {
            c.total_points += 1;
            let span = now.duration_since(c.sample_started);
            if span >= THROUGHPUT_WINDOW {
                c.throughput = (c.total_points - c.sample_count) as f64 / span.as_secs_f64();
                c.sample_started = now;
                c.sample_count = c.total_points;
            }
        });
    }

    pub fn record_publish_failure(&self) {
        self.with_counters(|c| c.publish_failures += 1);
    }

    pub fn set_phase(&self, device_id: &str, phase: PhaseKind) {
        if let Some(mut entry) = self.phases.get_mut(device_id) {
            *entry = phase;
            return;
        }
        self.phases.insert(device_id.to_string(), phase);
    }

    /// Forget a device that stopped flying.
    pub fn deactivate(&self, device_id: &str) {
        self.phases.remove(device_id);
    }

    pub fn total_points(&self) -> u64 {
        self.with_counters(|c| c.total_points)
    }

    pub fn registered(&self) -> u64 {
        self.with_counters(|c| c.registered)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.started.elapsed();
        let mut phases = BTreeMap::new();
        for entry in self.phases.iter() {
            *phases.entry(*entry.value()).or_insert(0) += 1;
        }
        self.with_counters(|c| StatsSnapshot {
            elapsed,
            requested: self.requested,
            registered: c.registered,
            failed: c.failed,
            total_points: c.total_points,
            publish_failures: c.publish_failures,
            average_rate: if elapsed.is_zero() {
                0.0
            } else {
                c.total_points as f64 / elapsed.as_secs_f64()
            },
            throughput: c.throughput,
            phases,
        })
    }

    /// Write the periodic report to the log.
    pub fn log_report(&self) {
        let snap = self.snapshot();
        tracing::info!(
            "Stats: elapsed {}s | registered {}/{} ({} failed) | points {} | avg {:.1}/s | current {:.1} msgs/s | publish failures {}",
            snap.elapsed.as_secs(),
            snap.registered,
            snap.requested,
            snap.failed,
            snap.total_points,
            snap.average_rate,
            snap.throughput,
            snap.publish_failures
        );
        let phases: Vec<String> = snap
            .phases
            .iter()
            .map(|(phase, count)| format!("{}={}", phase, count))
            .collect();
        tracing::info!("Active flights: {} [{}]", snap.active(), phases.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn throughput_waits_for_a_full_window() {
        let stats = Statistics::new(2);
        for _ in 0..4 {
            stats.record_point();
        }
        assert_eq!(stats.snapshot().throughput, 0.0);

        tokio::time::advance(Duration::from_secs(2)).await;
        stats.record_point();
        // 5 points over the first 2s sample window
        assert_eq!(stats.snapshot().throughput, 2.5);
        assert_eq!(stats.total_points(), 5);
    }

    #[test]
    fn phases_track_active_devices() {
        let stats = Statistics::new(3);
        stats.set_phase("a", PhaseKind::Ground);
        stats.set_phase("b", PhaseKind::Ground);
        stats.set_phase("c", PhaseKind::Gliding);
        stats.set_phase("b", PhaseKind::Takeoff);
        stats.deactivate("c");

        let snap = stats.snapshot();
        assert_eq!(snap.active(), 2);
        assert_eq!(snap.phases.get(&PhaseKind::Ground), Some(&1));
        assert_eq!(snap.phases.get(&PhaseKind::Takeoff), Some(&1));
        assert_eq!(snap.phases.get(&PhaseKind::Gliding), None);
    }

    #[test]
    fn registration_counters() {
        let stats = Statistics::new(3);
        assert_eq!(stats.record_registered(), 1);
        assert_eq!(stats.record_registered(), 2);
        stats.record_failed();
        stats.record_publish_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.registered, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.publish_failures, 1);
        assert_eq!(snap.requested, 3);
    }
}
