//! metrics.rs
//! Contadores observables del motor. Sólo para monitorización: nada del
//! motor decide en función de ellos.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct EngineMetrics {
    pub probe_events: Arc<AtomicU64>,
    pub unmatched_events: Arc<AtomicU64>,
    pub retried_matches: Arc<AtomicU64>,
    pub vision_samples: Arc<AtomicU64>,
    pub unmatched_tracks: Arc<AtomicU64>,
    pub uncalibrated_samples: Arc<AtomicU64>,
    pub low_confidence_samples: Arc<AtomicU64>,
    pub late_records: Arc<AtomicU64>,
    pub duplicate_observations: Arc<AtomicU64>,
    pub windows_emitted: Arc<AtomicU64>,
    pub windows_abandoned: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self { Self::new() }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            probe_events: Arc::new(AtomicU64::new(0)),
            unmatched_events: Arc::new(AtomicU64::new(0)),
            retried_matches: Arc::new(AtomicU64::new(0)),
            vision_samples: Arc::new(AtomicU64::new(0)),
            unmatched_tracks: Arc::new(AtomicU64::new(0)),
            uncalibrated_samples: Arc::new(AtomicU64::new(0)),
            low_confidence_samples: Arc::new(AtomicU64::new(0)),
            late_records: Arc::new(AtomicU64::new(0)),
            duplicate_observations: Arc::new(AtomicU64::new(0)),
            windows_emitted: Arc::new(AtomicU64::new(0)),
            windows_abandoned: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 { counter.load(Ordering::Relaxed) }

    /// `open_occurrences` y `pending_windows` son gauges que sólo conoce el motor
    pub fn summary(&self, open_occurrences: usize, pending_windows: usize) -> MetricsSummary {
        MetricsSummary {
            probe_events: Self::get(&self.probe_events),
            unmatched_events: Self::get(&self.unmatched_events),
            retried_matches: Self::get(&self.retried_matches),
            vision_samples: Self::get(&self.vision_samples),
            unmatched_tracks: Self::get(&self.unmatched_tracks),
            uncalibrated_samples: Self::get(&self.uncalibrated_samples),
            low_confidence_samples: Self::get(&self.low_confidence_samples),
            late_records: Self::get(&self.late_records),
            duplicate_observations: Self::get(&self.duplicate_observations),
            windows_emitted: Self::get(&self.windows_emitted),
            windows_abandoned: Self::get(&self.windows_abandoned),
            open_occurrences: open_occurrences as u64,
            pending_windows: pending_windows as u64,
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub probe_events: u64,
    pub unmatched_events: u64,
    pub retried_matches: u64,
    pub vision_samples: u64,
    pub unmatched_tracks: u64,
    pub uncalibrated_samples: u64,
    pub low_confidence_samples: u64,
    pub late_records: u64,
    pub duplicate_observations: u64,
    pub windows_emitted: u64,
    pub windows_abandoned: u64,
    pub open_occurrences: u64,
    pub pending_windows: u64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contadores_compartidos_entre_clones() {
        let m = EngineMetrics::new();
        let c = m.clone();
        c.inc(&c.late_records);
        m.add(&m.late_records, 2);
        let s = m.summary(3, 1);
        assert_eq!(s.late_records, 3);
        assert_eq!(s.open_occurrences, 3);
        assert_eq!(s.pending_windows, 1);
        assert_eq!(s.unmatched_events, 0);
    }
}
