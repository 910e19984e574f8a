//! Probe metrics for dashboards
//!
//! Fixed-capacity ring buffer of probe outcomes:
//! - oldest point overwritten once full
//! - latency statistics over successful probes only
//! - success rate over every held point

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 1440;

/// One probe outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyDataPoint {
    pub timestamp: DateTime<Utc>,
    /// None for failed probes
    pub latency_ms: Option<u32>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub avg_ms: Option<f64>,
    pub min_ms: Option<u32>,
    pub max_ms: Option<u32>,
}

pub struct HealthMetricsTracker {
    capacity: usize,
    points: Mutex<VecDeque<LatencyDataPoint>>,
}

impl HealthMetricsTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            points: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, latency_ms: Option<u32>, success: bool) {
        self.record_at(Utc::now(), latency_ms, success);
    }

    pub fn record_at(&self, timestamp: DateTime<Utc>, latency_ms: Option<u32>, success: bool) {
        let mut points = self.points.lock();
        if points.len() == self.capacity {
            points.pop_front();
        }
        points.push_back(LatencyDataPoint {
            timestamp,
            latency_ms: if success { latency_ms } else { None },
            success,
        });
    }

    /// Held points, oldest first
    pub fn history(&self) -> Vec<LatencyDataPoint> {
        self.points.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> LatencyStats {
        let points = self.points.lock();
        let latencies: Vec<u32> = points
            .iter()
            .filter(|p| p.success)
            .filter_map(|p| p.latency_ms)
            .collect();

        if latencies.is_empty() {
            return LatencyStats::default();
        }
        let sum: u64 = latencies.iter().map(|&l| u64::from(l)).sum();
        LatencyStats {
            avg_ms: Some(sum as f64 / latencies.len() as f64),
            min_ms: latencies.iter().copied().min(),
            max_ms: latencies.iter().copied().max(),
        }
    }

    /// Fraction of successful probes, 0.0 when empty
    pub fn success_rate(&self) -> f64 {
        let points = self.points.lock();
        if points.is_empty() {
            return 0.0;
        }
        let ok = points.iter().filter(|p| p.success).count();
        ok as f64 / points.len() as f64
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }
}

impl Default for HealthMetricsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
