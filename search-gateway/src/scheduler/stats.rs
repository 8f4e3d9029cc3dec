//! Process-wide request statistics.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    avg_processing_secs: f64,
    last_request_at: Option<DateTime<Utc>>,
}

/// Counters updated on admission and on every terminal outcome.
#[derive(Debug)]
pub struct StatsRegistry {
    counters: Mutex<Counters>,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Fixed limits reported next to the counters.
#[derive(Debug, Clone, Copy)]
pub struct Capacity {
    pub queue_capacity: usize,
    pub max_concurrent: usize,
    pub workers: usize,
}

/// Live gauges sampled by the reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub queue_depth: usize,
    pub in_flight: usize,
}

/// Read-only view served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub status: &'static str,
    /// Unix seconds.
    pub timestamp: f64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub queue: QueueSnapshot,
    pub stats: CounterSnapshot,
    pub workers: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub processing: usize,
    pub capacity: usize,
    pub available_slots: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_processing_time: f64,
    pub requests_per_second: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters {
                total: 0,
                successful: 0,
                failed: 0,
                avg_processing_secs: 0.0,
                last_request_at: None,
            }),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count an inbound request, whatever its eventual outcome.
    pub fn record_submitted(&self) {
        let mut c = self.lock();
        c.total += 1;
        c.last_request_at = Some(Utc::now());
    }

    /// Count a terminal outcome. `latency` only feeds the running mean for
    /// successes.
    pub fn record_outcome(&self, success: bool, latency: Option<Duration>) {
        let mut c = self.lock();
        if !success {
            c.failed += 1;
            return;
        }

        c.successful += 1;
        if let Some(latency) = latency {
            let n = c.successful as f64;
            c.avg_processing_secs += (latency.as_secs_f64() - c.avg_processing_secs) / n;
        }
    }

    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn successful(&self) -> u64 {
        self.lock().successful
    }

    pub fn failed(&self) -> u64 {
        self.lock().failed
    }

    /// Running mean of successful processing latency, in seconds.
    pub fn avg_processing_secs(&self) -> f64 {
        self.lock().avg_processing_secs
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self, capacity: Capacity, gauges: Gauges) -> StatsSnapshot {
        let (total, successful, failed, avg, last_request_at) = {
            let c = self.lock();
            (c.total, c.successful, c.failed, c.avg_processing_secs, c.last_request_at)
        };

        let uptime = self.uptime().as_secs_f64();
        let requests_per_second = if uptime > 0.0 {
            total as f64 / uptime
        } else {
            0.0
        };
        let now = Utc::now();

        StatsSnapshot {
            status: "healthy",
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            started_at: self.started_at,
            uptime_seconds: round2(uptime),
            last_request_at,
            queue: QueueSnapshot {
                pending: gauges.queue_depth,
                processing: gauges.in_flight,
                capacity: capacity.queue_capacity,
                available_slots: capacity.max_concurrent.saturating_sub(gauges.in_flight),
            },
            stats: CounterSnapshot {
                total_requests: total,
                successful,
                failed,
                avg_processing_time: round2(avg),
                requests_per_second: round2(requests_per_second),
            },
            workers: capacity.workers,
            max_concurrent: capacity.max_concurrent,
        }
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity() -> Capacity {
        Capacity {
            queue_capacity: 100,
            max_concurrent: 15,
            workers: 8,
        }
    }

    #[test]
    fn test_running_average() {
        let stats = StatsRegistry::new();
        for secs in [2.0, 4.0, 6.0] {
            stats.record_outcome(true, Some(Duration::from_secs_f64(secs)));
        }
        assert!((stats.avg_processing_secs() - 4.0).abs() < 1e-9);

        stats.record_outcome(true, Some(Duration::ZERO));
        assert!((stats.avg_processing_secs() - 3.0).abs() < 1e-9);
        assert_eq!(stats.successful(), 4);
    }

    #[test]
    fn test_failures_do_not_move_average() {
        let stats = StatsRegistry::new();
        stats.record_outcome(true, Some(Duration::from_secs(2)));
        stats.record_outcome(false, Some(Duration::from_secs(100)));
        assert_eq!(stats.failed(), 1);
        assert!((stats.avg_processing_secs() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot() {
        let stats = StatsRegistry::new();
        stats.record_submitted();
        stats.record_submitted();
        stats.record_outcome(true, Some(Duration::from_millis(1500)));
        stats.record_outcome(false, None);

        let snapshot = stats.snapshot(
            capacity(),
            Gauges {
                queue_depth: 3,
                in_flight: 4,
            },
        );

        assert_eq!(snapshot.stats.total_requests, 2);
        assert_eq!(snapshot.stats.successful, 1);
        assert_eq!(snapshot.stats.failed, 1);
        assert_eq!(snapshot.stats.avg_processing_time, 1.5);
        assert!(snapshot.stats.requests_per_second >= 0.0);
        assert!(snapshot.last_request_at.is_some());
        assert_eq!(snapshot.queue.pending, 3);
        assert_eq!(snapshot.queue.processing, 4);
        assert_eq!(snapshot.queue.available_slots, 11);
        assert_eq!(snapshot.workers, 8);
        assert_eq!(snapshot.max_concurrent, 15);
    }

    #[test]
    fn test_available_slots_saturate() {
        let stats = StatsRegistry::new();
        let snapshot = stats.snapshot(
            capacity(),
            Gauges {
                queue_depth: 0,
                in_flight: 20,
            },
        );
        assert_eq!(snapshot.queue.available_slots, 0);
    }
}
