//! Per-queue task timing telemetry

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Which level of timing telemetry a pool collects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StatsMode {
    /// No telemetry; tasks carry no timestamps.
    #[default]
    NoStatistics,
    /// Record life time (enqueue to finish) and execution time per task.
    LightStatistics,
}

/// Atomic sink for task timing samples. One per queue when
/// [`StatsMode::LightStatistics`] is active.
#[derive(Debug, Default)]
pub struct TaskTimeStats {
    finished: AtomicU64,
    life_ns_total: AtomicU64,
    life_ns_max: AtomicU64,
    exec_ns_total: AtomicU64,
    exec_ns_max: AtomicU64,
}

impl TaskTimeStats {
    /// Record one finished task.
    pub fn record(&self, life: Duration, exec: Duration) {
        let life_ns = life.as_nanos() as u64;
        let exec_ns = exec.as_nanos() as u64;
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.life_ns_total.fetch_add(life_ns, Ordering::Relaxed);
        self.life_ns_max.fetch_max(life_ns, Ordering::Relaxed);
        self.exec_ns_total.fetch_add(exec_ns, Ordering::Relaxed);
        self.exec_ns_max.fetch_max(exec_ns, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time view of the counters.
    pub fn snapshot(&self) -> TimeStatsSnapshot {
        let finished = self.finished.load(Ordering::Relaxed);
        let divisor = finished.max(1);
        TimeStatsSnapshot {
            finished,
            mean_life: Duration::from_nanos(self.life_ns_total.load(Ordering::Relaxed) / divisor),
            max_life: Duration::from_nanos(self.life_ns_max.load(Ordering::Relaxed)),
            mean_exec: Duration::from_nanos(self.exec_ns_total.load(Ordering::Relaxed) / divisor),
            max_exec: Duration::from_nanos(self.exec_ns_max.load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot returned by [`TaskTimeStats::snapshot`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeStatsSnapshot {
    /// Tasks that ran to completion.
    pub finished: u64,
    /// Mean enqueue-to-finish time.
    pub mean_life: Duration,
    /// Longest enqueue-to-finish time seen.
    pub max_life: Duration,
    /// Mean closure execution time.
    pub mean_exec: Duration,
    /// Longest closure execution time seen.
    pub max_exec: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = TaskTimeStats::default();
        stats.record(Duration::from_millis(10), Duration::from_millis(4));
        stats.record(Duration::from_millis(20), Duration::from_millis(6));

        let snap = stats.snapshot();
        assert_eq!(snap.finished, 2);
        assert_eq!(snap.mean_life, Duration::from_millis(15));
        assert_eq!(snap.max_life, Duration::from_millis(20));
        assert_eq!(snap.mean_exec, Duration::from_millis(5));
        assert_eq!(snap.max_exec, Duration::from_millis(6));
    }

    #[test]
    fn test_empty_snapshot() {
        let stats = TaskTimeStats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.finished, 0);
        assert_eq!(snap.mean_life, Duration::ZERO);
    }
}
