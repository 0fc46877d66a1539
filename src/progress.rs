// src/progress.rs

use crate::models::ProgressSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimum gap between two progress emissions.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// The external component receiving progress, log and completion events
/// from the engine. Implementations must tolerate calls from any worker.
pub trait DownloadObserver: Send + Sync {
    fn progress(&self, snapshot: &ProgressSnapshot);
    fn log(&self, message: &str);
    fn finished(&self, success: bool, message: &str);
}

/// Merges per-chunk byte counts into one global counter and forwards
/// throttled snapshots to the observer.
///
/// Writers add with a plain atomic; the throttle gate is the only lock and
/// is only ever tried, so a fetcher never blocks on progress reporting.
pub struct ProgressAggregator {
    downloaded: AtomicU64,
    total: Option<u64>,
    started: Instant,
    tick: Duration,
    last_emit: Mutex<Option<Instant>>,
    observer: Arc<dyn DownloadObserver>,
}

impl ProgressAggregator {
    pub fn new(observer: Arc<dyn DownloadObserver>, total: Option<u64>, tick: Duration) -> Self {
        Self {
            downloaded: AtomicU64::new(0),
            total,
            started: Instant::now(),
            tick,
            last_emit: Mutex::new(None),
            observer,
        }
    }

    /// Records `n` freshly downloaded bytes and maybe emits a snapshot.
    pub fn add(&self, n: u64) {
        if n > 0 {
            self.downloaded.fetch_add(n, Ordering::Relaxed);
        }
        self.maybe_emit();
    }

    /// Removes a failed attempt's bytes again so the counter is exact at
    /// completion. Callers only retract what they previously added.
    pub fn retract(&self, n: u64) {
        if n > 0 {
            self.downloaded.fetch_sub(n, Ordering::Relaxed);
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut downloaded = self.downloaded.load(Ordering::Relaxed);
        if let Some(total) = self.total {
            // Reads may be slightly stale but must never exceed the total.
            downloaded = downloaded.min(total);
        }
        let elapsed = self.started.elapsed();
        let speed_bps = downloaded as f64 / elapsed.as_secs_f64().max(1.0);
        let percentage = self.total.map(|total| {
            if total == 0 {
                100.0
            } else {
                downloaded as f64 * 100.0 / total as f64
            }
        });
        ProgressSnapshot {
            downloaded,
            total: self.total,
            speed_bps,
            percentage,
            elapsed,
        }
    }

    /// Emits unconditionally, e.g. for the final 100% snapshot.
    pub fn emit_now(&self) {
        let mut last = match self.last_emit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(Instant::now());
        self.observer.progress(&self.snapshot());
    }

    /// Emits at most once per tick. The gate lock is held through the
    /// callback so the observer sees snapshots in time order; a concurrent
    /// caller finding the gate busy drops its (late) snapshot.
    fn maybe_emit(&self) {
        let Ok(mut last) = self.last_emit.try_lock() else {
            return;
        };
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.tick {
                return;
            }
        }
        *last = Some(now);
        self.observer.progress(&self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<ProgressSnapshot>>,
    }

    impl DownloadObserver for Recorder {
        fn progress(&self, snapshot: &ProgressSnapshot) {
            self.snapshots.lock().unwrap().push(*snapshot);
        }
        fn log(&self, _message: &str) {}
        fn finished(&self, _success: bool, _message: &str) {}
    }

    #[test]
    fn counts_are_exact_after_retract() {
        let recorder = Arc::new(Recorder::default());
        let agg = ProgressAggregator::new(recorder, Some(100), Duration::from_secs(3600));
        agg.add(40);
        agg.add(30);
        agg.retract(30);
        agg.add(60);
        assert_eq!(agg.downloaded(), 100);
    }

    #[test]
    fn snapshot_never_exceeds_total() {
        let recorder = Arc::new(Recorder::default());
        let agg = ProgressAggregator::new(recorder, Some(50), Duration::from_secs(3600));
        agg.add(80);
        let snap = agg.snapshot();
        assert_eq!(snap.downloaded, 50);
        assert_eq!(snap.percentage, Some(100.0));
    }

    #[test]
    fn unknown_total_has_no_percentage() {
        let recorder = Arc::new(Recorder::default());
        let agg = ProgressAggregator::new(recorder, None, Duration::from_secs(3600));
        agg.add(1234);
        let snap = agg.snapshot();
        assert_eq!(snap.total, None);
        assert_eq!(snap.percentage, None);
    }

    #[test]
    fn speed_uses_floored_elapsed_seconds() {
        let recorder = Arc::new(Recorder::default());
        let agg = ProgressAggregator::new(recorder, Some(10_000), Duration::from_secs(3600));
        agg.add(5000);
        // Under a second of wall time the divisor is clamped to one.
        let snap = agg.snapshot();
        assert!((snap.speed_bps - 5000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn emissions_are_throttled() {
        let recorder = Arc::new(Recorder::default());
        let agg = ProgressAggregator::new(recorder.clone(), Some(100), Duration::from_secs(3600));
        for _ in 0..10 {
            agg.add(1);
        }
        // First add opens the gate, the rest land inside the same tick.
        assert_eq!(recorder.snapshots.lock().unwrap().len(), 1);
    }

    #[test]
    fn emit_now_bypasses_the_throttle() {
        let recorder = Arc::new(Recorder::default());
        let agg = ProgressAggregator::new(recorder.clone(), Some(100), Duration::from_secs(3600));
        agg.add(100);
        agg.emit_now();
        agg.emit_now();
        assert_eq!(recorder.snapshots.lock().unwrap().len(), 3);
    }

    #[test]
    fn zero_total_reports_complete() {
        let recorder = Arc::new(Recorder::default());
        let agg = ProgressAggregator::new(recorder, Some(0), Duration::from_secs(3600));
        let snap = agg.snapshot();
        assert_eq!(snap.percentage, Some(100.0));
        assert_eq!(snap.downloaded, 0);
    }
}
