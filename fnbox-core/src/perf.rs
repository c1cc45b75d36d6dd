//! Engine Metrics - Per-Run Counters
//!
//! Lightweight counters for the execution engine: how many runs settled,
//! how they ended and how long they took end to end.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - No allocation when recording

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{ResourceLimit, RunError};

/// Running totals for one engine.
#[derive(Default)]
pub struct EngineMetrics {
    pub runs: AtomicU64,
    pub run_time_ns: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub memory_exceeded: AtomicU64,
    pub compile_errors: AtomicU64,
    pub infrastructure_errors: AtomicU64,
    pub rejected: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record one finished run.
    pub fn record_run(&self, duration: Duration, outcome: Result<(), &RunError>) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.run_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        let error = match outcome {
            Ok(()) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(error) => error,
        };
        self.failures.fetch_add(1, Ordering::Relaxed);
        let bucket = match error {
            RunError::ResourceExceeded(ResourceLimit::Timeout) => &self.timeouts,
            RunError::ResourceExceeded(ResourceLimit::Memory) => &self.memory_exceeded,
            RunError::Compile { .. } => &self.compile_errors,
            RunError::Infrastructure { .. } => &self.infrastructure_errors,
            _ => return,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    /// A run refused before reaching the queue.
    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let runs = self.runs.load(Ordering::Relaxed);
        let total_ns = self.run_time_ns.load(Ordering::Relaxed);
        MetricsSnapshot {
            runs,
            avg_run_ms: if runs == 0 {
                0.0
            } else {
                (total_ns as f64) / (runs as f64) / 1_000_000.0
            },
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            memory_exceeded: self.memory_exceeded.load(Ordering::Relaxed),
            compile_errors: self.compile_errors.load(Ordering::Relaxed),
            infrastructure_errors: self.infrastructure_errors.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.runs,
            &self.run_time_ns,
            &self.successes,
            &self.failures,
            &self.timeouts,
            &self.memory_exceeded,
            &self.compile_errors,
            &self.infrastructure_errors,
            &self.rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub runs: u64,
    pub avg_run_ms: f64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub memory_exceeded: u64,
    pub compile_errors: u64,
    pub infrastructure_errors: u64,
    pub rejected: u64,
}

impl MetricsSnapshot {
    pub fn print_report(&self) {
        println!("runs:        {:>8} (avg {:>8.3} ms)", self.runs, self.avg_run_ms);
        println!("successes:   {:>8}", self.successes);
        println!("failures:    {:>8}", self.failures);
        println!("  timeouts:  {:>8}", self.timeouts);
        println!("  oom:       {:>8}", self.memory_exceeded);
        println!("  compile:   {:>8}", self.compile_errors);
        println!("  internal:  {:>8}", self.infrastructure_errors);
        println!("rejected:    {:>8}", self.rejected);
    }
}

/// Measures wall time from creation until [`ScopedTimer::finish`].
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a EngineMetrics,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a EngineMetrics) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the run with its outcome and return the elapsed time.
    pub fn finish(self, outcome: Result<(), &RunError>) -> Duration {
        let elapsed = self.start.elapsed();
        self.metrics.record_run(elapsed, outcome);
        elapsed
    }
}
