//! Execution Accountant - per-run wall time, CPU time and heap usage
//!
//! An accountant is started on the thread that drives the interpreter and
//! consumed by [`ExecutionAccountant::finish`] once the run settles, so a
//! snapshot is taken at most once per run by construction.
//!
//! # Performance-First Design:
//! - Thread CPU time comes straight from `CLOCK_THREAD_CPUTIME_ID`; no
//!   sampling thread, no V8 profiler
//! - Heap usage is read from V8 heap statistics after settlement only

use nix::time::{clock_gettime, ClockId};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

/// How trustworthy `cpu_time_ns` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuFidelity {
    /// Read from the interpreter thread's CPU clock.
    #[default]
    Measured,
    /// The interpreter thread never reported; derived from wall time.
    Estimated,
}

/// Resource usage of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountantSnapshot {
    pub wall_time_ms: u64,
    pub cpu_time_ns: u64,
    pub heap_used_bytes: u64,
    pub cpu_fidelity: CpuFidelity,
}

impl AccountantSnapshot {
    /// Snapshot of a run that never executed.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Stand-in for a run whose interpreter thread never reported back.
    /// Assumes the thread was busy for the whole wall time.
    pub fn estimated(wall: Duration) -> Self {
        Self {
            wall_time_ms: wall.as_millis() as u64,
            cpu_time_ns: wall.as_nanos() as u64,
            heap_used_bytes: 0,
            cpu_fidelity: CpuFidelity::Estimated,
        }
    }
}

/// CPU time consumed so far by the calling thread.
pub fn thread_cpu_time() -> Option<Duration> {
    match clock_gettime(ClockId::CLOCK_THREAD_CPUTIME_ID) {
        Ok(ts) => Some(Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32)),
        Err(err) => {
            warn!(error = %err, "thread CPU clock unavailable");
            None
        }
    }
}

/// Running measurement of one sandbox run.
#[derive(Debug)]
pub struct ExecutionAccountant {
    started: Instant,
    cpu_start: Option<Duration>,
}

impl ExecutionAccountant {
    /// Start measuring on the current thread.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            cpu_start: thread_cpu_time(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop measuring. Must run on the thread that called [`start`](Self::start).
    pub fn finish(self, heap_used_bytes: u64) -> AccountantSnapshot {
        let wall = self.started.elapsed();
        match (self.cpu_start, thread_cpu_time()) {
            (Some(start), Some(end)) => AccountantSnapshot {
                wall_time_ms: wall.as_millis() as u64,
                cpu_time_ns: end.saturating_sub(start).as_nanos() as u64,
                heap_used_bytes,
                cpu_fidelity: CpuFidelity::Measured,
            },
            _ => AccountantSnapshot {
                heap_used_bytes,
                ..AccountantSnapshot::estimated(wall)
            },
        }
    }
}
