//! fnbox Core - Sandboxed Execution Engine for Function Workers
//!
//! Runs short-lived, untrusted JavaScript programs inside isolated V8
//! sandboxes. A program sees only the capabilities the host injects
//! (`global`, `console`, `request`) plus its payload and context; every
//! value that crosses the boundary is either a deep copy or an opaque
//! handle the host resolves on demand.
//!
//! # Performance-First Design Patterns:
//! - One fresh isolate per run, on its own thread, torn down on settle
//! - Bounded admission through a lock-free dispatcher queue
//! - Per-thread CPU clocks instead of sampling profilers

pub mod accountant;
pub mod boundary;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod perf;
pub mod queue;
pub mod record;
pub mod runtime;

pub use accountant::{AccountantSnapshot, CpuFidelity};
pub use config::EngineConfig;
pub use engine::{Limits, ResourceProfile, NO_ENTRY};
pub use error::{QueueError, ResourceLimit, RunError};
pub use executor::{BackendKind, SandboxBackend, SourceUnit};
pub use queue::{ConcurrencyLimiter, QueueOptions, QueueRegistry};
pub use record::{
    ExecutionRecord, ExecutionRecordSink, ExecutionStats, ExecutionStatus, InvocationContext, MemorySink,
    TracingSink, Trigger,
};
pub use runtime::Engine;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber (`RUST_LOG`, default `info`).
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
    {
        info!("fnbox v{} initialized", env!("CARGO_PKG_VERSION"));
    }
    Ok(())
}
