//! Engine module - Isolation runtimes
//!
//! This module contains the two interchangeable sandbox backends and the
//! machinery they share: the interpreter bootstrap, the host ops that
//! back capability handles, and the resource limits applied to each run.

pub mod isolation;
pub(crate) mod js;
pub(crate) mod ops;
pub mod resource_limits;
pub mod worker;

pub use isolation::IsolateBackend;
pub use js::NO_ENTRY;
pub use resource_limits::{Limits, ResourceKind, ResourceProfile, SandboxLimits};
pub use worker::WorkerBackend;
