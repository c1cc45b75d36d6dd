//! Sandbox Resource Limits via Preset Profiles
//!
//! Every run is bounded by a heap ceiling and a wall-clock ceiling; the
//! worker backend additionally gets a grace period for the parent-side
//! timer, and the engine caps source size and concurrency. Rather than
//! configuring each value per deployment, a [`ResourceProfile`] supplies
//! coherent defaults and individual values are overridden on top.
//!
//! # Performance-First Design:
//! - Limits resolve once into a plain `Copy` struct handed to every run
//! - Preset profiles avoid per-deployment tuning for common shapes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;

/// Identifies a single sandbox resource parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// V8 heap ceiling in bytes.
    HeapMax,
    /// Per-run wall-clock ceiling in milliseconds.
    TimeoutMs,
    /// Extra time the parent grants a worker before tearing it down.
    WorkerGraceMs,
    /// Simultaneously running sandboxes.
    Concurrency,
    /// Largest accepted source unit in bytes.
    MaxCodeBytes,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeapMax => write!(f, "memory_limit_bytes"),
            Self::TimeoutMs => write!(f, "timeout_ms"),
            Self::WorkerGraceMs => write!(f, "worker_grace_ms"),
            Self::Concurrency => write!(f, "concurrency"),
            Self::MaxCodeBytes => write!(f, "max_code_bytes"),
        }
    }
}

impl ResourceKind {
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "memory_limit_bytes" => Some(Self::HeapMax),
            "timeout_ms" => Some(Self::TimeoutMs),
            "worker_grace_ms" => Some(Self::WorkerGraceMs),
            "concurrency" => Some(Self::Concurrency),
            "max_code_bytes" => Some(Self::MaxCodeBytes),
            _ => None,
        }
    }
}

/// Preset resource profiles for common workload shapes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceProfile {
    /// Tight limits for cheap, frequent triggers.
    Minimal,
    /// Balanced defaults suitable for most function workers.
    #[default]
    Standard,
    /// Generous limits for heavier transformations.
    Performance,
    /// Fully user-defined limits; unknown keys are ignored.
    Custom(HashMap<String, u64>),
}

/// Effective limits of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub memory_limit_bytes: u64,
    pub timeout: Duration,
    pub worker_grace: Duration,
    pub concurrency: usize,
    pub max_code_bytes: usize,
}

impl Limits {
    /// How long a caller waits before giving up on a run entirely.
    pub fn outer_deadline(&self) -> Duration {
        self.timeout + self.worker_grace + Duration::from_secs(1)
    }
}

impl Default for Limits {
    fn default() -> Self {
        SandboxLimits::from_profile(ResourceProfile::Standard).resolve()
    }
}

/// A profile plus individual overrides.
///
/// ```rust,no_run
/// # use fnbox_core::engine::resource_limits::{SandboxLimits, ResourceKind, ResourceProfile};
/// let mut limits = SandboxLimits::from_profile(ResourceProfile::Minimal);
/// limits.set_override(ResourceKind::TimeoutMs, 1_000);
/// let resolved = limits.resolve();
/// ```
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    profile: ResourceProfile,
    overrides: Vec<(ResourceKind, u64)>,
}

impl SandboxLimits {
    pub fn from_profile(profile: ResourceProfile) -> Self {
        debug!(profile = ?profile, "Creating SandboxLimits");
        Self {
            profile,
            overrides: Vec::new(),
        }
    }

    /// Override a single limit after selecting a profile. Last write wins.
    pub fn set_override(&mut self, kind: ResourceKind, value: u64) {
        debug!(resource = %kind, value, "Adding limit override");
        self.overrides.push((kind, value));
    }

    pub fn profile(&self) -> &ResourceProfile {
        &self.profile
    }

    /// Profile defaults with overrides applied.
    pub fn get_current_limits(&self) -> HashMap<ResourceKind, u64> {
        let mut limits = self.profile_defaults();
        for (kind, value) in &self.overrides {
            limits.insert(*kind, *value);
        }
        limits
    }

    pub fn resolve(&self) -> Limits {
        let current = self.get_current_limits();
        let standard = Self::standard();
        let pick = |kind: ResourceKind| {
            current
                .get(&kind)
                .or_else(|| standard.get(&kind))
                .copied()
                .unwrap_or_default()
        };
        let limits = Limits {
            memory_limit_bytes: pick(ResourceKind::HeapMax),
            timeout: Duration::from_millis(pick(ResourceKind::TimeoutMs)),
            worker_grace: Duration::from_millis(pick(ResourceKind::WorkerGraceMs)),
            concurrency: pick(ResourceKind::Concurrency).max(1) as usize,
            max_code_bytes: pick(ResourceKind::MaxCodeBytes) as usize,
        };
        info!(
            memory_limit_bytes = limits.memory_limit_bytes,
            timeout_ms = limits.timeout.as_millis() as u64,
            concurrency = limits.concurrency,
            "Resolved sandbox limits"
        );
        limits
    }

    fn standard() -> HashMap<ResourceKind, u64> {
        HashMap::from([
            (ResourceKind::HeapMax, 128 * MIB),
            (ResourceKind::TimeoutMs, 5_000),
            (ResourceKind::WorkerGraceMs, 5_000),
            (ResourceKind::Concurrency, 5),
            (ResourceKind::MaxCodeBytes, MIB),
        ])
    }

    fn profile_defaults(&self) -> HashMap<ResourceKind, u64> {
        match &self.profile {
            ResourceProfile::Minimal => HashMap::from([
                (ResourceKind::HeapMax, 64 * MIB),
                (ResourceKind::TimeoutMs, 3_000),
                (ResourceKind::WorkerGraceMs, 5_000),
                (ResourceKind::Concurrency, 5),
                (ResourceKind::MaxCodeBytes, 256 * 1024),
            ]),
            ResourceProfile::Standard => Self::standard(),
            ResourceProfile::Performance => HashMap::from([
                (ResourceKind::HeapMax, 512 * MIB),
                (ResourceKind::TimeoutMs, 15_000),
                (ResourceKind::WorkerGraceMs, 5_000),
                (ResourceKind::Concurrency, 5),
                (ResourceKind::MaxCodeBytes, 4 * MIB),
            ]),
            ResourceProfile::Custom(map) => map
                .iter()
                .filter_map(|(key, value)| ResourceKind::parse(key).map(|kind| (kind, *value)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_minimal() {
        let limits = SandboxLimits::from_profile(ResourceProfile::Minimal).resolve();
        assert_eq!(limits.memory_limit_bytes, 64 * MIB);
        assert_eq!(limits.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_profile_standard() {
        let limits = Limits::default();
        assert_eq!(limits.memory_limit_bytes, 128 * MIB);
        assert_eq!(limits.timeout, Duration::from_secs(5));
        assert_eq!(limits.worker_grace, Duration::from_secs(5));
        assert_eq!(limits.concurrency, 5);
    }

    #[test]
    fn test_profile_performance() {
        let limits = SandboxLimits::from_profile(ResourceProfile::Performance).resolve();
        assert_eq!(limits.memory_limit_bytes, 512 * MIB);
        assert_eq!(limits.timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_profile_custom_falls_back_to_standard() {
        let custom = HashMap::from([
            ("timeout_ms".to_string(), 250_u64),
            ("bogus".to_string(), 1),
        ]);
        let limits = SandboxLimits::from_profile(ResourceProfile::Custom(custom)).resolve();
        assert_eq!(limits.timeout, Duration::from_millis(250));
        assert_eq!(limits.memory_limit_bytes, 128 * MIB);
    }

    #[test]
    fn test_override_last_write_wins() {
        let mut limits = SandboxLimits::from_profile(ResourceProfile::Standard);
        limits.set_override(ResourceKind::Concurrency, 2);
        limits.set_override(ResourceKind::Concurrency, 3);
        let current = limits.get_current_limits();
        assert_eq!(current[&ResourceKind::Concurrency], 3);
        assert_eq!(current[&ResourceKind::TimeoutMs], 5_000);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let mut limits = SandboxLimits::from_profile(ResourceProfile::Standard);
        limits.set_override(ResourceKind::Concurrency, 0);
        assert_eq!(limits.resolve().concurrency, 1);
    }

    #[test]
    fn test_outer_deadline_covers_grace() {
        let limits = Limits::default();
        assert_eq!(limits.outer_deadline(), Duration::from_secs(11));
    }

    #[test]
    fn test_resource_kind_round_trip_names() {
        for kind in [
            ResourceKind::HeapMax,
            ResourceKind::TimeoutMs,
            ResourceKind::WorkerGraceMs,
            ResourceKind::Concurrency,
            ResourceKind::MaxCodeBytes,
        ] {
            assert_eq!(ResourceKind::parse(&kind.to_string()), Some(kind));
        }
    }
}
