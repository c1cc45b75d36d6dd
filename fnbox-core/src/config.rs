//! Engine configuration loaded from TOML.
//!
//! ```toml
//! backend = "worker"
//! profile = "minimal"
//! timeout_ms = 2000
//!
//! [request]
//! user_agent = "fnbox (${DEPLOYMENT})"
//! ```
//!
//! `${VAR}` references are expanded from the environment before parsing,
//! and `FNBOX_BACKEND` overrides `backend` after loading.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::bridge::RequestSettings;
use crate::engine::{Limits, ResourceKind, ResourceProfile, SandboxLimits};
use crate::error::ConfigError;
use crate::executor::BackendKind;

/// Environment variable that selects the backend at startup.
pub const BACKEND_ENV: &str = "FNBOX_BACKEND";

const MIN_MEMORY_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub profile: ResourceProfile,
    pub memory_limit_bytes: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub worker_grace_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub max_code_bytes: Option<usize>,
    pub request: RequestSettings,
}

impl EngineConfig {
    /// Read, expand and validate a config file, then apply `FNBOX_BACKEND`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_backend_override(std::env::var(BACKEND_ENV).ok().as_deref())?;
        info!(path = %path.display(), backend = %config.backend, "loaded engine config");
        Ok(config)
    }

    /// Parse config text. `${VAR}` references are expanded first.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::env(content).map_err(|e| ConfigError::Expand(e.to_string()))?;
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `FNBOX_BACKEND`, for runs without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_backend_override(std::env::var(BACKEND_ENV).ok().as_deref())?;
        Ok(config)
    }

    pub fn apply_backend_override(&mut self, value: Option<&str>) -> Result<(), ConfigError> {
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            return Ok(());
        };
        self.backend = value.parse().map_err(|reason| ConfigError::Invalid {
            field: "backend",
            reason,
        })?;
        debug!(backend = %self.backend, "backend overridden from environment");
        Ok(())
    }

    /// Checks the limits as resolved from the profile and overrides, so a
    /// custom profile is held to the same bounds as a top-level override.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = self.limits();
        if limits.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if limits.memory_limit_bytes < MIN_MEMORY_BYTES {
            return Err(ConfigError::Invalid {
                field: "memory_limit_bytes",
                reason: format!("must be at least {MIN_MEMORY_BYTES}"),
            });
        }
        if limits.max_code_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_code_bytes",
                reason: "must be greater than zero".into(),
            });
        }
        if self.request.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "request.timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Profile defaults with this config's overrides applied.
    pub fn limits(&self) -> Limits {
        let mut limits = SandboxLimits::from_profile(self.profile.clone());
        let overrides = [
            (ResourceKind::HeapMax, self.memory_limit_bytes),
            (ResourceKind::TimeoutMs, self.timeout_ms),
            (ResourceKind::WorkerGraceMs, self.worker_grace_ms),
            (ResourceKind::Concurrency, self.concurrency.map(|c| c as u64)),
            (ResourceKind::MaxCodeBytes, self.max_code_bytes.map(|b| b as u64)),
        ];
        for (kind, value) in overrides {
            if let Some(value) = value {
                limits.set_override(kind, value);
            }
        }
        limits.resolve()
    }
}
