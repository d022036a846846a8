//! Engine configuration
//!
//! JSON-serialisable settings for context creation and solver defaults.
//! Every field has a default, so a partial (or empty) document is valid:
//!
//! ```json
//! {
//!   "backend": { "device": "gpu", "allow_host_fallback": true },
//!   "solver": { "tolerance": 1e-10, "gmres_restart": 50 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::runtime::{ContextOptions, DeviceKind, DeviceSelector};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Device selection and allocation limits
    #[serde(default)]
    pub backend: BackendConfig,

    /// Expression lowering
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Iterative solver defaults
    #[serde(default)]
    pub solver: SolverDefaults,
}

/// Device selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Requested device kind
    #[serde(default)]
    pub device: DeviceKind,

    /// Device ordinal
    #[serde(default)]
    pub index: usize,

    /// Fall back to the host when no device matches
    #[serde(default = "default_allow_host_fallback")]
    pub allow_host_fallback: bool,

    /// Host worker lanes (`None` picks from the available parallelism)
    #[serde(default)]
    pub host_lanes: Option<usize>,

    /// Per-context allocation limit in bytes
    #[serde(default)]
    pub memory_limit: Option<usize>,
}

fn default_allow_host_fallback() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::default(),
            index: 0,
            allow_host_fallback: default_allow_host_fallback(),
            host_lanes: None,
            memory_limit: None,
        }
    }
}

impl BackendConfig {
    /// Selector for [`crate::runtime::Context::acquire`]
    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector::new(self.device)
            .with_index(self.index)
            .with_host_fallback(self.allow_host_fallback)
    }
}

/// Expression lowering settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Fuse elementwise subgraphs
    #[serde(default = "default_fusion")]
    pub fusion: bool,

    /// Cap on inputs per fused kernel
    #[serde(default)]
    pub max_fused_inputs: Option<usize>,
}

fn default_fusion() -> bool {
    true
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fusion: default_fusion(),
            max_fused_inputs: None,
        }
    }
}

/// Defaults picked up by the solver option types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverDefaults {
    /// Relative residual tolerance `||r|| <= tol * ||b||`
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Iteration budget
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// GMRES restart length (Krylov basis bound)
    #[serde(default = "default_gmres_restart")]
    pub gmres_restart: usize,

    /// Relative change in the eigenvalue estimate treated as stable
    #[serde(default = "default_eigen_tolerance")]
    pub eigen_tolerance: f64,

    /// Record the residual norm of every iteration
    #[serde(default)]
    pub record_history: bool,
}

fn default_tolerance() -> f64 {
    1e-8
}
fn default_max_iterations() -> usize {
    1000
}
fn default_gmres_restart() -> usize {
    30
}
fn default_eigen_tolerance() -> f64 {
    1e-8
}

impl Default for SolverDefaults {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
            gmres_restart: default_gmres_restart(),
            eigen_tolerance: default_eigen_tolerance(),
            record_history: false,
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> Error {
    Error::Config {
        key: key.to_string(),
        reason: reason.into(),
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| invalid("<json>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(&path.display().to_string(), e.to_string()))?;
        Self::from_json_str(&content)
    }

    /// Serialise as pretty-printed JSON
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| invalid("<json>", e.to_string()))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.backend.host_lanes == Some(0) {
            return Err(invalid("backend.host_lanes", "must be at least 1"));
        }
        if self.backend.memory_limit == Some(0) {
            return Err(invalid("backend.memory_limit", "must be positive"));
        }
        if matches!(self.dispatcher.max_fused_inputs, Some(n) if n < 2) {
            return Err(invalid("dispatcher.max_fused_inputs", "must be at least 2"));
        }
        let s = &self.solver;
        if !(s.tolerance.is_finite() && s.tolerance > 0.0) {
            return Err(invalid("solver.tolerance", format!("{} is not a positive number", s.tolerance)));
        }
        if !(s.eigen_tolerance.is_finite() && s.eigen_tolerance > 0.0) {
            return Err(invalid(
                "solver.eigen_tolerance",
                format!("{} is not a positive number", s.eigen_tolerance),
            ));
        }
        if s.max_iterations == 0 {
            return Err(invalid("solver.max_iterations", "must be at least 1"));
        }
        if s.gmres_restart == 0 {
            return Err(invalid("solver.gmres_restart", "must be at least 1"));
        }
        Ok(())
    }

    /// Context options from the backend and dispatcher sections
    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            fusion: self.dispatcher.fusion,
            max_fused_inputs: self.dispatcher.max_fused_inputs,
            memory_limit: self.backend.memory_limit,
            host_lanes: self.backend.host_lanes,
        }
    }
}
