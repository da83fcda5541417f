//! Lifecycle Configuration
//!
//! This module holds the process-wide settings that decide how resources are
//! tracked. Configuration can be set programmatically or loaded from
//! environment variables, and is fixed once the first resource is created.
//!
//! # Environment Variables
//!
//! All environment variables use the `TETHER_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TETHER_RESOURCE_TRACING` | Create tracing reference counts ("true"/"false") | false |
//! | `TETHER_TRACE_OPERATIONS` | Capture a backtrace on every reserve/release | false |
//! | `TETHER_HISTORY_CAPACITY` | Events kept per traced resource | 64 |
//! | `TETHER_UNMONITOR_DEPTH` | Default depth of the unmonitor walk | 4 |
//! | `TETHER_SWEEP_INTERVAL_MS` | Leak watchdog period in milliseconds (0 = on demand) | 0 |
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::config::TetherConfig;
//!
//! // Load from environment with defaults
//! let config = TetherConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = TetherConfig::builder()
//!     .resource_tracing(true)
//!     .history_capacity(256)
//!     .build()?;
//! tether_core::init(config)?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Default number of history events kept per traced resource.
pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

/// Default depth of the unmonitor walk.
pub const DEFAULT_UNMONITOR_DEPTH: usize = 4;

/// Upper bound accepted for the unmonitor depth.
pub const MAX_UNMONITOR_DEPTH: usize = 64;

/// Resource tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Create tracing reference counts instead of vanilla ones.
    /// Default: false.
    pub enabled: bool,

    /// Capture a full backtrace for every reserve/release event, not only at
    /// construction.
    /// Default: false.
    pub capture_operations: bool,

    /// Maximum number of history events kept per resource.
    /// Default: 64.
    pub history_capacity: usize,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capture_operations: false,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Unmonitor walk configuration.
#[derive(Debug, Clone)]
pub struct UnmonitorConfig {
    /// How many levels of owned resources the walk descends.
    /// Default: 4.
    pub depth: usize,
}

impl Default for UnmonitorConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_UNMONITOR_DEPTH,
        }
    }
}

/// Leak sweep configuration.
#[derive(Debug, Clone, Default)]
pub struct SweepConfig {
    /// Period of the background leak watchdog.
    /// None means sweeps only run on demand (default).
    pub interval: Option<Duration>,
}

/// Complete lifecycle configuration.
///
/// Use `TetherConfig::default()` for production defaults (vanilla reference
/// counts), or `TetherConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct TetherConfig {
    /// Tracing configuration.
    pub tracing: TracingConfig,

    /// Unmonitor configuration.
    pub unmonitor: UnmonitorConfig,

    /// Sweep configuration.
    pub sweep: SweepConfig,
}

impl TetherConfig {
    /// Create a new builder for TetherConfig.
    pub fn builder() -> TetherConfigBuilder {
        TetherConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set use default values. Invalid values are
    /// logged as warnings and the default is kept.
    pub fn from_env() -> Self {
        Self::from_source(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary key/value source.
    pub fn from_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = parse_bool(&lookup, "TETHER_RESOURCE_TRACING") {
            config.tracing.enabled = val;
        }

        if let Some(val) = parse_bool(&lookup, "TETHER_TRACE_OPERATIONS") {
            config.tracing.capture_operations = val;
        }

        if let Some(val) = parse_usize(&lookup, "TETHER_HISTORY_CAPACITY") {
            if val > 0 {
                config.tracing.history_capacity = val;
            }
        }

        if let Some(val) = parse_usize(&lookup, "TETHER_UNMONITOR_DEPTH") {
            if val <= MAX_UNMONITOR_DEPTH {
                config.unmonitor.depth = val;
            }
        }

        if let Some(val) = parse_usize(&lookup, "TETHER_SWEEP_INTERVAL_MS") {
            config.sweep.interval = if val > 0 {
                Some(Duration::from_millis(val as u64))
            } else {
                None
            };
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracing.history_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tracing.history_capacity".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.unmonitor.depth > MAX_UNMONITOR_DEPTH {
            return Err(ConfigError::InvalidValue {
                field: "unmonitor.depth".into(),
                message: format!("must be at most {MAX_UNMONITOR_DEPTH}"),
            });
        }

        if self.sweep.interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::InvalidValue {
                field: "sweep.interval".into(),
                message: "must be non-zero, use None to disable".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },

    /// The process-wide configuration was already fixed.
    #[error("configuration already initialized")]
    AlreadyInitialized,
}

/// Builder for TetherConfig.
#[derive(Debug, Clone, Default)]
pub struct TetherConfigBuilder {
    config: TetherConfig,
}

impl TetherConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable tracing reference counts.
    pub fn resource_tracing(mut self, enabled: bool) -> Self {
        self.config.tracing.enabled = enabled;
        self
    }

    /// Enable or disable per-operation backtraces.
    pub fn capture_operations(mut self, enabled: bool) -> Self {
        self.config.tracing.capture_operations = enabled;
        self
    }

    /// Set the per-resource history capacity.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.tracing.history_capacity = capacity;
        self
    }

    /// Set the default unmonitor depth.
    pub fn unmonitor_depth(mut self, depth: usize) -> Self {
        self.config.unmonitor.depth = depth;
        self
    }

    /// Set the leak watchdog period.
    pub fn sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.sweep.interval = interval;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<TetherConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> TetherConfig {
        self.config
    }
}

fn parse_usize<F>(lookup: &F, name: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(val) => Some(val),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring non-numeric configuration value");
            None
        }
    }
}

fn parse_bool<F>(lookup: &F, name: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(variable = name, value = %raw, "ignoring non-boolean configuration value");
            None
        }
    }
}
