//! Configuration file loading and management
//!
//! Sandbox configuration lives in `$XDG_CONFIG_HOME/sandbox/config.toml`.
//! It supplies the default restriction policy that boundaries inherit when the
//! caller does not pass one explicitly. If the file doesn't exist, a default
//! deny-all configuration is created with documented comments.

use crate::error::{SandboxError, SandboxResult};
use crate::policy::RestrictionPolicy;
use crate::vm::DEFAULT_MAX_CALL_DEPTH;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound accepted for `max_call_depth`.
pub const MAX_CALL_DEPTH_LIMIT: usize = 4096;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main sandbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SandboxConfig {
    /// Runtime settings
    #[serde(default)]
    pub sandbox: SandboxSettings,
    /// Default restriction policy for new boundaries
    #[serde(default)]
    pub policy: RestrictionPolicy,
}

/// Runtime settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxSettings {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum unit call depth
    /// Default: 256
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Base directory used when a boundary does not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_base_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_call_depth() -> usize {
    DEFAULT_MAX_CALL_DEPTH
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_call_depth: default_max_call_depth(),
            default_base_dir: None,
        }
    }
}

impl SandboxConfig {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> SandboxResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> SandboxResult<Self> {
        let config: SandboxConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> SandboxResult<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/sandbox/config.toml`
    pub fn default_config_path() -> SandboxResult<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "raibid-labs", "sandbox").ok_or_else(|| {
            SandboxError::Config("Failed to determine project directories".to_string())
        })?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> SandboxResult<()> {
        if !LOG_LEVELS.contains(&self.sandbox.log_level.as_str()) {
            return Err(SandboxError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.sandbox.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.sandbox.max_call_depth == 0 || self.sandbox.max_call_depth > MAX_CALL_DEPTH_LIMIT {
            return Err(SandboxError::Config(format!(
                "max_call_depth must be between 1 and {}",
                MAX_CALL_DEPTH_LIMIT
            )));
        }

        if let Some(dir) = &self.sandbox.default_base_dir {
            if !dir.is_absolute() {
                return Err(SandboxError::Config(format!(
                    "default_base_dir must be absolute, got {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    /// Create a default configuration file with documented comments
    fn create_default_file(path: &Path) -> SandboxResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, Self::default_config_content())?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    pub fn default_config_content() -> &'static str {
        r#"# Sandbox Configuration

[sandbox]
# Log level: trace, debug, info, warn, error
# Default: "info"
log_level = "info"

# Maximum call depth for unit code
# Default: 256
max_call_depth = 256

# Base directory for boundaries that don't name one (must be absolute)
# default_base_dir = "/var/lib/sandbox"

# Default restriction policy inherited by new sandboxes.
# Anything not listed is denied. Value shapes by capability:
#   grant state  (file_io, web, registry, environment, ui, ...): "granted" | "denied" | "none"
#   flag sets    (security, reflection, key_container, store, type_descriptor): ["flag", ...]
#   zone         (zone_identity): "my_computer" | "intranet" | "trusted" | "internet" | "untrusted"
# Run `sandbox-runner --list-capabilities` for the full catalog.
[policy]
# file_io = "granted"
# reflection = ["type_information"]
# zone_identity = "internet"
"#
    }
}
