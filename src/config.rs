//! Configuration for ferrite-functions
//!
//! TOML file layout:
//!
//! ```toml
//! [functions]
//! load_timeout_ms = 500
//! lazyfree_flush = false
//! lua_enabled = true
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FunctionsError, Result};

/// Default time budget for compiling a library
pub const DEFAULT_LOAD_TIMEOUT_MS: u64 = 500;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Functions subsystem configuration
    pub functions: FunctionsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FunctionsError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| FunctionsError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.functions.load_timeout_ms == 0 {
            return Err(FunctionsError::Config(
                "Load timeout cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| FunctionsError::Config(format!("Failed to serialize config: {}", e)))
    }
}

/// Functions subsystem settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    /// Time budget for an engine to compile one library, in milliseconds
    pub load_timeout_ms: u64,

    /// FUNCTION FLUSH without a mode frees the old libraries in the background
    pub lazyfree_flush: bool,

    /// Register the built-in Lua engine
    pub lua_enabled: bool,
}

impl FunctionsConfig {
    /// Load timeout as a `Duration`
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: DEFAULT_LOAD_TIMEOUT_MS,
            lazyfree_flush: false,
            lua_enabled: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}
