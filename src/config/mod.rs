//! Configuration management for Hearthmind
//!
//! This module provides configuration loading and saving. Configuration is
//! loaded from `~/.hearthmind/config.json` with environment variable
//! overrides following the `HEARTHMIND_SECTION_KEY` pattern.

mod types;

pub use types::*;

use std::path::{Path, PathBuf};

use crate::error::Result;

impl Config {
    /// Returns the Hearthmind configuration directory path (~/.hearthmind)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hearthmind")
    }

    /// Returns the path to the config file (~/.hearthmind/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: HEARTHMIND_SECTION_KEY
    fn apply_env_overrides(&mut self) {
        // Endpoint
        if let Ok(val) = std::env::var("HEARTHMIND_ENDPOINT_API_BASE") {
            self.endpoint.api_base = val;
        }
        if let Ok(val) = std::env::var("HEARTHMIND_ENDPOINT_API_KEY") {
            self.endpoint.api_key = val;
        }
        if let Ok(val) = std::env::var("HEARTHMIND_ENDPOINT_MODEL") {
            self.endpoint.model = val;
        }
        if let Ok(val) = std::env::var("HEARTHMIND_ENDPOINT_API_VERSION") {
            self.endpoint.api_version = val;
        }
        if let Ok(val) = std::env::var("HEARTHMIND_ENDPOINT_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.endpoint.timeout_secs = v;
            }
        }

        // Window
        if let Ok(val) = std::env::var("HEARTHMIND_WINDOW_MAX_TOKENS") {
            if let Ok(v) = val.parse() {
                self.window.max_tokens = v;
            }
        }
        if let Ok(val) = std::env::var("HEARTHMIND_WINDOW_PRESERVE_SYSTEM") {
            if let Ok(v) = val.parse() {
                self.window.preserve_system = v;
            }
        }

        // Orchestrator
        if let Ok(val) = std::env::var("HEARTHMIND_ORCHESTRATOR_MAX_ITERATIONS") {
            if let Ok(v) = val.parse() {
                self.orchestrator.max_iterations = v;
            }
        }
        if let Ok(val) = std::env::var("HEARTHMIND_ORCHESTRATOR_EARLY_DEADLINE_SECS") {
            if let Ok(v) = val.parse() {
                self.orchestrator.early_deadline_secs = v;
            }
        }

        // Tools
        if let Ok(val) = std::env::var("HEARTHMIND_TOOLS_ALLOWED_DOMAINS") {
            self.tools.allowed_domains = val
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("HEARTHMIND_TOOLS_MAX_CALLS_PER_MINUTE") {
            if let Ok(v) = val.parse() {
                self.tools.max_calls_per_minute = v;
            }
        }
        if let Ok(val) = std::env::var("HEARTHMIND_TOOLS_PARALLEL_EXECUTION") {
            if let Ok(v) = val.parse() {
                self.tools.parallel_execution = v;
            }
        }
    }
}
