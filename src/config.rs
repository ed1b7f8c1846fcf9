//! Configuration for consrv.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.consrv/config.toml`
//! - Launch arguments that override the file
//!
//! # Configuration File
//!
//! ```toml
//! # Log level: error, warn, info, debug, trace
//! log_level = "info"
//!
//! [handoff]
//! # Terminal to delegate new sessions to (CLSID)
//! target = "2EACA947-7F5F-4CFA-BA87-8F7FBEEFBE69"
//!
//! [session]
//! history_buffers = 4
//! screen_width = 120
//! screen_height = 9001
//! window_width = 120
//! window_height = 30
//! default_title = "Console"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::object::Size;
use crate::history::DEFAULT_BUFFER_COUNT;
use crate::server::handoff::HandoffTargetId;
use crate::server::init::SessionDefaults;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub handoff: HandoffConfig,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            handoff: HandoffConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Handoff settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Registered handoff handler
    pub target: Option<HandoffTargetId>,
}

/// Session bring-up settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub history_buffers: usize,
    pub screen_width: u16,
    pub screen_height: u16,
    pub window_width: u16,
    pub window_height: u16,
    pub default_title: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = SessionDefaults::default();
        Self {
            history_buffers: DEFAULT_BUFFER_COUNT,
            screen_width: defaults.screen_buffer_size.width,
            screen_height: defaults.screen_buffer_size.height,
            window_width: defaults.window_size.width,
            window_height: defaults.window_size.height,
            default_title: defaults.title,
        }
    }
}

impl SessionConfig {
    pub fn defaults(&self) -> SessionDefaults {
        SessionDefaults {
            screen_buffer_size: Size::new(self.screen_width, self.screen_height),
            window_size: Size::new(self.window_width, self.window_height),
            title: self.default_title.clone(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) if path.exists() => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("{}; using defaults", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Load configuration from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }
}

/// Launch arguments that shape the session and the handoff decision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchArgs {
    /// Running behind a pseudo-console; no window
    pub headless: bool,
    /// Started explicitly to host a session here
    pub create_server_handle: bool,
    /// Never hand off
    pub force_no_handoff: bool,
    /// Started by another console as a handoff target
    pub handoff_target: bool,
}

/// `~/.consrv`, created on first use
pub fn config_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".consrv");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
