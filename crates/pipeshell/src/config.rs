//! Shell configuration parsed from TOML
//!
//! ```toml
//! [environment]
//! cwd = "/srv/data"
//! interactive = false
//! inherit_env = true
//!
//! [environment.exports]
//! LANG = "C"
//!
//! [engine]
//! reap_interval_ms = 50
//! read_chunk = 1024
//! job_control = false
//! log_filter = "pipeshell=debug"
//! ```
//!
//! Locating and reading the file is up to the front end.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ShellError;

/// Full shell configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ShellConfig {
    pub environment: EnvironmentConfig,
    pub engine: EngineConfig,
}

impl ShellConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ShellError> {
        toml::from_str(text).map_err(|e| ShellError::config(e.to_string()))
    }

    /// Whether the reactor should intercept SIGINT/SIGTSTP.
    pub fn job_control(&self) -> bool {
        self.engine
            .job_control
            .unwrap_or(self.environment.interactive)
    }
}

/// Initial values of the `Environment`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Working directory; the process cwd when unset
    pub cwd: Option<PathBuf>,
    pub interactive: bool,
    /// Start from the process environment before applying `exports`
    pub inherit_env: bool,
    pub exports: BTreeMap<String, String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            cwd: None,
            interactive: false,
            inherit_env: true,
            exports: BTreeMap::new(),
        }
    }
}

/// Event loop and process engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest `poll` wait while child processes are watched
    pub reap_interval_ms: u64,
    /// Bytes requested per readiness read
    pub read_chunk: usize,
    /// Descriptor left open in children for debug output
    pub debug_fd: Option<RawFd>,
    /// Intercept SIGINT/SIGTSTP; defaults to `environment.interactive`
    pub job_control: Option<bool>,
    /// `tracing` filter directive used by `logging::init_from_config`
    pub log_filter: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reap_interval_ms: 50,
            read_chunk: 1024,
            debug_fd: None,
            job_control: None,
            log_filter: None,
        }
    }
}
