//! Adaptor configuration

use crate::channel::ConnectOptions;
use crate::error::{Error, Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Overrides [`AdaptorConfig::host_program`]
pub const HOST_PROGRAM_ENV: &str = "STICKYRENDER_HOST_PROGRAM";
/// Overrides [`AdaptorConfig::log_level`]
pub const LOG_LEVEL_ENV: &str = "STICKYRENDER_LOG_LEVEL";

/// How to launch the hosted application and how long to wait for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptorConfig {
    /// Program that starts the hosted application with the client stub
    pub host_program: String,
    pub host_args: Vec<String>,
    /// Extra environment for the hosted process
    pub host_env: HashMap<String, String>,
    /// Time the hosted application has to open the command channel
    pub startup_grace_secs: u64,
    pub connect_initial_backoff_ms: u64,
    pub connect_max_backoff_ms: u64,
    /// Time allowed for each initialisation action (opening a scene can take hours)
    pub init_action_timeout_secs: u64,
    /// Time allowed for a single frame; unlimited when unset
    pub render_timeout_secs: Option<u64>,
    /// Time the hosted application has to exit after `close`
    pub shutdown_timeout_secs: u64,
    /// Time between SIGTERM and kill
    pub terminate_grace_secs: u64,
    /// Output lines attached to fatal errors
    pub recent_output_lines: usize,
    pub log_level: String,
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        Self {
            host_program: "mayapy".to_string(),
            host_args: Vec::new(),
            host_env: HashMap::new(),
            startup_grace_secs: 30,
            connect_initial_backoff_ms: 50,
            connect_max_backoff_ms: 2000,
            init_action_timeout_secs: 86400,
            render_timeout_secs: None,
            shutdown_timeout_secs: 30,
            terminate_grace_secs: 5,
            recent_output_lines: 50,
            log_level: "info".to_string(),
        }
    }
}

impl AdaptorConfig {
    /// Default location: `<config dir>/stickyrender/adaptor.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("stickyrender").join("adaptor.json"))
    }

    /// Load from `path`, else the default location if it exists, else
    /// defaults; then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("No adaptor config file, using defaults");
                    Self::default()
                }
            },
        };
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("Failed to read config {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| ValidationError::Malformed {
            what: format!("config {}", path.display()),
            reason: e.to_string(),
        })?;
        info!("Loaded adaptor config from {}", path.display());
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(program) = std::env::var(HOST_PROGRAM_ENV) {
            if !program.is_empty() {
                self.host_program = program;
            }
        }
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.host_program.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "host_program".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.connect_initial_backoff_ms == 0 || self.connect_initial_backoff_ms > self.connect_max_backoff_ms {
            return Err(ValidationError::InvalidValue {
                field: "connect_initial_backoff_ms".to_string(),
                reason: "must be non-zero and no larger than connect_max_backoff_ms".to_string(),
            });
        }
        Ok(())
    }

    pub fn connect_options(&self, token: Option<String>) -> ConnectOptions {
        ConnectOptions {
            startup_grace: Duration::from_secs(self.startup_grace_secs),
            initial_backoff: Duration::from_millis(self.connect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.connect_max_backoff_ms),
            token,
        }
    }

    pub fn init_action_timeout(&self) -> Duration {
        Duration::from_secs(self.init_action_timeout_secs)
    }

    pub fn render_timeout(&self) -> Option<Duration> {
        self.render_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    /// Builder-style setters, mostly for tests and embedding
    pub fn with_host_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.host_program = program.into();
        self.host_args = args;
        self
    }

    pub fn with_host_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.host_env.insert(key.into(), value.into());
        self
    }

    pub fn with_startup_grace(mut self, secs: u64) -> Self {
        self.startup_grace_secs = secs;
        self
    }

    pub fn with_render_timeout(mut self, secs: Option<u64>) -> Self {
        self.render_timeout_secs = secs;
        self
    }
}
