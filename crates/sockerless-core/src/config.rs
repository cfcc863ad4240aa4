//! Backend configuration.
//!
//! Configuration is layered, highest precedence first:
//!
//! 1. Environment variables (`SOCKERLESS_*`, nested keys joined by `__`)
//! 2. Configuration file (`--config`, or `/etc/sockerless/backend.toml`)
//! 3. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! listen_addr = "127.0.0.1:9100"
//! instance_id = "ci-runner-7"
//! journal_path = "/var/lib/sockerless/journal.json"
//!
//! [descriptor]
//! name = "sockerless-aca"
//!
//! [process]
//! driver = "system"
//!
//! [logs]
//! ring_capacity = 65536
//!
//! [lifecycle]
//! default_stop_timeout_secs = 10
//! kill_grace_ms = 500
//!
//! [cloud]
//! provider = "aca"
//! subscription = "0000-1111"
//! resource_group = "ci"
//! ```

use crate::error::{CoreError, Result};
use crate::manager::LifecycleConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for every configuration key.
pub const ENV_PREFIX: &str = "SOCKERLESS_";

/// Environment flag selecting host-process execution.
pub const SYNTHETIC_ENV: &str = "SOCKERLESS_SYNTHETIC";

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP listen address.
    pub listen_addr: String,
    /// Unix socket path. Takes precedence over `listen_addr`.
    pub socket_path: Option<PathBuf>,
    /// Identifier of this backend instance, used to tag cloud jobs.
    pub instance_id: Option<String>,
    /// Run workloads as host processes instead of the sandbox.
    pub synthetic: bool,
    /// Journal used to restore containers across restarts.
    pub journal_path: Option<PathBuf>,
    /// Identity reported by `/info` and `/version`.
    pub descriptor: DescriptorConfig,
    /// Process factory selection.
    pub process: ProcessConfig,
    /// Log buffering.
    pub logs: LogsConfig,
    /// Lifecycle timings.
    pub lifecycle: LifecycleSettings,
    /// Logging.
    pub logging: LoggingConfig,
    /// Cloud job inventory, when this backend fronts a cloud provider.
    pub cloud: Option<CloudConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9100".to_string(),
            socket_path: None,
            instance_id: None,
            synthetic: false,
            journal_path: None,
            descriptor: DescriptorConfig::default(),
            process: ProcessConfig::default(),
            logs: LogsConfig::default(),
            lifecycle: LifecycleSettings::default(),
            logging: LoggingConfig::default(),
            cloud: None,
        }
    }
}

impl Config {
    /// Loads configuration from the system file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Self::load_from(system_config_path())
    }

    /// Loads configuration from a specific file and the environment. A
    /// missing file is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or an environment value cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> std::result::Result<Self, figment::Error> {
        let mut config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["synthetic"]))
            .extract()?;
        if let Some(flag) = env_flag(SYNTHETIC_ENV) {
            config.synthetic = flag;
        }
        Ok(config)
    }

    /// The configured instance id, or a fresh one.
    #[must_use]
    pub fn resolved_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Lifecycle parameters for the container manager.
    #[must_use]
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            ring_capacity: self.logs.ring_capacity,
            default_stop_timeout: Duration::from_secs(self.lifecycle.default_stop_timeout_secs),
            kill_grace: Duration::from_millis(self.lifecycle.kill_grace_ms),
            attach_start_timeout: Duration::from_secs(self.lifecycle.attach_start_timeout_secs),
        }
    }
}

/// Identity reported to clients. Empty fields are derived from the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Backend name.
    pub name: Option<String>,
    /// Driver name; defaults to the process factory name.
    pub driver: Option<String>,
    /// Reported server version.
    pub server_version: Option<String>,
}

/// Process factory selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// `system` for host processes, `none` for no factory.
    pub driver: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            driver: "system".to_string(),
        }
    }
}

/// Log buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Retained bytes per container.
    pub ring_capacity: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: crate::logs::DEFAULT_RING_CAPACITY,
        }
    }
}

/// Lifecycle timings as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Stop grace period when the client gives none.
    pub default_stop_timeout_secs: u64,
    /// Wait after a forced kill before recording 137.
    pub kill_grace_ms: u64,
    /// How long attach waits for a created container to start.
    pub attach_start_timeout_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            default_stop_timeout_secs: 10,
            kill_grace_ms: 500,
            attach_start_timeout_secs: 10,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Cloud provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Provider name.
    pub provider: String,
    /// Account or subscription id.
    pub subscription: String,
    /// Resource group the jobs live in.
    pub resource_group: String,
    /// API endpoint override.
    pub endpoint: Option<String>,
}

impl CloudConfig {
    /// Checks the settings before first use.
    ///
    /// # Errors
    ///
    /// Fails with a validation error for empty identifiers or a non-HTTP
    /// endpoint.
    pub fn validate(&self) -> Result<()> {
        if self.subscription.trim().is_empty() {
            return Err(CoreError::validation("cloud.subscription must not be empty"));
        }
        if self.resource_group.trim().is_empty() {
            return Err(CoreError::validation("cloud.resource_group must not be empty"));
        }
        if let Some(endpoint) = &self.endpoint {
            let rest = endpoint
                .strip_prefix("https://")
                .or_else(|| endpoint.strip_prefix("http://"));
            if rest.map_or(true, str::is_empty) {
                return Err(CoreError::validation(format!(
                    "cloud.endpoint must be an http(s) URL, got {endpoint:?}"
                )));
            }
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/sockerless/backend.toml")
}
