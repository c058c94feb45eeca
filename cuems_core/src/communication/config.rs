/// Configuration file support for CUEMS
///
/// Lets a bus hub be described in a TOML/YAML file instead of hardcoded
/// strings. Supports auto-detection of file format and multiple search paths.
use crate::communication::bus::Mode;
use crate::error::{CuemsError, CuemsResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_auto_pong() -> bool {
    true
}

fn default_health_timeout_secs() -> f64 {
    30.0
}

fn default_ping_interval_secs() -> f64 {
    10.0
}

fn default_inactivity_threshold_secs() -> f64 {
    5.0
}

fn secs(value: f64, what: &str) -> CuemsResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| CuemsError::config(format!("Invalid {} '{}': {}", what, value, e)))
}

/// Heartbeat settings of a hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoPingConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub interval_secs: f64,

    /// Outbound silence before a ping is sent
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: f64,
}

impl Default for AutoPingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_ping_interval_secs(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
        }
    }
}

impl AutoPingConfig {
    pub fn interval(&self) -> CuemsResult<Duration> {
        secs(self.interval_secs, "auto-ping interval")
    }

    pub fn inactivity_threshold(&self) -> CuemsResult<Duration> {
        secs(self.inactivity_threshold_secs, "inactivity threshold")
    }
}

/// CUEMS bus hub configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Hub name, used in logs
    pub name: String,

    /// Full address (e.g. "tcp://0.0.0.0:9092", "ipc:///tmp/cuems.sock")
    #[serde(default)]
    pub address: Option<String>,

    /// Transport type ("tcp" or "ipc"), used when `address` is absent
    #[serde(default)]
    pub transport: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    /// Socket path for the ipc transport
    #[serde(default)]
    pub path: Option<String>,

    /// "listener"/"controller" or "dialer"/"node"; listener when absent
    #[serde(default)]
    pub mode: Option<String>,

    /// Auto-ping is off unless this section is present
    #[serde(default)]
    pub auto_ping: Option<AutoPingConfig>,

    #[serde(default = "default_auto_pong")]
    pub auto_pong: bool,

    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: f64,
}

/// Full configuration file with multiple hub definitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuemsConfig {
    /// Map of hub name -> hub config
    pub hubs: HashMap<String, HubConfig>,
}

impl HubConfig {
    /// Minimal config for a named hub at `address`
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: Some(address.into()),
            transport: None,
            host: None,
            port: None,
            path: None,
            mode: None,
            auto_ping: None,
            auto_pong: default_auto_pong(),
            health_timeout_secs: default_health_timeout_secs(),
        }
    }

    /// Get the address string for this hub
    pub fn address(&self) -> CuemsResult<String> {
        if let Some(ref address) = self.address {
            return Ok(address.clone());
        }

        match self.transport.as_deref() {
            Some("tcp") | None => {
                let port = self.port.ok_or_else(|| {
                    CuemsError::config(format!(
                        "Hub '{}' needs either an address or a port",
                        self.name
                    ))
                })?;
                let host = self.host.as_deref().unwrap_or("127.0.0.1");
                if host.contains(':') && !host.starts_with('[') {
                    Ok(format!("tcp://[{}]:{}", host, port))
                } else {
                    Ok(format!("tcp://{}:{}", host, port))
                }
            }
            Some("ipc") => {
                let path = self.path.as_deref().ok_or_else(|| {
                    CuemsError::config(format!("Hub '{}' uses ipc but has no path", self.name))
                })?;
                Ok(format!("ipc://{}", path))
            }
            Some(unknown) => Err(CuemsError::config(format!(
                "Hub '{}' has unknown transport '{}'",
                self.name, unknown
            ))),
        }
    }

    pub fn mode(&self) -> CuemsResult<Mode> {
        match self.mode.as_deref() {
            Some(mode) => mode.parse(),
            None => Ok(Mode::Listener),
        }
    }

    pub fn health_timeout(&self) -> CuemsResult<Duration> {
        secs(self.health_timeout_secs, "health timeout")
    }
}

impl CuemsConfig {
    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> CuemsResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CuemsError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_toml(&contents).or_else(|_| Self::from_yaml(&contents)),
        }
    }

    pub fn from_toml(contents: &str) -> CuemsResult<Self> {
        toml::from_str(contents)
            .map_err(|e| CuemsError::config(format!("Failed to parse TOML: {}", e)))
    }

    pub fn from_yaml(contents: &str) -> CuemsResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| CuemsError::config(format!("Failed to parse YAML: {}", e)))
    }

    /// Find and load config file from standard search paths
    ///
    /// Search order:
    /// 1. ./cuems.toml or ./cuems.yaml
    /// 2. ~/.cuems/config.toml or ~/.cuems/config.yaml
    /// 3. /etc/cuems/config.toml or /etc/cuems/config.yaml
    pub fn find_and_load() -> CuemsResult<Self> {
        for path in Self::get_search_paths() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(CuemsError::config("No config file found in standard locations"))
    }

    pub fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("cuems.toml"),
            PathBuf::from("cuems.yaml"),
            PathBuf::from("cuems.yml"),
        ];

        if let Some(home) = dirs::home_dir() {
            let cuems_dir = home.join(".cuems");
            paths.push(cuems_dir.join("config.toml"));
            paths.push(cuems_dir.join("config.yaml"));
            paths.push(cuems_dir.join("config.yml"));
        }

        paths.push(PathBuf::from("/etc/cuems/config.toml"));
        paths.push(PathBuf::from("/etc/cuems/config.yaml"));

        paths
    }

    /// Get a hub config by name
    pub fn get_hub(&self, name: &str) -> CuemsResult<&HubConfig> {
        self.hubs
            .get(name)
            .ok_or_else(|| CuemsError::config(format!("Hub '{}' not found in config", name)))
    }
}
