//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use lifx_core::LIFX_PORT;

use crate::device::RequestOptions;

/// Client configuration. File: ~/.config/lifx-lan/config.toml or /etc/lifx-lan/config.toml.
/// Env overrides: LIFX_DISCOVERY_INTERVAL, LIFX_DISCOVERY_STEP, LIFX_IPV6_PREFIX,
/// LIFX_TIMEOUT_MS, LIFX_MAX_ATTEMPTS, LIFX_BIND_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds between broadcast probes (default 180).
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    /// Probe timer tick in seconds (default 5).
    #[serde(default = "default_discovery_step")]
    pub discovery_step_secs: u64,
    /// IPv6 transition mode: derive link-local device addresses inside this prefix.
    #[serde(default)]
    pub ipv6_prefix: Option<String>,
    /// Where probes are sent (default 255.255.255.255).
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
    /// Device port probes are sent to (default 56700).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local port of the discovery socket (default 56700, 0 for ephemeral).
    #[serde(default = "default_port")]
    pub bind_port: u16,
    /// Per-attempt reply timeout in milliseconds (default 500).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per tracked request (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_discovery_interval() -> u64 {
    180
}
fn default_discovery_step() -> u64 {
    5
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_port() -> u16 {
    LIFX_PORT
}
fn default_timeout_ms() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_interval_secs: default_discovery_interval(),
            discovery_step_secs: default_discovery_step(),
            ipv6_prefix: None,
            broadcast_addr: default_broadcast_addr(),
            port: default_port(),
            bind_port: default_port(),
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Config {
    /// Request defaults every device session starts with.
    pub fn request_defaults(&self) -> RequestOptions {
        RequestOptions {
            timeout: Some(Duration::from_millis(self.timeout_ms)),
            max_attempts: Some(self.max_attempts.max(1)),
        }
    }

    pub fn discovery_step(&self) -> Duration {
        Duration::from_secs(self.discovery_step_secs.max(1))
    }

    /// Apply environment overrides on top of `self`. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("LIFX_DISCOVERY_INTERVAL").and_then(|s| s.parse().ok()) {
            self.discovery_interval_secs = v;
        }
        if let Some(v) = var("LIFX_DISCOVERY_STEP").and_then(|s| s.parse().ok()) {
            self.discovery_step_secs = v;
        }
        if let Some(s) = var("LIFX_IPV6_PREFIX") {
            self.ipv6_prefix = if s.is_empty() { None } else { Some(s) };
        }
        if let Some(v) = var("LIFX_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.timeout_ms = v;
        }
        if let Some(v) = var("LIFX_MAX_ATTEMPTS").and_then(|s| s.parse().ok()) {
            self.max_attempts = v;
        }
        if let Some(v) = var("LIFX_BIND_PORT").and_then(|s| s.parse().ok()) {
            self.bind_port = v;
        }
    }
}

/// Error reading or parsing a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: defaults, then the first config file present, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => load_file(p)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lifx-lan/config.toml"));
    }
    out.push(PathBuf::from("/etc/lifx-lan/config.toml"));
    out
}

fn load_file(path: PathBuf) -> Result<Config, ConfigError> {
    let s = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    toml::from_str(&s).map_err(|source| ConfigError::Parse { path, source })
}
