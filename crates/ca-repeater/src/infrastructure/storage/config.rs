//! TOML-based configuration for the repeater daemon.
//!
//! The file is looked up in this order:
//! 1. The path in `CA_REPEATER_CONFIG`, if set.
//! 2. The platform config directory:
//!    - Windows:  `%APPDATA%\ca-repeater\config.toml`
//!    - Linux:    `~/.config/ca-repeater/config.toml`
//!    - macOS:    `~/Library/Application Support/ca-repeater/config.toml`
//!
//! A missing file yields the defaults.  `EPICS_CA_REPEATER_PORT` then
//! overrides the port, matching every other Channel Access tool on the host.
//!
//! ```toml
//! [repeater]
//! port = 5065
//! bind_address = "0.0.0.0"
//! log_level = "info"
//! relay_handshake_timeout_ms = 1000
//!
//! [upstream]
//! beacon_port = 5066
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use ca_core::protocol::DEFAULT_REPEATER_PORT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CA_REPEATER_CONFIG";

/// Environment variable overriding the repeater port.
pub const REPEATER_PORT_ENV: &str = "EPICS_CA_REPEATER_PORT";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override held something other than a port number.
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },

    /// `bind_address` is not an IP address.
    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level repeater configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepeaterConfig {
    #[serde(default)]
    pub repeater: RepeaterSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
}

/// Discovery socket and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepeaterSection {
    /// UDP port the repeater owns; binding it is the one-per-host guard.
    #[serde(default = "default_port")]
    pub port: u16,
    /// IP address to bind the discovery socket to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound on opening a relay path to a new client.
    #[serde(default = "default_relay_handshake_timeout_ms")]
    pub relay_handshake_timeout_ms: u64,
}

/// Optional separate socket on which server beacons arrive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpstreamSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beacon_port: Option<u16>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_port() -> u16 {
    DEFAULT_REPEATER_PORT
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_relay_handshake_timeout_ms() -> u64 {
    1000
}

impl Default for RepeaterSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            log_level: default_log_level(),
            relay_handshake_timeout_ms: default_relay_handshake_timeout_ms(),
        }
    }
}

impl RepeaterConfig {
    /// Parses a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is malformed.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies environment overrides, reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if an override is not a port number.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(REPEATER_PORT_ENV) {
            self.repeater.port = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: REPEATER_PORT_ENV,
                value,
            })?;
        }
        Ok(())
    }

    /// Address the discovery socket binds to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddress`] if `bind_address` does not parse.
    pub fn discovery_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .repeater
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.repeater.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.repeater.port))
    }

    /// Address of the upstream beacon socket, if one is configured.
    pub fn upstream_addr(&self) -> Option<SocketAddr> {
        self.upstream
            .beacon_port
            .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    pub fn relay_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.repeater.relay_handshake_timeout_ms)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the config file path: `CA_REPEATER_CONFIG`, else the platform dir.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if neither is available.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config from disk and applies environment overrides.
///
/// A missing file, or a platform without a config directory, yields the
/// defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::InvalidEnv`] for a bad override.
pub fn load_config() -> Result<RepeaterConfig, ConfigError> {
    let mut cfg = match config_file_path() {
        Ok(path) => match std::fs::read_to_string(&path) {
            Ok(content) => RepeaterConfig::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RepeaterConfig::default(),
            Err(e) => return Err(ConfigError::Io { path, source: e }),
        },
        Err(ConfigError::NoPlatformConfigDir) => RepeaterConfig::default(),
        Err(e) => return Err(e),
    };
    cfg.apply_env(|name| std::env::var(name).ok())?;
    Ok(cfg)
}

/// Resolves the platform config directory for the repeater.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("ca-repeater"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("ca-repeater"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("ca-repeater")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_standard_repeater_port() {
        // Arrange / Act
        let cfg = RepeaterConfig::default();

        // Assert
        assert_eq!(cfg.repeater.port, 5065);
        assert_eq!(cfg.repeater.bind_address, "0.0.0.0");
        assert_eq!(cfg.relay_handshake_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.upstream_addr(), None);
    }

    #[test]
    fn test_partial_toml_fills_in_defaults() {
        let cfg = RepeaterConfig::from_toml("[repeater]\nport = 6065\n").expect("parse");
        assert_eq!(cfg.repeater.port, 6065);
        assert_eq!(cfg.repeater.log_level, "info");
        assert_eq!(cfg.repeater.relay_handshake_timeout_ms, 1000);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(RepeaterConfig::from_toml("").expect("parse"), RepeaterConfig::default());
    }

    #[test]
    fn test_upstream_section_enables_beacon_socket() {
        let cfg = RepeaterConfig::from_toml("[upstream]\nbeacon_port = 5066\n").expect("parse");
        assert_eq!(cfg.upstream_addr(), Some("0.0.0.0:5066".parse().unwrap()));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = RepeaterConfig::from_toml("[repeater\nport = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_override_replaces_port() {
        // Arrange
        let mut cfg = RepeaterConfig::default();

        // Act
        cfg.apply_env(|name| (name == REPEATER_PORT_ENV).then(|| "7065".to_string()))
            .expect("valid override");

        // Assert
        assert_eq!(cfg.repeater.port, 7065);
        assert_eq!(cfg.discovery_addr().unwrap(), "0.0.0.0:7065".parse().unwrap());
    }

    #[test]
    fn test_env_override_rejects_non_numeric_port() {
        let mut cfg = RepeaterConfig::default();
        let result = cfg.apply_env(|_| Some("not-a-port".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
        assert_eq!(cfg.repeater.port, 5065);
    }

    #[test]
    fn test_invalid_bind_address_is_reported() {
        let mut cfg = RepeaterConfig::default();
        cfg.repeater.bind_address = "localhost".to_string();
        assert!(matches!(
            cfg.discovery_addr(),
            Err(ConfigError::InvalidBindAddress(_))
        ));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut cfg = RepeaterConfig::default();
        cfg.upstream.beacon_port = Some(5066);
        let text = toml::to_string_pretty(&cfg).expect("serialize");
        assert_eq!(RepeaterConfig::from_toml(&text).expect("parse"), cfg);
    }
}
