//! TOML-based configuration for discovery clients.
//!
//! ```toml
//! repeater_port = 5065
//! server_port = 5064
//! search_addresses = ["255.255.255.255"]
//!
//! [search_retry]
//! initial_delay_ms = 500
//! max_delay_ms = 5000
//! factor = 2
//! max_attempts = 4
//!
//! [registration_retry]
//! initial_delay_ms = 200
//! max_delay_ms = 200
//! factor = 1
//! max_attempts = 5
//! ```
//!
//! Every key is optional.  A retry table that names only some fields takes
//! the rest from that table's defaults above.
//!
//! The standard Channel Access variables override the file:
//! `EPICS_CA_REPEATER_PORT`, `EPICS_CA_SERVER_PORT`, and `EPICS_CA_ADDR_LIST`
//! (whitespace-separated `host[:port]` entries).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use ca_core::protocol::{DEFAULT_REPEATER_PORT, DEFAULT_SERVER_PORT};
use ca_core::{Backoff, RetryPolicy};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "CA_CLIENT_CONFIG";
pub const REPEATER_PORT_ENV: &str = "EPICS_CA_REPEATER_PORT";
pub const SERVER_PORT_ENV: &str = "EPICS_CA_SERVER_PORT";
pub const ADDR_LIST_ENV: &str = "EPICS_CA_ADDR_LIST";

/// Error type for client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
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

    /// A search address is neither `ip` nor `ip:port`.
    #[error("invalid search address {0:?}")]
    InvalidAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Discovery client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default = "default_repeater_port")]
    pub repeater_port: u16,
    /// Port assumed for search addresses that do not name one.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Where searches are sent: IPv4 literals, optionally `:port`.
    #[serde(default = "default_search_addresses")]
    pub search_addresses: Vec<String>,
    #[serde(default = "default_search_retry", deserialize_with = "search_retry_table")]
    pub search_retry: RetrySection,
    #[serde(
        default = "default_registration_retry",
        deserialize_with = "registration_retry_table"
    )]
    pub registration_retry: RetrySection,
}

/// A retry schedule as written in the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth per attempt; 1 means a fixed delay.
    pub factor: u32,
    pub max_attempts: u32,
}

/// A retry table as written, before the missing fields are filled in.
#[derive(Debug, Deserialize)]
struct RetryTable {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    factor: Option<u32>,
    max_attempts: Option<u32>,
}

impl RetryTable {
    fn over(self, base: RetrySection) -> RetrySection {
        RetrySection {
            initial_delay_ms: self.initial_delay_ms.unwrap_or(base.initial_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            factor: self.factor.unwrap_or(base.factor),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
        }
    }
}

fn search_retry_table<'de, D: Deserializer<'de>>(d: D) -> Result<RetrySection, D::Error> {
    RetryTable::deserialize(d).map(|t| t.over(default_search_retry()))
}

fn registration_retry_table<'de, D: Deserializer<'de>>(d: D) -> Result<RetrySection, D::Error> {
    RetryTable::deserialize(d).map(|t| t.over(default_registration_retry()))
}

impl RetrySection {
    pub fn to_policy(self) -> RetryPolicy {
        let initial_delay = Duration::from_millis(self.initial_delay_ms);
        let backoff = if self.factor <= 1 {
            Backoff::Fixed
        } else {
            Backoff::Exponential {
                factor: self.factor,
                max_delay: Duration::from_millis(self.max_delay_ms),
            }
        };
        RetryPolicy {
            initial_delay,
            backoff,
            max_attempts: self.max_attempts.max(1),
        }
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_repeater_port() -> u16 {
    DEFAULT_REPEATER_PORT
}
fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}
fn default_search_addresses() -> Vec<String> {
    vec![Ipv4Addr::BROADCAST.to_string()]
}
fn default_search_retry() -> RetrySection {
    RetrySection {
        initial_delay_ms: 500,
        max_delay_ms: 5000,
        factor: 2,
        max_attempts: 4,
    }
}
fn default_registration_retry() -> RetrySection {
    RetrySection {
        initial_delay_ms: 200,
        max_delay_ms: 200,
        factor: 1,
        max_attempts: 5,
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            repeater_port: default_repeater_port(),
            server_port: default_server_port(),
            search_addresses: default_search_addresses(),
            search_retry: default_search_retry(),
            registration_retry: default_registration_retry(),
        }
    }
}

impl ClientConfig {
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
    /// Returns [`ConfigError::InvalidEnv`] if a port override does not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(REPEATER_PORT_ENV) {
            self.repeater_port = parse_port(REPEATER_PORT_ENV, value)?;
        }
        if let Some(value) = lookup(SERVER_PORT_ENV) {
            self.server_port = parse_port(SERVER_PORT_ENV, value)?;
        }
        if let Some(value) = lookup(ADDR_LIST_ENV) {
            let list: Vec<String> = value.split_whitespace().map(str::to_string).collect();
            if !list.is_empty() {
                self.search_addresses = list;
            }
        }
        Ok(())
    }

    /// The local repeater's address.
    pub fn repeater_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.repeater_port))
    }

    /// Resolved search destinations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] for an entry that is not an
    /// IP address with an optional port.
    pub fn search_targets(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.search_addresses
            .iter()
            .map(|entry| {
                let entry = entry.trim();
                if let Ok(addr) = entry.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                entry
                    .parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, self.server_port))
                    .map_err(|_| ConfigError::InvalidAddress(entry.to_string()))
            })
            .collect()
    }
}

fn parse_port(name: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}

/// Loads the client config from `CA_CLIENT_CONFIG`, if set, and applies the
/// environment overrides.  Without the variable, or when the file does not
/// exist, the defaults are used.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML, and
/// [`ConfigError::InvalidEnv`] for a bad override.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    let mut cfg = match std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from) {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(content) => ClientConfig::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientConfig::default(),
            Err(e) => return Err(ConfigError::Io { path, source: e }),
        },
        None => ClientConfig::default(),
    };
    cfg.apply_env(|name| std::env::var(name).ok())?;
    Ok(cfg)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_broadcasts_to_server_port() {
        // Arrange / Act
        let cfg = ClientConfig::default();

        // Assert
        assert_eq!(cfg.repeater_addr(), "127.0.0.1:5065".parse().unwrap());
        assert_eq!(
            cfg.search_targets().unwrap(),
            vec!["255.255.255.255:5064".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn test_default_search_retry_doubles_to_five_seconds() {
        let policy = ClientConfig::default().search_retry.to_policy();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_factor_one_is_fixed_backoff() {
        let policy = default_registration_retry().to_policy();
        assert_eq!(policy.backoff, Backoff::Fixed);
        assert_eq!(policy.delay_for(5), Duration::from_millis(200));
    }

    #[test]
    fn test_addr_list_env_replaces_search_addresses() {
        // Arrange
        let mut cfg = ClientConfig::default();

        // Act
        cfg.apply_env(|name| match name {
            ADDR_LIST_ENV => Some("10.0.0.255 192.168.1.7:6064".to_string()),
            SERVER_PORT_ENV => Some("7064".to_string()),
            _ => None,
        })
        .expect("valid overrides");

        // Assert
        assert_eq!(
            cfg.search_targets().unwrap(),
            vec![
                "10.0.0.255:7064".parse::<SocketAddr>().unwrap(),
                "192.168.1.7:6064".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_bad_port_override_is_rejected() {
        let mut cfg = ClientConfig::default();
        let result = cfg.apply_env(|name| (name == REPEATER_PORT_ENV).then(|| "99999".to_string()));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv { name: REPEATER_PORT_ENV, .. })
        ));
    }

    #[test]
    fn test_hostname_search_address_is_invalid() {
        let cfg = ClientConfig {
            search_addresses: vec!["ioc.example.org".to_string()],
            ..ClientConfig::default()
        };
        assert!(matches!(
            cfg.search_targets(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_toml_overrides_only_named_fields() {
        let cfg = ClientConfig::from_toml(
            "repeater_port = 6065\n[search_retry]\ninitial_delay_ms = 100\nmax_delay_ms = 400\nfactor = 2\nmax_attempts = 3\n",
        )
        .expect("parse");
        assert_eq!(cfg.repeater_port, 6065);
        assert_eq!(cfg.server_port, 5064);
        assert_eq!(cfg.search_retry.to_policy().total_budget(), Duration::from_millis(700));
        assert_eq!(cfg.registration_retry, default_registration_retry());
    }

    #[test]
    fn test_partial_retry_tables_keep_their_own_defaults() {
        // Arrange
        let content = "[search_retry]\nmax_attempts = 2\n\n[registration_retry]\nmax_attempts = 3\n";

        // Act
        let cfg = ClientConfig::from_toml(content).expect("partial tables parse");

        // Assert
        assert_eq!(
            cfg.search_retry,
            RetrySection {
                max_attempts: 2,
                ..default_search_retry()
            }
        );
        assert_eq!(
            cfg.registration_retry,
            RetrySection {
                max_attempts: 3,
                ..default_registration_retry()
            }
        );
    }

    #[test]
    fn test_empty_retry_table_is_the_default_schedule() {
        let cfg = ClientConfig::from_toml("[search_retry]\n").expect("parse");
        assert_eq!(cfg.search_retry, default_search_retry());
    }
}
