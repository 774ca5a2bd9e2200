//! ca-repeater library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod infrastructure;

pub use infrastructure::network::relay_path::RelayPath;
pub use infrastructure::network::repeater_service::{bind, RepeaterError, RepeaterService};
pub use infrastructure::storage::config::{load_config, ConfigError, RepeaterConfig};
