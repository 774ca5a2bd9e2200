//! Infrastructure layer for discovery clients.
//!
//! - **`transport`** – The datagram transport trait and its UDP implementation.
//! - **`config`** – TOML configuration with the standard environment overrides.
//!
//! **Dependency rule**: `application` depends on the `transport` trait, never on
//! `UdpTransport` directly.

pub mod config;
pub mod transport;
