//! Network infrastructure for the repeater.
//!
//! # Sub-modules
//!
//! - **`repeater_service`** – Owns the discovery socket, runs the service loop,
//!   and applies the registry's decisions by sending on relay paths.
//!
//! - **`relay_path`** – One connected loopback socket per registered client.
//!   A failed send on it is how a departed client is detected.

pub mod relay_path;
pub mod repeater_service;
