//! Infrastructure layer for the repeater.
//!
//! Contains the OS-facing adapters: UDP sockets and configuration files.  The
//! relay decisions themselves live in `ca_core::domain::registry`.

pub mod network;
pub mod storage;
