//! Storage infrastructure: configuration loading.
//!
//! The `config` sub-module reads the repeater's TOML file, falls back to
//! defaults when it does not exist, and applies the standard Channel Access
//! environment overrides.

pub mod config;
