//! Application layer for discovery clients.
//!
//! # Sub-modules
//!
//! - **`discovery_context`** – Registers with the local repeater, resolves names
//!   with retransmission and back-off, and fans relayed beacons out to
//!   subscribers.  Depends only on the [`DatagramTransport`] trait, so it runs
//!   unchanged over real sockets or a test double.
//!
//! [`DatagramTransport`]: crate::infrastructure::transport::DatagramTransport

pub mod discovery_context;
