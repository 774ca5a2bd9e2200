//! # ca-core
//!
//! Shared library for Channel Access discovery: the datagram codec, the
//! repeater's peer registry, and the client-side broadcaster session.
//!
//! This crate is used by both the repeater daemon and the client library.
//! It opens no sockets and reads no clocks; callers feed it bytes and
//! timestamps and act on what it returns.
//!
//! # Architecture overview
//!
//! Channel Access clients find servers by broadcasting name searches over
//! UDP.  Servers announce themselves with periodic beacons, and because only
//! one process per host can own the beacon port, a small *repeater* daemon
//! binds it and fans each beacon out to every local client that registered.
//!
//! - **`protocol`** – How bytes travel over the network.  Every command is a
//!   16-byte big-endian header plus an optional payload, and several
//!   commands may share one datagram.
//!
//! - **`domain`** – The protocol state machines: the repeater registry that
//!   decides who receives each datagram, the session a client uses to
//!   register and correlate searches, and the retry policy for searches.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `ca_core::RepeaterRegistry` instead of `ca_core::domain::registry::RepeaterRegistry`.
pub use domain::registry::{
    ClientRegistration, Confirmation, DiscardReason, InboundAction, RelayState, RelayTarget,
    RepeaterRegistry, RepeaterStats,
};
pub use domain::search::{Backoff, RetryPolicy, SearchTicket, TicketState, TicketStep};
pub use domain::session::{BroadcasterSession, ProtocolError, RegistrationState, SessionEvent};
pub use protocol::codec::{decode, decode_command, decode_datagram, encode, encode_datagram, DecodeError};
pub use protocol::commands::{ChannelName, Command, InvalidName, ServerAddress};
pub use protocol::correlation::CorrelationId;
