//! Protocol state machines with no I/O.
//!
//! Everything here is driven by the caller: inbound commands and the current
//! time go in, actions and events come out.  The same logic therefore runs
//! under a threaded host (behind a mutex) or inside a single async task.

/// Repeater registry and relay decisions.
pub mod registry;

/// Search tickets and retry policy.
pub mod search;

/// Client broadcaster session.
pub mod session;
