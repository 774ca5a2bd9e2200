//! Protocol module: discovery command set, binary codec, and correlation ids.

pub mod codec;
pub mod commands;
pub mod correlation;

pub use codec::{decode, decode_command, decode_datagram, encode, encode_datagram, DecodeError};
pub use commands::*;
pub use correlation::{CorrelationId, CorrelationIdAllocator};
