//! Connectionless Channel Access commands used for discovery.
//!
//! Every command shares the 16-byte CA header:
//!
//! ```text
//! [command:2][payload_size:2][data_type:2][data_count:2][parameter1:4][parameter2:4][payload:N]
//! ```
//!
//! All multi-byte integers are big-endian.  How `data_type`, `data_count` and
//! the two parameters are used depends on the command; see each struct.

use std::fmt;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use thiserror::Error;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the common datagram header in bytes.
pub const HEADER_SIZE: usize = 16;

/// CA minor protocol version advertised in version preambles and searches.
pub const PROTOCOL_MINOR_VERSION: u16 = 13;

/// [`PROTOCOL_MINOR_VERSION`] as carried by a search request, where zero
/// would make it read as a response.
pub const SEARCH_MINOR_VERSION: NonZeroU16 = match NonZeroU16::new(PROTOCOL_MINOR_VERSION) {
    Some(version) => version,
    None => panic!("protocol minor version is zero"),
};

/// Well-known repeater (discovery) port.
pub const DEFAULT_REPEATER_PORT: u16 = 5065;

/// Well-known server port that searches are broadcast to.
pub const DEFAULT_SERVER_PORT: u16 = 5064;

/// `data_type` of a search request asking servers to answer "not found" too.
pub const SEARCH_DO_REPLY: u16 = 10;

/// `data_type` of a search request asking servers to stay silent unless found.
pub const SEARCH_NO_REPLY: u16 = 5;

/// `parameter1` value in a search response meaning "use the sender's address".
pub const SEARCH_RESPONSE_USE_SENDER: u32 = 0xFFFF_FFFF;

/// Search names are NUL-terminated and padded to a multiple of this size.
pub const PAYLOAD_ALIGNMENT: usize = 8;

/// Fixed payload size of a search response.
pub const SEARCH_RESPONSE_PAYLOAD_SIZE: usize = 8;

/// Longest name whose terminated, padded form fits a 16-bit payload size.
pub const MAX_NAME_LEN: usize = (u16::MAX as usize / PAYLOAD_ALIGNMENT) * PAYLOAD_ALIGNMENT - 1;

// ── Command identifiers ───────────────────────────────────────────────────────

/// Command ids carried in the first header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    Version = 0,
    Search = 6,
    Beacon = 13,
    RepeaterConfirm = 17,
    RepeaterRegister = 24,
}

impl TryFrom<u16> for CommandId {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, ()> {
        match value {
            0 => Ok(CommandId::Version),
            6 => Ok(CommandId::Search),
            13 => Ok(CommandId::Beacon),
            17 => Ok(CommandId::RepeaterConfirm),
            24 => Ok(CommandId::RepeaterRegister),
            _ => Err(()),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// The fixed header preceding every command on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatagramHeader {
    pub command: u16,
    /// Number of payload bytes following the header.
    pub payload_size: u16,
    pub data_type: u16,
    pub data_count: u16,
    pub parameter1: u32,
    pub parameter2: u32,
}

impl DatagramHeader {
    /// Serializes the header into its 16-byte network representation.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.command.to_be_bytes());
        out[2..4].copy_from_slice(&self.payload_size.to_be_bytes());
        out[4..6].copy_from_slice(&self.data_type.to_be_bytes());
        out[6..8].copy_from_slice(&self.data_count.to_be_bytes());
        out[8..12].copy_from_slice(&self.parameter1.to_be_bytes());
        out[12..16].copy_from_slice(&self.parameter2.to_be_bytes());
        out
    }

    /// Parses a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Returns `None` if fewer than [`HEADER_SIZE`] bytes are available.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let u32_at =
            |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(Self {
            command: u16_at(0),
            payload_size: u16_at(2),
            data_type: u16_at(4),
            data_count: u16_at(6),
            parameter1: u32_at(8),
            parameter2: u32_at(12),
        })
    }
}

// ── Per-command payloads ──────────────────────────────────────────────────────

/// VERSION (0): protocol preamble that precedes searches in one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionCommand {
    /// Circuit priority; unused for discovery and normally 0.
    pub priority: u16,
    pub minor_version: u16,
}

impl Default for VersionCommand {
    fn default() -> Self {
        Self {
            priority: 0,
            minor_version: PROTOCOL_MINOR_VERSION,
        }
    }
}

/// REPEATER_REGISTER (24): a local client asks the repeater for beacons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRepeaterRequest {
    /// Address of the requesting host as the client sees it.
    pub client_address: Ipv4Addr,
    /// Port the client listens on; 0 means "the port this datagram came from".
    pub listening_port: u16,
}

/// REPEATER_CONFIRM (17): acknowledges a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeaterConfirmResponse {
    pub repeater_address: Ipv4Addr,
}

/// RSRV_IS_UP (13): periodic liveness announcement from a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub server_minor_version: u16,
    pub server_port: u16,
    /// Monotonic per-server beacon counter.
    pub beacon_id: u32,
    pub server_address: Ipv4Addr,
}

/// Why a string cannot be used as a [`ChannelName`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum InvalidName {
    /// Names are NUL-terminated on the wire.
    #[error("name contains a NUL byte at offset {0}")]
    InteriorNul(usize),

    #[error("name is {0} bytes long; at most {MAX_NAME_LEN} fit in one search")]
    TooLong(usize),
}

/// A name that can be searched for: no NUL bytes, at most [`MAX_NAME_LEN`]
/// bytes of UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    /// # Errors
    ///
    /// Returns [`InvalidName`] if `name` contains a NUL or is too long.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidName> {
        let name = name.into();
        if let Some(offset) = name.bytes().position(|b| b == 0) {
            return Err(InvalidName::InteriorNul(offset));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(InvalidName::TooLong(name.len()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ChannelName {
    type Error = InvalidName;

    fn try_from(name: &str) -> Result<Self, InvalidName> {
        Self::new(name)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for ChannelName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ChannelName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// SEARCH (6), client to server: "who hosts this name?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub name: ChannelName,
    pub correlation_id: u32,
    /// Whether servers that do not host the name should answer anyway.
    pub reply_required: bool,
    /// Non-zero: a zero here is how a response is told apart from a request.
    pub minor_version: NonZeroU16,
}

impl SearchRequest {
    /// A search that only hosting servers answer, at this library's version.
    pub fn new(name: ChannelName, correlation_id: u32) -> Self {
        Self {
            name,
            correlation_id,
            reply_required: false,
            minor_version: SEARCH_MINOR_VERSION,
        }
    }
}

/// Where a search response says the server can be reached.
///
/// On the wire `255.255.255.255` means "the address this response came
/// from", so [`ServerAddress::new`] of the broadcast address is
/// [`ServerAddress::USE_SENDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerAddress(u32);

impl ServerAddress {
    pub const USE_SENDER: Self = Self(SEARCH_RESPONSE_USE_SENDER);

    pub fn new(ip: Ipv4Addr) -> Self {
        Self(u32::from(ip))
    }

    /// The explicit address, or `None` for [`ServerAddress::USE_SENDER`].
    pub fn ip(self) -> Option<Ipv4Addr> {
        (self != Self::USE_SENDER).then(|| Ipv4Addr::from(self.0))
    }

    pub(crate) fn from_wire(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) fn to_wire(self) -> u32 {
        self.0
    }
}

impl From<Ipv4Addr> for ServerAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self::new(ip)
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::USE_SENDER
    }
}

/// SEARCH (6), server to client: "I host the name you asked about".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResponse {
    pub correlation_id: u32,
    pub server_port: u16,
    pub server_address: ServerAddress,
    pub server_minor_version: u16,
}

// ── Top-level command enum ────────────────────────────────────────────────────

/// One decoded discovery command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version(VersionCommand),
    RegisterRepeaterRequest(RegisterRepeaterRequest),
    /// A zero-length datagram: how old clients register with a repeater.
    LegacyRepeaterRequest,
    RepeaterConfirmResponse(RepeaterConfirmResponse),
    Beacon(Beacon),
    SearchRequest(SearchRequest),
    SearchResponse(SearchResponse),
}

impl Command {
    /// Returns the wire command id, or `None` for the synthetic legacy request.
    pub fn command_id(&self) -> Option<CommandId> {
        match self {
            Command::Version(_) => Some(CommandId::Version),
            Command::RegisterRepeaterRequest(_) => Some(CommandId::RepeaterRegister),
            Command::LegacyRepeaterRequest => None,
            Command::RepeaterConfirmResponse(_) => Some(CommandId::RepeaterConfirm),
            Command::Beacon(_) => Some(CommandId::Beacon),
            Command::SearchRequest(_) | Command::SearchResponse(_) => Some(CommandId::Search),
        }
    }

    /// Returns `true` for either form of repeater registration.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            Command::RegisterRepeaterRequest(_) | Command::LegacyRepeaterRequest
        )
    }
}
