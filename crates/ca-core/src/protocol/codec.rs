//! Binary codec for the connectionless Channel Access discovery commands.
//!
//! Wire format of one command:
//! ```text
//! [command:2][payload_size:2][data_type:2][data_count:2][parameter1:4][parameter2:4][payload:N]
//! ```
//! A datagram carries one or more commands back to back.  A datagram with no
//! bytes at all is how pre-R3.12 clients register with a repeater; it decodes
//! to [`Command::LegacyRepeaterRequest`].
//!
//! # What is the Channel Access header? (for beginners)
//!
//! Channel Access (CA) is the network protocol EPICS control systems use to
//! read and write named process variables such as `motor1.VAL`.  Every CA
//! message, on TCP or UDP, starts with the same 16-byte header.  The first
//! field says which command this is; the meaning of the other four depends on
//! the command.  For discovery:
//!
//! | Command            | `data_type`     | `data_count`    | `parameter1`  | `parameter2`  |
//! |--------------------|-----------------|-----------------|---------------|---------------|
//! | Search request     | reply flag      | minor version   | search id     | search id     |
//! | Search response    | server TCP port | 0               | server IPv4   | search id     |
//! | Beacon             | minor version   | server TCP port | beacon number | server IPv4   |
//! | Repeater register  | 0               | 0               | client port   | client IPv4   |
//!
//! Only a search request has a payload: the name, NUL-terminated and padded
//! to a multiple of 8 bytes.  Request and response share command 6, so a
//! zero `data_count` is what marks a response.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use crate::protocol::commands::{
    Beacon, ChannelName, Command, CommandId, DatagramHeader, RegisterRepeaterRequest,
    RepeaterConfirmResponse, SearchRequest, SearchResponse, ServerAddress, VersionCommand,
    HEADER_SIZE, PAYLOAD_ALIGNMENT, SEARCH_DO_REPLY, SEARCH_NO_REPLY,
    SEARCH_RESPONSE_PAYLOAD_SIZE,
};
use thiserror::Error;

/// Errors produced while decoding a datagram.
///
/// Every variant is recoverable: the datagram is discarded and the receiver
/// carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes do not form a valid command (short header, bad name, trailing data).
    #[error("malformed datagram: {0}")]
    Malformed(String),

    /// The command id in the header is not part of the discovery command set.
    #[error("unknown command id: {0}")]
    UnknownCommand(u16),

    /// The header declares more payload than the datagram holds.
    #[error("truncated payload: header declares {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a single [`Command`] into its wire bytes.
///
/// Never fails, and every command decodes back to itself: the command types
/// cannot hold values the wire cannot carry.  [`Command::LegacyRepeaterRequest`]
/// encodes to an empty vector.
///
/// # Examples
///
/// ```rust
/// use ca_core::protocol::{decode, encode, Command};
///
/// let bytes = encode(&Command::LegacyRepeaterRequest);
/// assert!(bytes.is_empty());
/// assert_eq!(decode(&bytes).unwrap(), Command::LegacyRepeaterRequest);
/// ```
pub fn encode(command: &Command) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + PAYLOAD_ALIGNMENT);
    encode_into(&mut buf, command);
    buf
}

/// Encodes several commands into one datagram, in order.
pub fn encode_datagram(commands: &[Command]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(commands.len() * (HEADER_SIZE + PAYLOAD_ALIGNMENT));
    for command in commands {
        encode_into(&mut buf, command);
    }
    buf
}

/// Decodes a datagram that carries exactly one command.
///
/// An empty slice decodes to [`Command::LegacyRepeaterRequest`].
///
/// # Errors
///
/// Returns [`DecodeError`] if the bytes are not exactly one valid command.
pub fn decode(bytes: &[u8]) -> Result<Command, DecodeError> {
    if bytes.is_empty() {
        return Ok(Command::LegacyRepeaterRequest);
    }
    let (command, consumed) = decode_command(bytes)?;
    if consumed != bytes.len() {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes after {consumed}-byte command",
            bytes.len() - consumed
        )));
    }
    Ok(command)
}

/// Decodes every command in a datagram.
///
/// An empty slice yields a single [`Command::LegacyRepeaterRequest`].
///
/// # Errors
///
/// Fails on the first command that cannot be decoded; commands before it
/// are dropped along with the rest of the datagram.
pub fn decode_datagram(bytes: &[u8]) -> Result<Vec<Command>, DecodeError> {
    if bytes.is_empty() {
        return Ok(vec![Command::LegacyRepeaterRequest]);
    }
    let mut commands = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (command, consumed) = decode_command(&bytes[offset..])?;
        commands.push(command);
        offset += consumed;
    }
    Ok(commands)
}

/// Decodes one command from the front of `bytes`.
///
/// Returns the command and the number of bytes consumed (header + payload).
///
/// # Errors
///
/// Returns [`DecodeError`] if the header is incomplete, the command id is
/// unknown, or the payload is shorter than declared or malformed.
pub fn decode_command(bytes: &[u8]) -> Result<(Command, usize), DecodeError> {
    let header = DatagramHeader::from_bytes(bytes).ok_or_else(|| {
        DecodeError::Malformed(format!(
            "need {HEADER_SIZE} header bytes, got {}",
            bytes.len()
        ))
    })?;

    let command_id = CommandId::try_from(header.command)
        .map_err(|_| DecodeError::UnknownCommand(header.command))?;

    let payload_size = header.payload_size as usize;
    let total = HEADER_SIZE + payload_size;
    if bytes.len() < total {
        return Err(DecodeError::TruncatedPayload {
            declared: payload_size,
            available: bytes.len() - HEADER_SIZE,
        });
    }

    let payload = &bytes[HEADER_SIZE..total];
    let command = decode_body(command_id, &header, payload)?;
    Ok((command, total))
}

// ── Encoding ──────────────────────────────────────────────────────────────────

fn encode_into(buf: &mut Vec<u8>, command: &Command) {
    match command {
        Command::Version(v) => write_header(
            buf,
            DatagramHeader {
                command: CommandId::Version as u16,
                data_type: v.priority,
                data_count: v.minor_version,
                ..Default::default()
            },
        ),
        Command::RegisterRepeaterRequest(r) => write_header(
            buf,
            DatagramHeader {
                command: CommandId::RepeaterRegister as u16,
                parameter1: u32::from(r.listening_port),
                parameter2: u32::from(r.client_address),
                ..Default::default()
            },
        ),
        Command::LegacyRepeaterRequest => {}
        Command::RepeaterConfirmResponse(c) => write_header(
            buf,
            DatagramHeader {
                command: CommandId::RepeaterConfirm as u16,
                parameter2: u32::from(c.repeater_address),
                ..Default::default()
            },
        ),
        Command::Beacon(b) => write_header(
            buf,
            DatagramHeader {
                command: CommandId::Beacon as u16,
                data_type: b.server_minor_version,
                data_count: b.server_port,
                parameter1: b.beacon_id,
                parameter2: u32::from(b.server_address),
                ..Default::default()
            },
        ),
        Command::SearchRequest(s) => encode_search_request(buf, s),
        Command::SearchResponse(s) => encode_search_response(buf, s),
    }
}

fn write_header(buf: &mut Vec<u8>, header: DatagramHeader) {
    buf.extend_from_slice(&header.to_bytes());
}

fn encode_search_request(buf: &mut Vec<u8>, s: &SearchRequest) {
    let payload = padded_name(&s.name);
    write_header(
        buf,
        DatagramHeader {
            command: CommandId::Search as u16,
            payload_size: payload.len() as u16,
            data_type: if s.reply_required {
                SEARCH_DO_REPLY
            } else {
                SEARCH_NO_REPLY
            },
            data_count: s.minor_version.get(),
            parameter1: s.correlation_id,
            parameter2: s.correlation_id,
        },
    );
    buf.extend_from_slice(&payload);
}

fn encode_search_response(buf: &mut Vec<u8>, s: &SearchResponse) {
    write_header(
        buf,
        DatagramHeader {
            command: CommandId::Search as u16,
            payload_size: SEARCH_RESPONSE_PAYLOAD_SIZE as u16,
            data_type: s.server_port,
            data_count: 0,
            parameter1: s.server_address.to_wire(),
            parameter2: s.correlation_id,
        },
    );
    let mut payload = [0u8; SEARCH_RESPONSE_PAYLOAD_SIZE];
    payload[0..2].copy_from_slice(&s.server_minor_version.to_be_bytes());
    buf.extend_from_slice(&payload);
}

/// NUL-terminates `name` and pads it with NULs to a multiple of 8 bytes.
fn padded_name(name: &ChannelName) -> Vec<u8> {
    let bytes = name.as_str().as_bytes();
    let padded_len = (bytes.len() / PAYLOAD_ALIGNMENT + 1) * PAYLOAD_ALIGNMENT;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(bytes);
    out.resize(padded_len, 0);
    out
}

// ── Decoding ──────────────────────────────────────────────────────────────────

fn decode_body(
    id: CommandId,
    header: &DatagramHeader,
    payload: &[u8],
) -> Result<Command, DecodeError> {
    match id {
        CommandId::Version => Ok(Command::Version(VersionCommand {
            priority: header.data_type,
            minor_version: header.data_count,
        })),
        CommandId::RepeaterRegister => {
            let listening_port = u16::try_from(header.parameter1).map_err(|_| {
                DecodeError::Malformed(format!(
                    "register request port {} out of range",
                    header.parameter1
                ))
            })?;
            Ok(Command::RegisterRepeaterRequest(RegisterRepeaterRequest {
                client_address: Ipv4Addr::from(header.parameter2),
                listening_port,
            }))
        }
        CommandId::RepeaterConfirm => {
            Ok(Command::RepeaterConfirmResponse(RepeaterConfirmResponse {
                repeater_address: Ipv4Addr::from(header.parameter2),
            }))
        }
        CommandId::Beacon => Ok(Command::Beacon(Beacon {
            server_minor_version: header.data_type,
            server_port: header.data_count,
            beacon_id: header.parameter1,
            server_address: Ipv4Addr::from(header.parameter2),
        })),
        // Requests carry the client's protocol version in data_count; responses
        // leave it zero.
        CommandId::Search => match NonZeroU16::new(header.data_count) {
            Some(minor_version) => decode_search_request(header, minor_version, payload),
            None => decode_search_response(header, payload),
        },
    }
}

fn decode_search_request(
    header: &DatagramHeader,
    minor_version: NonZeroU16,
    payload: &[u8],
) -> Result<Command, DecodeError> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| DecodeError::Malformed("search name is not NUL-terminated".to_string()))?;
    let name = std::str::from_utf8(&payload[..end])
        .map_err(|e| DecodeError::Malformed(format!("search name is not UTF-8: {e}")))?;
    let name = ChannelName::new(name)
        .map_err(|e| DecodeError::Malformed(format!("search name: {e}")))?;
    Ok(Command::SearchRequest(SearchRequest {
        name,
        correlation_id: header.parameter2,
        reply_required: header.data_type == SEARCH_DO_REPLY,
        minor_version,
    }))
}

fn decode_search_response(
    header: &DatagramHeader,
    payload: &[u8],
) -> Result<Command, DecodeError> {
    if payload.len() < 2 {
        return Err(DecodeError::Malformed(format!(
            "search response: need 2 payload bytes, got {}",
            payload.len()
        )));
    }
    Ok(Command::SearchResponse(SearchResponse {
        correlation_id: header.parameter2,
        server_port: header.data_type,
        server_address: ServerAddress::from_wire(header.parameter1),
        server_minor_version: u16::from_be_bytes([payload[0], payload[1]]),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
