//! Client-side broadcaster session: repeater registration and search
//! correlation, with no I/O.
//!
//! The session is fed decoded commands and returns [`SessionEvent`]s; it hands
//! back the commands to send but never sends them.  One session per
//! participant; sessions share nothing.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;
use tracing::{debug, info, trace, Span};

use crate::protocol::{
    encode_datagram, ChannelName, Command, CorrelationId, CorrelationIdAllocator, InvalidName,
    RegisterRepeaterRequest, SearchRequest, VersionCommand,
};

/// Errors surfaced synchronously by session operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A search was attempted before the repeater confirmed registration.
    #[error("not registered with the repeater")]
    NotRegistered,

    /// The name cannot be carried by a search request.
    #[error("invalid search name: {0}")]
    InvalidName(#[from] InvalidName),
}

/// Registration progress.  Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistrationState {
    Unregistered,
    AwaitingConfirmation,
    Confirmed,
}

/// Outcome of feeding one inbound command to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The repeater confirmed our registration.
    Registered { repeater_address: Ipv4Addr },
    /// A response matched an outstanding search; the search is released.
    SearchMatched {
        correlation_id: CorrelationId,
        name: String,
        address: SocketAddr,
    },
    /// A response whose id matches nothing outstanding.  Expected under UDP.
    UnsolicitedResponse { correlation_id: CorrelationId },
    /// A server beacon relayed by the repeater.
    Beacon { server: SocketAddr, beacon_id: u32 },
    /// Nothing relevant to the current state.
    Ignored,
}

/// Per-participant registration and search-correlation state.
#[derive(Debug)]
pub struct BroadcasterSession {
    state: RegistrationState,
    client_address: Ipv4Addr,
    listening_port: u16,
    ids: CorrelationIdAllocator,
    outstanding: HashMap<CorrelationId, String>,
    span: Span,
}

impl BroadcasterSession {
    /// Creates an unregistered session for a client listening on
    /// `client_address:listening_port`.
    pub fn new(client_address: Ipv4Addr, listening_port: u16) -> Self {
        Self {
            state: RegistrationState::Unregistered,
            client_address,
            listening_port,
            ids: CorrelationIdAllocator::new(),
            outstanding: HashMap::new(),
            span: tracing::debug_span!("broadcaster_session", port = listening_port),
        }
    }

    /// Replaces the span every session event is logged under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Confirmed
    }

    /// Returns the registration request to send to the repeater.
    ///
    /// Calling this again while awaiting confirmation re-emits the same
    /// request without tracking a second one.  Returns `None` once confirmed.
    pub fn begin_registration(&mut self) -> Option<Command> {
        let _entered = self.span.enter();
        match self.state {
            RegistrationState::Confirmed => None,
            RegistrationState::Unregistered | RegistrationState::AwaitingConfirmation => {
                if self.state == RegistrationState::Unregistered {
                    debug!("registering with repeater");
                }
                self.state = RegistrationState::AwaitingConfirmation;
                Some(Command::RegisterRepeaterRequest(RegisterRepeaterRequest {
                    client_address: self.client_address,
                    listening_port: self.listening_port,
                }))
            }
        }
    }

    /// Feeds one inbound command, received from `sender`, to the session.
    pub fn on_receive(&mut self, command: &Command, sender: SocketAddr) -> SessionEvent {
        let span = self.span.clone();
        let _entered = span.enter();

        match command {
            Command::RepeaterConfirmResponse(confirm)
                if self.state == RegistrationState::AwaitingConfirmation =>
            {
                self.state = RegistrationState::Confirmed;
                info!("repeater registration confirmed by {sender}");
                SessionEvent::Registered {
                    repeater_address: confirm.repeater_address,
                }
            }
            Command::SearchResponse(response) => {
                match self.outstanding.remove(&response.correlation_id) {
                    Some(name) => {
                        let ip = match response.server_address.ip() {
                            Some(ip) if !ip.is_unspecified() => IpAddr::V4(ip),
                            _ => sender.ip(),
                        };
                        let address = SocketAddr::new(ip, response.server_port);
                        debug!("search {} for {name:?} answered by {address}", response.correlation_id);
                        SessionEvent::SearchMatched {
                            correlation_id: response.correlation_id,
                            name,
                            address,
                        }
                    }
                    None => {
                        trace!("unsolicited search response {} from {sender}", response.correlation_id);
                        SessionEvent::UnsolicitedResponse {
                            correlation_id: response.correlation_id,
                        }
                    }
                }
            }
            Command::Beacon(beacon) => {
                let ip = if beacon.server_address.is_unspecified() {
                    sender.ip()
                } else {
                    IpAddr::V4(beacon.server_address)
                };
                SessionEvent::Beacon {
                    server: SocketAddr::new(ip, beacon.server_port),
                    beacon_id: beacon.beacon_id,
                }
            }
            other => {
                trace!("ignoring {:?} from {sender} in state {:?}", other.command_id(), self.state);
                SessionEvent::Ignored
            }
        }
    }

    /// Allocates a correlation id for `name` and returns the search request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotRegistered`] unless registration is
    /// confirmed, and [`ProtocolError::InvalidName`] for a name containing a
    /// NUL or too long for one datagram.
    pub fn new_search(&mut self, name: &str) -> Result<(CorrelationId, Command), ProtocolError> {
        if self.state != RegistrationState::Confirmed {
            return Err(ProtocolError::NotRegistered);
        }
        let channel = ChannelName::new(name)?;
        let mut id = self.ids.next();
        while self.outstanding.contains_key(&id) {
            id = self.ids.next();
        }
        self.outstanding.insert(id, name.to_string());
        Ok((id, Command::SearchRequest(SearchRequest::new(channel, id))))
    }

    /// Releases an outstanding search.  Returns `false` if it was not outstanding.
    pub fn cancel_search(&mut self, id: CorrelationId) -> bool {
        self.outstanding.remove(&id).is_some()
    }

    /// Whether `id` belongs to a search still awaiting a response.
    pub fn is_outstanding(&self, id: CorrelationId) -> bool {
        self.outstanding.contains_key(&id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Wraps a search request in the version preamble servers expect.
    pub fn search_datagram(search: &Command) -> Vec<u8> {
        encode_datagram(&[Command::Version(VersionCommand::default()), search.clone()])
    }
}
