//! Repeater peer registry and relay decisions.
//!
//! The registry is the repeater's in-memory table of every local process that
//! asked for beacons.  It performs no I/O: every inbound datagram is turned
//! into an [`InboundAction`] that the service layer carries out, and the
//! service reports back when a relay path opens or a send fails.
//!
//! # Registration lifecycle
//!
//! ```text
//! unknown ──(any datagram)──► Registering ──(relay path open)──► Ready
//!    ▲                             │                               │
//!    └──────(handshake failed)─────┘◄─────────(send failed)────────┘
//! ```
//!
//! `R` is the handle of a peer's relay path (a connected socket in the tokio
//! service, a plain marker in tests).  It is only reachable once the
//! registration is `Ready`, so nothing can be relayed down a path that is
//! still opening.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use tracing::{debug, info, warn, Span};

use crate::protocol::{
    decode_datagram, encode, Command, DecodeError, RepeaterConfirmResponse,
};

/// Relay-path lifecycle of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState<R> {
    /// The relay path is being opened; datagrams from this peer are dropped.
    Registering,
    /// The relay path is open and the peer has been confirmed.
    Ready(R),
}

/// One registered local process.
#[derive(Debug, Clone)]
pub struct ClientRegistration<R> {
    pub address: SocketAddr,
    pub confirmed: bool,
    relay: RelayState<R>,
}

impl<R> ClientRegistration<R> {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            confirmed: false,
            relay: RelayState::Registering,
        }
    }

    /// Whether the relay path is open.
    pub fn relay_ready(&self) -> bool {
        matches!(self.relay, RelayState::Ready(_))
    }

    /// The relay path handle, once ready.
    pub fn relay(&self) -> Option<&R> {
        match &self.relay {
            RelayState::Ready(relay) => Some(relay),
            RelayState::Registering => None,
        }
    }
}

/// A peer plus the relay path to send to it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget<R> {
    pub peer: SocketAddr,
    pub relay: R,
}

/// Why an inbound datagram was dropped without touching the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    Malformed(DecodeError),
    NotLoopback,
}

/// What the service must do with an inbound discovery-port datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction<R> {
    /// Drop the datagram.
    Discard(DiscardReason),
    /// `peer` is new: open a relay path to it, then call
    /// [`RepeaterRegistry::relay_ready`] or [`RepeaterRegistry::relay_failed`].
    OpenRelay { peer: SocketAddr },
    /// `peer` is known but its relay path is not open yet; drop the datagram.
    NotReady { peer: SocketAddr },
    /// Send the raw datagram, unmodified, to each target.
    Forward(Vec<RelayTarget<R>>),
}

/// What the service must send once a new peer's relay path is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation<R> {
    /// The newly confirmed peer and its relay path.
    pub target: RelayTarget<R>,
    /// Encoded `RepeaterConfirmResponse` for the new peer.
    pub confirm: Vec<u8>,
    /// Every other confirmed peer; each gets one empty datagram.
    pub notify: Vec<RelayTarget<R>>,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepeaterStats {
    pub registrations: u64,
    pub relayed: u64,
    pub discarded: u64,
    pub deregistered: u64,
}

/// The repeater's registry: source port → registration.
///
/// All mutation goes through `&mut self`, so the owner decides how writes are
/// serialized (a single task's turn, or a mutex under threads).
#[derive(Debug)]
pub struct RepeaterRegistry<R> {
    peers: HashMap<u16, ClientRegistration<R>>,
    repeater_address: Ipv4Addr,
    stats: RepeaterStats,
    span: Span,
}

impl<R: Clone> RepeaterRegistry<R> {
    /// Creates an empty registry that confirms registrations with `repeater_address`.
    pub fn new(repeater_address: Ipv4Addr) -> Self {
        Self {
            peers: HashMap::new(),
            repeater_address,
            stats: RepeaterStats::default(),
            span: tracing::info_span!("repeater_registry"),
        }
    }

    /// Replaces the span every registry event is logged under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Classifies a datagram received on the discovery port from `source`.
    pub fn on_datagram(&mut self, source: SocketAddr, bytes: &[u8]) -> InboundAction<R> {
        let span = self.span.clone();
        let _entered = span.enter();

        let commands = match decode_datagram(bytes) {
            Ok(commands) => commands,
            Err(e) => {
                debug!("discarding undecodable datagram from {source}: {e}");
                self.stats.discarded += 1;
                return InboundAction::Discard(DiscardReason::Malformed(e));
            }
        };

        if !source.ip().is_loopback() {
            debug!("discarding datagram from non-local {source}");
            self.stats.discarded += 1;
            return InboundAction::Discard(DiscardReason::NotLoopback);
        }

        match self.peers.get(&source.port()) {
            None => {
                if let Some(Command::RegisterRepeaterRequest(req)) = commands.first() {
                    if req.listening_port != 0 && req.listening_port != source.port() {
                        debug!(
                            "register request from {source} names port {}; registering source port",
                            req.listening_port
                        );
                    }
                }
                info!("new repeater client {source}; opening relay path");
                self.peers.insert(source.port(), ClientRegistration::new(source));
                InboundAction::OpenRelay { peer: source }
            }
            Some(registration) if !registration.relay_ready() => {
                debug!("client {source} is still registering; dropping datagram");
                self.stats.discarded += 1;
                InboundAction::NotReady { peer: source }
            }
            Some(_) => {
                let targets = self.confirmed_targets(Some(source.port()));
                self.stats.relayed += 1;
                debug!("relaying {} bytes from {source} to {} clients", bytes.len(), targets.len());
                InboundAction::Forward(targets)
            }
        }
    }

    /// Marks `peer`'s relay path as open and confirms the registration.
    ///
    /// Returns `None` if `peer` is no longer registering (for example it was
    /// removed while the path was opening).
    pub fn relay_ready(&mut self, peer: SocketAddr, relay: R) -> Option<Confirmation<R>> {
        let span = self.span.clone();
        let _entered = span.enter();

        let registration = self.peers.get_mut(&peer.port())?;
        if registration.address != peer || registration.relay_ready() {
            return None;
        }
        registration.relay = RelayState::Ready(relay.clone());
        registration.confirmed = true;
        self.stats.registrations += 1;

        let notify = self.confirmed_targets(Some(peer.port()));
        info!(
            "confirmed repeater client {peer}; notifying {} other clients",
            notify.len()
        );
        Some(Confirmation {
            target: RelayTarget { peer, relay },
            confirm: encode(&Command::RepeaterConfirmResponse(RepeaterConfirmResponse {
                repeater_address: self.repeater_address,
            })),
            notify,
        })
    }

    /// Drops a registration whose relay path could not be opened.
    pub fn relay_failed(&mut self, peer: SocketAddr) {
        let span = self.span.clone();
        let _entered = span.enter();

        if self.remove_if_matches(peer) {
            warn!("relay path to {peer} failed to open; registration dropped");
        }
    }

    /// Deregisters `peer` after a failed send on its relay path.
    ///
    /// Returns `true` if a registration was removed.  A later datagram from
    /// the same port registers it again.
    pub fn send_failed(&mut self, peer: SocketAddr) -> bool {
        let span = self.span.clone();
        let _entered = span.enter();

        let removed = self.remove_if_matches(peer);
        if removed {
            self.stats.deregistered += 1;
            warn!("send to {peer} failed; client deregistered");
        }
        removed
    }

    /// Targets for a datagram from the upstream beacon source: every
    /// confirmed registration.
    pub fn on_upstream(&mut self, bytes: &[u8]) -> Vec<RelayTarget<R>> {
        let targets = self.confirmed_targets(None);
        if !bytes.is_empty() {
            self.stats.relayed += 1;
        }
        targets
    }

    /// Number of registrations, confirmed or not.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Addresses of every confirmed registration.
    pub fn confirmed_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|r| r.confirmed)
            .map(|r| r.address)
            .collect()
    }

    /// Looks up the registration for a source port.
    pub fn get(&self, port: u16) -> Option<&ClientRegistration<R>> {
        self.peers.get(&port)
    }

    pub fn stats(&self) -> RepeaterStats {
        self.stats
    }

    fn confirmed_targets(&self, excluding_port: Option<u16>) -> Vec<RelayTarget<R>> {
        self.peers
            .iter()
            .filter(|(port, _)| Some(**port) != excluding_port)
            .filter(|(_, r)| r.confirmed)
            .filter_map(|(_, r)| {
                r.relay().map(|relay| RelayTarget {
                    peer: r.address,
                    relay: relay.clone(),
                })
            })
            .collect()
    }

    fn remove_if_matches(&mut self, peer: SocketAddr) -> bool {
        match self.peers.get(&peer.port()) {
            Some(r) if r.address == peer => {
                self.peers.remove(&peer.port());
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, Beacon, RegisterRepeaterRequest};

    /// Relay handle stand-in: remembers which peer it was opened for.
    type Relay = u16;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn registry() -> RepeaterRegistry<Relay> {
        RepeaterRegistry::new(Ipv4Addr::LOCALHOST)
    }

    fn register(reg: &mut RepeaterRegistry<Relay>, port: u16) -> Confirmation<Relay> {
        assert_eq!(
            reg.on_datagram(local(port), &[]),
            InboundAction::OpenRelay { peer: local(port) }
        );
        reg.relay_ready(local(port), port).expect("confirmation")
    }

    fn beacon_bytes() -> Vec<u8> {
        encode(&Command::Beacon(Beacon {
            server_minor_version: 13,
            server_port: 5064,
            beacon_id: 1,
            server_address: Ipv4Addr::new(10, 0, 0, 5),
        }))
    }

    #[test]
    fn test_empty_datagram_from_unknown_port_opens_relay() {
        // Arrange
        let mut reg = registry();

        // Act
        let action = reg.on_datagram(local(49500), &[]);

        // Assert
        assert_eq!(action, InboundAction::OpenRelay { peer: local(49500) });
        let registration = reg.get(49500).expect("registration created");
        assert!(!registration.confirmed);
        assert!(!registration.relay_ready());
    }

    #[test]
    fn test_structured_register_request_also_opens_relay() {
        let mut reg = registry();
        let bytes = encode(&Command::RegisterRepeaterRequest(RegisterRepeaterRequest {
            client_address: Ipv4Addr::LOCALHOST,
            listening_port: 49501,
        }));
        assert_eq!(
            reg.on_datagram(local(49501), &bytes),
            InboundAction::OpenRelay { peer: local(49501) }
        );
    }

    #[test]
    fn test_first_confirmation_notifies_nobody() {
        // Arrange
        let mut reg = registry();

        // Act
        let confirmation = register(&mut reg, 49500);

        // Assert
        assert_eq!(confirmation.target.peer, local(49500));
        assert!(confirmation.notify.is_empty());
        assert!(matches!(
            decode(&confirmation.confirm),
            Ok(Command::RepeaterConfirmResponse(c)) if c.repeater_address == Ipv4Addr::LOCALHOST
        ));
        assert_eq!(reg.confirmed_peers(), vec![local(49500)]);
    }

    #[test]
    fn test_second_confirmation_notifies_first_peer_only() {
        let mut reg = registry();
        register(&mut reg, 49500);

        let confirmation = register(&mut reg, 49501);

        assert_eq!(
            confirmation.notify,
            vec![RelayTarget {
                peer: local(49500),
                relay: 49500
            }]
        );
    }

    #[test]
    fn test_non_loopback_source_never_registers() {
        let mut reg = registry();
        let remote: SocketAddr = "192.168.1.50:49500".parse().unwrap();

        let action = reg.on_datagram(remote, &[]);

        assert_eq!(action, InboundAction::Discard(DiscardReason::NotLoopback));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_malformed_datagram_is_discarded_without_registering() {
        let mut reg = registry();
        let action = reg.on_datagram(local(49500), &[0xAB, 0xCD, 0xEF]);
        assert!(matches!(
            action,
            InboundAction::Discard(DiscardReason::Malformed(_))
        ));
        assert!(reg.is_empty());
        assert_eq!(reg.stats().discarded, 1);
    }

    #[test]
    fn test_datagram_while_registering_is_dropped() {
        let mut reg = registry();
        reg.on_datagram(local(49500), &[]);

        let action = reg.on_datagram(local(49500), &[]);

        assert_eq!(action, InboundAction::NotReady { peer: local(49500) });
        assert_eq!(reg.len(), 1, "no duplicate registration");
    }

    #[test]
    fn test_datagram_from_ready_peer_fans_out_to_others_only() {
        let mut reg = registry();
        register(&mut reg, 49500);
        register(&mut reg, 49501);

        let action = reg.on_datagram(local(49500), &beacon_bytes());

        assert_eq!(
            action,
            InboundAction::Forward(vec![RelayTarget {
                peer: local(49501),
                relay: 49501
            }])
        );
    }

    #[test]
    fn test_upstream_datagram_targets_every_confirmed_peer() {
        let mut reg = registry();
        register(&mut reg, 49500);
        register(&mut reg, 49501);
        reg.on_datagram(local(49502), &[]); // still registering

        let mut peers: Vec<_> = reg
            .on_upstream(&beacon_bytes())
            .into_iter()
            .map(|t| t.peer)
            .collect();
        peers.sort();

        assert_eq!(peers, vec![local(49500), local(49501)]);
    }

    #[test]
    fn test_send_failure_deregisters_and_later_datagram_reregisters() {
        let mut reg = registry();
        register(&mut reg, 49500);

        assert!(reg.send_failed(local(49500)));
        assert!(reg.is_empty());
        assert_eq!(reg.stats().deregistered, 1);

        assert_eq!(
            reg.on_datagram(local(49500), &[]),
            InboundAction::OpenRelay { peer: local(49500) }
        );
    }

    #[test]
    fn test_relay_failed_drops_pending_registration() {
        let mut reg = registry();
        reg.on_datagram(local(49500), &[]);

        reg.relay_failed(local(49500));

        assert!(reg.is_empty());
        assert!(reg.relay_ready(local(49500), 49500).is_none());
    }

    #[test]
    fn test_relay_ready_twice_confirms_once() {
        let mut reg = registry();
        register(&mut reg, 49500);
        assert!(reg.relay_ready(local(49500), 49500).is_none());
        assert_eq!(reg.stats().registrations, 1);
    }

    #[test]
    fn test_n_distinct_ports_end_with_n_confirmed() {
        let mut reg = registry();
        let mut confirms = 0;
        for port in 50000..50010 {
            let c = register(&mut reg, port);
            assert_eq!(c.target.peer.port(), port);
            confirms += 1;
        }
        assert_eq!(confirms, 10);
        assert_eq!(reg.confirmed_peers().len(), 10);
    }
}
