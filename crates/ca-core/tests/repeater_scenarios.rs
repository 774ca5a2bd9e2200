//! Registry-level repeater scenarios, run without sockets.
//!
//! The relay handle is the peer's port, so the tests can see exactly which
//! peer each datagram would be sent to.

use std::net::{Ipv4Addr, SocketAddr};

use ca_core::{
    decode, encode,
    protocol::{Beacon, RepeaterConfirmResponse},
    Command, InboundAction, RepeaterRegistry,
};

fn local(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

fn beacon(id: u32) -> Vec<u8> {
    encode(&Command::Beacon(Beacon {
        server_minor_version: 13,
        server_port: 5064,
        beacon_id: id,
        server_address: Ipv4Addr::new(10, 0, 0, 5),
    }))
}

#[test]
fn test_first_client_gets_confirmation_and_nothing_else() {
    // Arrange
    let mut registry = RepeaterRegistry::<u16>::new(Ipv4Addr::LOCALHOST);

    // Act
    let action = registry.on_datagram(local(49500), &[]);
    let confirmation = registry
        .relay_ready(local(49500), 49500)
        .expect("new peer must be confirmed");

    // Assert
    assert_eq!(action, InboundAction::OpenRelay { peer: local(49500) });
    assert_eq!(confirmation.target.relay, 49500);
    assert_eq!(
        decode(&confirmation.confirm),
        Ok(Command::RepeaterConfirmResponse(RepeaterConfirmResponse {
            repeater_address: Ipv4Addr::LOCALHOST,
        }))
    );
    assert!(confirmation.notify.is_empty(), "no other peer to notify");
}

#[test]
fn test_beacon_after_two_registrations_reaches_both() {
    // Arrange
    let mut registry = RepeaterRegistry::<u16>::new(Ipv4Addr::LOCALHOST);
    for port in [49500, 49501] {
        registry.on_datagram(local(port), &[]);
        registry.relay_ready(local(port), port);
    }

    // Act
    let mut relays: Vec<u16> = registry
        .on_upstream(&beacon(1))
        .into_iter()
        .map(|target| target.relay)
        .collect();
    relays.sort_unstable();

    // Assert
    assert_eq!(relays, vec![49500, 49501]);
}

#[test]
fn test_every_distinct_port_is_confirmed_exactly_once() {
    // Arrange
    let mut registry = RepeaterRegistry::<u16>::new(Ipv4Addr::LOCALHOST);
    let ports: Vec<u16> = (40000..40025).collect();

    // Act
    let mut confirmations = 0;
    for &port in &ports {
        registry.on_datagram(local(port), &[]);
        if registry.relay_ready(local(port), port).is_some() {
            confirmations += 1;
        }
        // A repeat registration from the same port is relayed, not re-confirmed.
        registry.on_datagram(local(port), &[]);
        assert!(registry.relay_ready(local(port), port).is_none());
    }

    // Assert
    assert_eq!(confirmations, ports.len());
    assert_eq!(registry.confirmed_peers().len(), ports.len());
    assert_eq!(registry.stats().registrations, ports.len() as u64);
}

#[test]
fn test_client_datagram_never_returns_to_its_source() {
    let mut registry = RepeaterRegistry::<u16>::new(Ipv4Addr::LOCALHOST);
    for port in [49500, 49501, 49502] {
        registry.on_datagram(local(port), &[]);
        registry.relay_ready(local(port), port);
    }

    match registry.on_datagram(local(49501), &beacon(2)) {
        InboundAction::Forward(targets) => {
            assert_eq!(targets.len(), 2);
            assert!(targets.iter().all(|t| t.peer != local(49501)));
        }
        other => panic!("expected Forward, got {other:?}"),
    }
}
