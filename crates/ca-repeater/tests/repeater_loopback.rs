//! End-to-end repeater tests over real loopback sockets.
//!
//! Each test starts its own service on an ephemeral port, so tests can run in
//! parallel without fighting over 5065.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ca_core::{decode, encode, protocol::Beacon, Command};
use ca_repeater::{bind, RepeaterConfig, RepeaterService};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const RECV_WAIT: Duration = Duration::from_secs(2);
const QUIET_WAIT: Duration = Duration::from_millis(200);

struct Harness {
    service: Arc<RepeaterService>,
    discovery: SocketAddr,
    upstream: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_repeater() -> Harness {
    let socket = assert_ok!(bind("127.0.0.1:0".parse().unwrap()).await);
    let upstream_socket = assert_ok!(bind("127.0.0.1:0".parse().unwrap()).await);
    let discovery = socket.local_addr().unwrap();
    let upstream = upstream_socket.local_addr().unwrap();

    let service =
        Arc::new(RepeaterService::new(&RepeaterConfig::default()).with_upstream(upstream_socket));
    let cancel = CancellationToken::new();
    {
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run(socket, cancel).await });
    }

    Harness {
        service,
        discovery,
        upstream,
        cancel,
    }
}

async fn client() -> UdpSocket {
    assert_ok!(UdpSocket::bind("127.0.0.1:0").await)
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 1024];
    let (n, _) = assert_ok!(
        timeout(RECV_WAIT, socket.recv_from(&mut buf))
            .await
            .expect("datagram expected before timeout")
    );
    buf.truncate(n);
    buf
}

async fn assert_quiet(socket: &UdpSocket) {
    let mut buf = vec![0u8; 1024];
    assert_err!(timeout(QUIET_WAIT, socket.recv_from(&mut buf)).await);
}

async fn register(harness: &Harness, socket: &UdpSocket) {
    assert_ok!(socket.send_to(&[], harness.discovery).await);
    let confirm = recv(socket).await;
    assert!(matches!(decode(&confirm), Ok(Command::RepeaterConfirmResponse(_))));
}

fn beacon_bytes() -> Vec<u8> {
    encode(&Command::Beacon(Beacon {
        server_minor_version: 13,
        server_port: 5064,
        beacon_id: 99,
        server_address: "10.0.0.5".parse().unwrap(),
    }))
}

#[tokio::test]
async fn test_single_client_receives_only_a_confirmation() {
    // Arrange
    let harness = start_repeater().await;
    let a = client().await;

    // Act
    assert_ok!(a.send_to(&[], harness.discovery).await);

    // Assert
    let confirm = recv(&a).await;
    assert!(matches!(
        decode(&confirm),
        Ok(Command::RepeaterConfirmResponse(c)) if c.repeater_address.is_loopback()
    ));
    assert_quiet(&a).await;
    assert_eq!(harness.service.registered_peers(), vec![a.local_addr().unwrap()]);
}

#[tokio::test]
async fn test_second_registration_pings_first_with_empty_datagram() {
    // Arrange
    let harness = start_repeater().await;
    let a = client().await;
    let b = client().await;
    register(&harness, &a).await;

    // Act
    register(&harness, &b).await;

    // Assert
    assert!(recv(&a).await.is_empty(), "existing client gets an empty datagram");
    assert_quiet(&b).await;
}

#[tokio::test]
async fn test_upstream_beacon_reaches_every_client_unmodified() {
    // Arrange
    let harness = start_repeater().await;
    let a = client().await;
    let b = client().await;
    register(&harness, &a).await;
    register(&harness, &b).await;
    recv(&a).await; // empty notification for b's registration
    let server = client().await;
    let beacon = beacon_bytes();

    // Act
    assert_ok!(server.send_to(&beacon, harness.upstream).await);

    // Assert
    assert_eq!(recv(&a).await, beacon);
    assert_eq!(recv(&b).await, beacon);
}

#[tokio::test]
async fn test_client_datagram_is_relayed_to_others_not_back() {
    let harness = start_repeater().await;
    let a = client().await;
    let b = client().await;
    register(&harness, &a).await;
    register(&harness, &b).await;
    recv(&a).await;
    let beacon = beacon_bytes();

    assert_ok!(a.send_to(&beacon, harness.discovery).await);

    assert_eq!(recv(&b).await, beacon);
    assert_quiet(&a).await;
}

#[tokio::test]
async fn test_repeat_registration_is_not_confirmed_twice() {
    let harness = start_repeater().await;
    let a = client().await;
    register(&harness, &a).await;

    assert_ok!(a.send_to(&[], harness.discovery).await);

    assert_quiet(&a).await;
    assert_eq!(harness.service.stats().registrations, 1);
}

#[tokio::test]
async fn test_every_client_is_confirmed_exactly_once() {
    // Arrange
    let harness = start_repeater().await;
    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(client().await);
    }

    // Act
    for c in &clients {
        register(&harness, c).await;
    }

    // Assert
    let mut peers = harness.service.registered_peers();
    peers.sort();
    let mut expected: Vec<SocketAddr> = clients.iter().map(|c| c.local_addr().unwrap()).collect();
    expected.sort();
    assert_eq!(peers, expected);
    assert_eq!(harness.service.stats().registrations, 5);
}

#[tokio::test]
async fn test_departed_client_is_dropped_and_can_register_again() {
    // Arrange
    let harness = start_repeater().await;
    let a = client().await;
    register(&harness, &a).await;
    let port = a.local_addr().unwrap();
    drop(a);
    let beacon = beacon_bytes();

    // Act: the port-unreachable reply to one send fails a later one.
    for _ in 0..50 {
        harness.service.relay_upstream(&beacon).await;
        if harness.service.stats().deregistered == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Assert
    assert_eq!(harness.service.stats().deregistered, 1);
    assert!(harness.service.registered_peers().is_empty());

    let again = assert_ok!(UdpSocket::bind(port).await);
    register(&harness, &again).await;
    assert_eq!(harness.service.registered_peers(), vec![port]);
    assert_eq!(harness.service.stats().registrations, 2);
}
