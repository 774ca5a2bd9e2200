//! The repeater's UDP service loop.
//!
//! Owns the discovery socket (and optionally a separate upstream beacon
//! socket) and carries out what [`RepeaterRegistry`] decides:
//!
//! 1. A datagram from an unknown local port starts a relay-path handshake on
//!    a spawned task, bounded by the configured timeout.
//! 2. When the handshake finishes, its result re-enters the loop; the new
//!    client is confirmed and every other client gets one empty datagram.
//! 3. A datagram from a ready client is relayed verbatim to the others.
//! 4. A datagram on the upstream socket is relayed to every client.
//!
//! The registry is only mutated from this loop or from
//! [`RepeaterService::relay_upstream`], each time under a short lock that is
//! never held across an `.await`.
//!
//! # Why a repeater? (for beginners)
//!
//! CA servers announce themselves with UDP beacons broadcast to port 5065.
//! Only one socket per host can reliably receive a broadcast on a given
//! port, yet every CA client on the host wants to see the beacons (a beacon
//! from a restarted server is the cue to reconnect).  The repeater owns port
//! 5065 on behalf of all of them: each client registers from its own
//! ephemeral port, and the repeater copies every beacon to each registered
//! client over loopback.
//!
//! # Singleton
//!
//! Binding the discovery port is the only thing that keeps two repeaters off
//! one host.  [`bind`] reports the failure; the binary treats it as "already
//! running" and exits quietly.

use std::future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ca_core::{InboundAction, RelayTarget, RepeaterRegistry, RepeaterStats};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::relay_path::RelayPath;
use crate::infrastructure::storage::config::RepeaterConfig;

/// Largest datagram the repeater will read.
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Error type for repeater network operations.
#[derive(Debug, Error)]
pub enum RepeaterError {
    /// A socket could not be bound (or a relay socket could not be connected).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A datagram could not be delivered to a client.
    #[error("failed to send to {addr}: {source}")]
    SendFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Opening a relay path took longer than the handshake timeout.
    #[error("relay path to {peer} not ready within {timeout:?}")]
    HandshakeTimeout { peer: SocketAddr, timeout: Duration },
}

/// Binds a UDP socket on `addr`.
///
/// # Errors
///
/// Returns [`RepeaterError::Bind`] if the address is in use or unavailable.
pub async fn bind(addr: SocketAddr) -> Result<UdpSocket, RepeaterError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| RepeaterError::Bind { addr, source })
}

/// Relays server beacons to every locally registered client.
#[derive(Debug)]
pub struct RepeaterService {
    registry: Mutex<RepeaterRegistry<RelayPath>>,
    upstream: Option<UdpSocket>,
    handshake_timeout: Duration,
    span: Span,
}

impl RepeaterService {
    /// Creates a service with settings from `config` and no upstream socket.
    pub fn new(config: &RepeaterConfig) -> Self {
        let span = tracing::info_span!("ca_repeater", port = config.repeater.port);
        Self {
            registry: Mutex::new(
                RepeaterRegistry::new(Ipv4Addr::LOCALHOST)
                    .with_span(tracing::info_span!(parent: &span, "registry")),
            ),
            upstream: None,
            handshake_timeout: config.relay_handshake_timeout(),
            span,
        }
    }

    /// Replaces the span the service and its registry log under.
    pub fn with_span(mut self, span: Span) -> Self {
        let registry_span = tracing::info_span!(parent: &span, "registry");
        let registry = self
            .registry
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .with_span(registry_span);
        self.registry = Mutex::new(registry);
        self.span = span;
        self
    }

    /// Adds a socket whose datagrams are server beacons, relayed to every client.
    pub fn with_upstream(mut self, socket: UdpSocket) -> Self {
        self.upstream = Some(socket);
        self
    }

    /// Serves `socket` until `cancel` fires.
    ///
    /// Nothing a client does ends the loop: receive errors are logged and the
    /// loop carries on.
    pub async fn run(&self, socket: UdpSocket, cancel: CancellationToken) {
        self.serve(socket, cancel).instrument(self.span.clone()).await
    }

    /// Relays a datagram from the upstream beacon source to every confirmed
    /// client.  Clients whose send fails are deregistered.
    pub async fn relay_upstream(&self, bytes: &[u8]) {
        let targets = self.lock_registry().on_upstream(bytes);
        debug!("relaying {} upstream bytes to {} clients", bytes.len(), targets.len());
        self.send_all(&targets, bytes).await;
    }

    /// Addresses of every confirmed client.
    pub fn registered_peers(&self) -> Vec<SocketAddr> {
        self.lock_registry().confirmed_peers()
    }

    pub fn stats(&self) -> RepeaterStats {
        self.lock_registry().stats()
    }

    // ── Service loop ──────────────────────────────────────────────────────────

    async fn serve(&self, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut upstream_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut handshakes: JoinSet<(SocketAddr, Result<RelayPath, RepeaterError>)> =
            JoinSet::new();

        match socket.local_addr() {
            Ok(addr) => info!("repeater listening on UDP {addr}"),
            Err(e) => warn!("repeater listening on unknown address: {e}"),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, source)) => self.on_discovery(source, &buf[..len], &mut handshakes).await,
                    // ICMP errors from earlier sends surface here on some platforms.
                    Err(e) => debug!("discovery recv error: {e}"),
                },

                received = recv_optional(self.upstream.as_ref(), &mut upstream_buf) => match received {
                    Ok((len, source)) => {
                        debug!("upstream datagram of {len} bytes from {source}");
                        self.relay_upstream(&upstream_buf[..len]).await;
                    }
                    Err(e) => debug!("upstream recv error: {e}"),
                },

                Some(joined) = handshakes.join_next(), if !handshakes.is_empty() => match joined {
                    Ok((peer, result)) => self.on_handshake(peer, result).await,
                    Err(e) => warn!("relay handshake task failed: {e}"),
                },
            }
        }

        handshakes.abort_all();
        info!("repeater stopped");
    }

    async fn on_discovery(
        &self,
        source: SocketAddr,
        bytes: &[u8],
        handshakes: &mut JoinSet<(SocketAddr, Result<RelayPath, RepeaterError>)>,
    ) {
        let action = self.lock_registry().on_datagram(source, bytes);
        match action {
            InboundAction::Discard(_) | InboundAction::NotReady { .. } => {}
            InboundAction::OpenRelay { peer } => {
                let timeout = self.handshake_timeout;
                handshakes.spawn(async move {
                    let result = match tokio::time::timeout(timeout, RelayPath::open(peer)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(RepeaterError::HandshakeTimeout { peer, timeout }),
                    };
                    (peer, result)
                });
            }
            InboundAction::Forward(targets) => self.send_all(&targets, bytes).await,
        }
    }

    async fn on_handshake(&self, peer: SocketAddr, result: Result<RelayPath, RepeaterError>) {
        let relay = match result {
            Ok(relay) => relay,
            Err(e) => {
                warn!("{e}");
                self.lock_registry().relay_failed(peer);
                return;
            }
        };

        let confirmation = self.lock_registry().relay_ready(peer, relay);
        let Some(confirmation) = confirmation else {
            return;
        };

        if let Err(e) = confirmation.target.relay.send(&confirmation.confirm).await {
            warn!("{e}");
            self.lock_registry().send_failed(peer);
            return;
        }
        self.send_all(&confirmation.notify, &[]).await;
    }

    async fn send_all(&self, targets: &[RelayTarget<RelayPath>], bytes: &[u8]) {
        for target in targets {
            if let Err(e) = target.relay.send(bytes).await {
                warn!("{e}");
                self.lock_registry().send_failed(target.peer);
            }
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, RepeaterRegistry<RelayPath>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Receives from `socket`, or never resolves when there is none.
async fn recv_optional(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bind_conflict_is_reported_as_bind_error() {
        // Arrange
        let first = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = first.local_addr().unwrap();

        // Act
        let second = bind(addr).await;

        // Assert
        assert!(matches!(second, Err(RepeaterError::Bind { addr: a, .. }) if a == addr));
    }

    #[tokio::test]
    async fn test_run_returns_when_cancelled() {
        let service = Arc::new(RepeaterService::new(&RepeaterConfig::default()));
        let socket = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let cancel = CancellationToken::new();

        let task = {
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(socket, cancel).await })
        };
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("run must stop after cancel")
            .expect("task must not panic");
        assert!(service.registered_peers().is_empty());
    }

    #[tokio::test]
    async fn test_relay_upstream_with_no_clients_sends_nothing() {
        let service = RepeaterService::new(&RepeaterConfig::default());
        service.relay_upstream(b"beacon").await;
        assert_eq!(service.stats().deregistered, 0);
    }
}
