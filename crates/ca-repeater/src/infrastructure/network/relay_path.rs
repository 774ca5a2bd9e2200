//! Dedicated per-client relay sockets.
//!
//! Each registered client gets its own loopback socket connected to the
//! client's address.  Because the socket is connected, the kernel reports a
//! client that has gone away (ICMP port unreachable) as an error on the next
//! send, which is how the repeater notices dead registrations.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use super::repeater_service::RepeaterError;

/// A connected UDP socket that delivers datagrams to one client.
///
/// Cheap to clone; clones share the socket.
#[derive(Debug, Clone)]
pub struct RelayPath {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl RelayPath {
    /// Binds an ephemeral loopback socket and connects it to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`RepeaterError::Bind`] if the socket cannot be bound or
    /// connected.
    pub async fn open(peer: SocketAddr) -> Result<Self, RepeaterError> {
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| RepeaterError::Bind { addr: local, source })?;
        socket
            .connect(peer)
            .await
            .map_err(|source| RepeaterError::Bind { addr: peer, source })?;
        Ok(Self {
            socket: Arc::new(socket),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one datagram to the client.  An empty slice sends a 0-byte datagram.
    ///
    /// # Errors
    ///
    /// Returns [`RepeaterError::SendFailed`] if the send fails or is short.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), RepeaterError> {
        match self.socket.send(bytes).await {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => Err(RepeaterError::SendFailed {
                addr: self.peer,
                source: std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short send: {n} of {} bytes", bytes.len()),
                ),
            }),
            Err(source) => Err(RepeaterError::SendFailed {
                addr: self.peer,
                source,
            }),
        }
    }
}
