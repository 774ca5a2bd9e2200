//! Datagram transport used by the discovery context.
//!
//! The context only needs three things from the network: send a datagram,
//! wait for the next one, and say which local address it is bound to.  The
//! [`DatagramTransport`] trait captures exactly that so the context can be
//! tested without sockets; [`UdpTransport`] is the real implementation.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;

/// Largest datagram the transport will read.
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The UDP socket could not be bound or configured.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A datagram could not be sent.
    #[error("failed to send to {addr}: {source}")]
    SendFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Receiving failed.
    #[error("receive error: {0}")]
    Receive(#[source] io::Error),
}

/// Unreliable datagram I/O.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Sends `bytes` as one datagram to `target`.
    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<(), TransportError>;

    /// Waits for the next datagram.  This is the receive loop's only
    /// suspension point.
    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), TransportError>;

    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// [`DatagramTransport`] over a tokio UDP socket with broadcast enabled.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds `addr` and enables broadcast sends.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the socket cannot be bound or
    /// broadcast cannot be enabled.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        socket
            .set_broadcast(true)
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<(), TransportError> {
        self.socket
            .send_to(bytes, target)
            .await
            .map(|_| ())
            .map_err(|source| TransportError::SendFailed {
                addr: target,
                source,
            })
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(TransportError::Receive)?;
        buf.truncate(len);
        Ok((buf, from))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(TransportError::Receive)
    }
}
