use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use crate::error::{TransportError, TransportResult};
use crate::send_pipeline::SendSocket;

/// The receiving side of the socket abstraction, introduced to allow driving the receive loop
///  from tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiveSocket: Send + Sync + 'static {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// The endpoint's bound UDP socket. It can be released explicitly, closing the underlying file
///  descriptor even while other parts of the endpoint still hold a reference to this wrapper.
///
/// Sends hold a read lock for the duration of the write, so [SharedUdpSocket::release] waits
///  for them to finish. A pending receive only holds a clone of the socket, and it is the
///  caller's responsibility to stop receiving before releasing.
pub struct SharedUdpSocket {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
}

impl SharedUdpSocket {
    /// Binds to all IPv4 interfaces; port 0 picks an ephemeral port
    pub async fn bind(port: u16) -> TransportResult<SharedUdpSocket> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
            .map_err(|source| TransportError::Bind { port, source })?;
        let local_addr = socket.local_addr()
            .map_err(|source| TransportError::Bind { port, source })?;

        Ok(SharedUdpSocket {
            socket: RwLock::new(Some(Arc::new(socket))),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for sends in progress, then closes the socket
    pub async fn release(&self) {
        if self.socket.write().await.take().is_some() {
            debug!("released UDP socket {:?}", self.local_addr);
        }
    }

    /// Closes the socket if no send is in progress, for contexts that can not wait
    pub fn try_release(&self) -> bool {
        match self.socket.try_write() {
            Ok(mut socket) => {
                socket.take();
                true
            }
            Err(_) => false,
        }
    }

    fn released() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "UDP socket was released")
    }
}

#[async_trait]
impl SendSocket for SharedUdpSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<()> {
        let socket = self.socket.read().await;
        let socket = socket.as_ref().ok_or_else(Self::released)?;

        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);
        socket.send_to(packet_buf, to).await?;
        Ok(())
    }
}

#[async_trait]
impl ReceiveSocket for SharedUdpSocket {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let socket = self.socket.read().await
            .clone()
            .ok_or_else(Self::released)?;
        socket.recv_from(buf).await
    }
}
