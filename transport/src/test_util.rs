use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use crate::packet_header::PacketHeader;
use crate::send_pipeline::SendSocket;
use crate::udp_socket::ReceiveSocket;

/// A socket that records everything that is sent through it, and passes the datagrams on to
///  a channel (tagged with its own address as the sender) - optionally dropping every n-th
///  datagram on the way. Two of these back to back form an in-memory link between endpoints.
pub struct RecordingSocket {
    self_addr: SocketAddr,
    drop_every: Option<usize>,
    sent: Mutex<Vec<(Instant, SocketAddr, Vec<u8>)>>,
    delivered: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl RecordingSocket {
    pub fn new() -> (Arc<RecordingSocket>, mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
        Self::lossy(SocketAddr::from(([127,0,0,1], 1)), None)
    }

    pub fn lossy(self_addr: SocketAddr, drop_every: Option<usize>) -> (Arc<RecordingSocket>, mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
        let (delivered, receiver) = mpsc::unbounded_channel();
        let socket = RecordingSocket {
            self_addr,
            drop_every,
            sent: Default::default(),
            delivered,
        };
        (Arc::new(socket), receiver)
    }

    /// all send attempts including dropped datagrams, in order
    pub fn sent(&self) -> Vec<(Instant, SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().iter()
            .map(|(_, _, d)| d.clone())
            .collect()
    }

    pub fn headers(&self) -> Vec<PacketHeader> {
        self.datagrams().iter()
            .map(|d| PacketHeader::deser(&mut d.as_slice()).unwrap())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SendSocket for RecordingSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<()> {
        let num_sent = {
            let mut sent = self.sent.lock().unwrap();
            sent.push((Instant::now(), to, packet_buf.to_vec()));
            sent.len()
        };

        if let Some(n) = self.drop_every {
            if num_sent % n == 0 {
                return Ok(());
            }
        }

        // the receiving side may be gone in tests that only look at what was sent
        let _ = self.delivered.send((self.self_addr, packet_buf.to_vec()));
        Ok(())
    }
}

type ReceiveResult = io::Result<(SocketAddr, Vec<u8>)>;

/// A receive socket that returns whatever a test pushes into its channel, in order. When
///  nothing is queued, receiving waits indefinitely like a socket without traffic.
pub struct ScriptedReceiveSocket {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReceiveResult>>,
}

impl ScriptedReceiveSocket {
    pub fn new() -> (Arc<ScriptedReceiveSocket>, mpsc::UnboundedSender<ReceiveResult>) {
        let (sender, incoming) = mpsc::unbounded_channel();
        let socket = ScriptedReceiveSocket {
            incoming: tokio::sync::Mutex::new(incoming),
        };
        (Arc::new(socket), sender)
    }
}

#[async_trait]
impl ReceiveSocket for ScriptedReceiveSocket {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let next = self.incoming.lock().await.recv().await;
        match next {
            Some(Ok((from, datagram))) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok((datagram.len(), from))
            }
            Some(Err(e)) => Err(e),
            None => std::future::pending().await,
        }
    }
}
