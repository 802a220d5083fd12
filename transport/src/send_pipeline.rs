use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use tracing::debug;
use crate::config::RudpConfig;
use crate::error::{TransportError, TransportResult};
use crate::rate_limiter::{SendQueue, TokenBucket};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<()>;
}


/// All outgoing datagrams go through here. Fragments are paced by a token bucket if rate
///  limiting is configured, acks always go to the socket directly.
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    send_queue: Option<SendQueue>,
    closed: AtomicBool,
}

impl SendPipeline {
    /// NB: With rate limiting enabled, this spawns the send queue's background tasks, so it
    ///  must be called in the context of a tokio runtime
    pub fn new(socket: Arc<dyn SendSocket>, config: &RudpConfig) -> SendPipeline {
        let send_queue = if config.enable_send_rate_limit {
            debug!("rate limiting sends to {} bytes/s with a burst capacity of {} bytes", config.send_bucket_refill_rate_per_sec, config.send_bucket_byte_size);
            let bucket = Arc::new(TokenBucket::new(config.send_bucket_byte_size, config.refill_tokens_per_tick()));
            Some(SendQueue::new(socket.clone(), bucket, config.refill_interval, config.send_queue_poll_interval))
        }
        else {
            None
        };

        SendPipeline {
            socket,
            send_queue,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends a datagram, waiting for the rate limiter if there is one. Returns when the datagram
    ///  was handed to the socket.
    pub async fn send_packet(&self, to: SocketAddr, datagram: Bytes) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        match &self.send_queue {
            Some(queue) => queue.send(to, datagram).await,
            None => Ok(self.socket.do_send_packet(to, &datagram).await?),
        }
    }

    /// Sends a datagram bypassing the rate limiter
    pub async fn send_unlimited(&self, to: SocketAddr, datagram: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.socket.do_send_packet(to, datagram).await?)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(queue) = &self.send_queue {
            queue.close();
        }
    }
}
