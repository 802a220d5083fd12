use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, trace};
use crate::error::{TransportError, TransportResult};
use crate::send_pipeline::SendSocket;

/// A byte-granular token bucket. It starts full, and a fixed number of tokens is added per
///  refill tick, capped at the bucket's capacity.
pub struct TokenBucket {
    capacity: u64,
    refill_per_tick: u64,
    tokens: Mutex<u64>,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_per_tick: u64) -> TokenBucket {
        TokenBucket {
            capacity,
            refill_per_tick,
            tokens: Mutex::new(capacity),
        }
    }

    /// Takes `n` tokens if (and only if) that many are available
    pub fn try_consume(&self, n: u64) -> bool {
        let mut tokens = self.tokens.lock().unwrap();
        if *tokens >= n {
            *tokens -= n;
            true
        }
        else {
            false
        }
    }

    pub fn refill(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens + self.refill_per_tick).min(self.capacity);
    }

    #[cfg(test)]
    pub fn available(&self) -> u64 {
        *self.tokens.lock().unwrap()
    }

    async fn do_refill_loop(self: Arc<Self>, refill_interval: Duration) {
        let mut ticks = interval_at(Instant::now() + refill_interval, refill_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.refill();
        }
    }
}


struct SendJob {
    to: SocketAddr,
    datagram: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

/// FIFO queue of datagrams in front of the socket. A single worker task takes jobs in
///  order, waits until the token bucket has room for the job's datagram, and writes it.
pub struct SendQueue {
    jobs: mpsc::UnboundedSender<SendJob>,
    worker_handle: JoinHandle<()>,
    refill_handle: JoinHandle<()>,
}

impl SendQueue {
    pub fn new(socket: Arc<dyn SendSocket>, bucket: Arc<TokenBucket>, refill_interval: Duration, poll_interval: Duration) -> SendQueue {
        let (jobs, job_receiver) = mpsc::unbounded_channel();

        let refill_handle = tokio::spawn(bucket.clone().do_refill_loop(refill_interval));
        let worker_handle = tokio::spawn(Self::do_send_loop(socket, bucket, job_receiver, poll_interval));

        SendQueue {
            jobs,
            worker_handle,
            refill_handle,
        }
    }

    async fn do_send_loop(socket: Arc<dyn SendSocket>, bucket: Arc<TokenBucket>, mut job_receiver: mpsc::UnboundedReceiver<SendJob>, poll_interval: Duration) {
        while let Some(job) = job_receiver.recv().await {
            let len = job.datagram.len() as u64;
            while !bucket.try_consume(len) {
                sleep(poll_interval).await;
            }

            trace!("send queue: writing {} bytes to {:?}", len, job.to);
            let result = socket.do_send_packet(job.to, &job.datagram).await;
            if job.done.send(result).is_err() {
                trace!("sender is gone - dropping send result");
            }
        }
        debug!("send queue closed");
    }

    /// Appends a datagram to the queue, returning a receiver for the result of writing it
    pub fn enqueue(&self, to: SocketAddr, datagram: Bytes) -> TransportResult<oneshot::Receiver<io::Result<()>>> {
        let (done, result) = oneshot::channel();
        self.jobs.send(SendJob { to, datagram, done })
            .map_err(|_| TransportError::Closed)?;
        Ok(result)
    }

    pub async fn send(&self, to: SocketAddr, datagram: Bytes) -> TransportResult<()> {
        let result = self.enqueue(to, datagram)?;
        match result.await {
            Ok(io_result) => Ok(io_result?),
            Err(_) => Err(TransportError::Closed),
        }
    }

    /// Stops the worker. Jobs that are still queued are dropped, and their senders see
    ///  [TransportError::Closed].
    pub fn close(&self) {
        self.worker_handle.abort();
        self.refill_handle.abort();
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        self.close();
    }
}
