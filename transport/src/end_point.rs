use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;
use crate::buffer_pool::BufferPool;
use crate::config::RudpConfig;
use crate::duplicate_cache::DuplicateCache;
use crate::error::{TransportError, TransportResult};
use crate::fragment_assembler::FragmentAssembler;
use crate::handler_registry::{HandlerRegistration, HandlerRegistry, MessageHandler};
use crate::message_id::MessageId;
use crate::packet_header::PacketHeader;
use crate::reliable_sender::{ReliableSender, SendOutcome};
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::udp_socket::{ReceiveSocket, SharedUdpSocket};

/// Large enough for any UDP datagram
const RECEIVE_BUFFER_LEN: usize = 65_536;

/// EndPoint is the place where all parts of the protocol come together: It listens on a
///  UdpSocket, acknowledges and reassembles incoming fragments and dispatches completed messages
///  to registered handlers, and has an API for application code to send messages.
///
/// An EndPoint can be started and closed repeatedly; each start begins with fresh protocol
///  state. Handlers are registered on the EndPoint itself and survive restarts.
pub struct EndPoint {
    config: Arc<RudpConfig>,
    handlers: Arc<HandlerRegistry>,
    running: Mutex<Option<Running>>,
}

struct Running {
    active: Arc<ActiveEndPoint>,
    socket: Arc<SharedUdpSocket>,
    shutdown: watch::Sender<bool>,
    recv_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
}

impl EndPoint {
    pub fn new(config: RudpConfig) -> TransportResult<EndPoint> {
        config.validate()
            .map_err(TransportError::InvalidConfig)?;

        Ok(EndPoint {
            config: Arc::new(config),
            handlers: Arc::new(HandlerRegistry::new()),
            running: Mutex::new(None),
        })
    }

    /// Binds the UDP socket on all IPv4 interfaces (port 0 picks an ephemeral port) and
    ///  starts receiving
    pub async fn start(&self, port: u16) -> TransportResult<()> {
        if self.running.lock().unwrap().is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let socket = Arc::new(SharedUdpSocket::bind(port).await?);

        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            // a concurrent call to start() won the race
            return Err(TransportError::AlreadyStarted);
        }
        info!("bound UDP socket to {:?}", socket.local_addr());

        let active = Arc::new(ActiveEndPoint::new(self.config.clone(), socket.clone(), self.handlers.clone()));

        let (shutdown, shutdown_receiver) = watch::channel(false);
        let recv_handle = tokio::spawn(do_recv_loop(socket.clone(), active.clone(), self.config.receive_error_backoff, shutdown_receiver.clone()));
        let cleanup_handle = tokio::spawn(do_cleanup_loop(active.clone(), self.config.cleanup_interval, shutdown_receiver));

        *running = Some(Running {
            active,
            socket,
            shutdown,
            recv_handle,
            cleanup_handle,
        });
        Ok(())
    }

    /// Stops the background activities and releases the socket, so the port is free when this
    ///  returns. Sends that are in flight fail with [TransportError::Closed]. Closing an
    ///  endpoint that is not running is a no-op.
    ///
    /// NB: This waits for the receive loop to finish, so it must not be awaited from inside a
    ///  message handler
    pub async fn close(&self) {
        let running = self.running.lock().unwrap().take();
        let Some(running) = running else {
            return;
        };

        info!("closing end point {:?}", running.socket.local_addr());
        // the loops also stop if the sender is dropped, so a send error is irrelevant
        let _ = running.shutdown.send(true);
        running.active.close();

        for handle in [running.recv_handle, running.cleanup_handle] {
            if let Err(e) = handle.await {
                error!("background task of end point terminated abnormally: {}", e);
            }
        }
        running.socket.release().await;
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    /// The address the socket is bound to, if the endpoint is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().unwrap()
            .as_ref()
            .map(|r| r.socket.local_addr())
    }

    fn active(&self) -> TransportResult<Arc<ActiveEndPoint>> {
        self.running.lock().unwrap()
            .as_ref()
            .map(|r| r.active.clone())
            .ok_or(TransportError::NotStarted)
    }

    pub async fn send_message(&self, to: SocketAddr, routing_key: i32, payload: &[u8], reliable: bool) -> TransportResult<SendOutcome> {
        self.active()?
            .send_message(to, routing_key, payload, reliable).await
    }

    /// Sends a message in the background. Errors are logged rather than returned.
    pub fn send_and_forget(self: &Arc<Self>, to: SocketAddr, routing_key: i32, payload: Vec<u8>, reliable: bool) {
        let end_point = self.clone();
        tokio::spawn(async move {
            if let Err(e) = end_point.send_message(to, routing_key, &payload, reliable).await {
                error!("error sending message to {:?}: {}", to, e);
            }
        });
    }

    pub fn register_handler(&self, routing_key: i32, handler: Arc<dyn MessageHandler>) -> HandlerRegistration {
        self.handlers.register(routing_key, handler)
    }
}

/// Dropping a running endpoint shuts it down without waiting: the background tasks are
///  aborted, and the socket is released right away unless a send is in progress - otherwise
///  it is closed when the last send finishes. Use [EndPoint::close] to free the port
///  deterministically.
impl Drop for EndPoint {
    fn drop(&mut self) {
        let running = match self.running.get_mut() {
            Ok(running) => running.take(),
            Err(_) => None,
        };
        if let Some(running) = running {
            debug!("end point {:?} dropped while running - shutting down", running.socket.local_addr());
            let _ = running.shutdown.send(true);
            running.active.close();
            running.recv_handle.abort();
            running.cleanup_handle.abort();
            running.socket.try_release();
        }
    }
}


/// The protocol state of a started endpoint, independent of the actual socket so it can be
///  driven directly by tests
struct ActiveEndPoint {
    config: Arc<RudpConfig>,
    pipeline: Arc<SendPipeline>,
    reliable_sender: ReliableSender,
    assemblers: Mutex<FxHashMap<MessageId, Arc<FragmentAssembler>>>,
    duplicate_cache: DuplicateCache,
    buffer_pool: Arc<BufferPool>,
    handlers: Arc<HandlerRegistry>,
}

impl ActiveEndPoint {
    fn new(config: Arc<RudpConfig>, socket: Arc<dyn SendSocket>, handlers: Arc<HandlerRegistry>) -> ActiveEndPoint {
        let pipeline = Arc::new(SendPipeline::new(socket, &config));
        ActiveEndPoint {
            reliable_sender: ReliableSender::new(config.clone(), pipeline.clone()),
            pipeline,
            assemblers: Default::default(),
            duplicate_cache: DuplicateCache::new(config.duplicate_ttl),
            buffer_pool: Arc::new(BufferPool::new(config.fragment_payload_len(), config.buffer_pool_size)),
            handlers,
            config,
        }
    }

    async fn send_message(&self, to: SocketAddr, routing_key: i32, payload: &[u8], reliable: bool) -> TransportResult<SendOutcome> {
        self.reliable_sender.send_message(to, routing_key, payload, reliable).await
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!("received datagram from {:?}: {:?}", from, datagram);

        if datagram.len() < PacketHeader::SERIALIZED_LEN {
            debug!("datagram from {:?} shorter than packet header - dropping", from);
            return;
        }
        let header = match PacketHeader::deser(&mut &datagram[..]) {
            Ok(header) => header,
            Err(e) => {
                debug!("unparsable header from {:?}: {} - dropping", from, e);
                return;
            }
        };

        if header.is_ack() {
            self.reliable_sender.report_ack(header.message_id, header.fragment_index);
            return;
        }

        self.send_ack(from, &header).await;

        if self.duplicate_cache.contains(header.message_id) {
            debug!("fragment {} of already delivered message {} - dropping", header.fragment_index, header.message_id);
            return;
        }

        let assembler = self.assemblers.lock().unwrap()
            .entry(header.message_id)
            .or_insert_with(|| Arc::new(FragmentAssembler::new(header.fragment_count, self.buffer_pool.clone())))
            .clone();

        if assembler.fragment_count() != header.fragment_count {
            debug!("fragment of message {} has fragment count {}, expected {} - dropping", header.message_id, header.fragment_count, assembler.fragment_count());
            return;
        }

        if !assembler.add_fragment(header.fragment_index, PacketHeader::payload_of(datagram)) {
            return;
        }

        self.duplicate_cache.insert(header.message_id, Instant::now());
        self.assemblers.lock().unwrap()
            .remove(&header.message_id);

        let message = assembler.merged();
        drop(assembler);

        trace!("message {} complete with {} bytes", header.message_id, message.len());
        self.handlers.dispatch(header.routing_key, from, &message).await;
    }

    async fn send_ack(&self, to: SocketAddr, header: &PacketHeader) {
        let ack = PacketHeader::ack(header.message_id, header.fragment_index);
        if let Err(e) = self.pipeline.send_unlimited(to, &ack.to_bytes()).await {
            debug!("error sending ack for fragment {} of message {} to {:?}: {}", header.fragment_index, header.message_id, to, e);
        }
    }

    fn cleanup(&self, now: Instant) {
        let num_evicted = self.duplicate_cache.evict_expired(now);
        if num_evicted > 0 {
            debug!("evicted {} completed message ids", num_evicted);
        }

        if let Some(timeout) = self.config.incomplete_message_timeout {
            self.assemblers.lock().unwrap()
                .retain(|message_id, assembler| {
                    let keep = now.saturating_duration_since(assembler.created_at()) <= timeout;
                    if !keep {
                        debug!("message {} still incomplete after {:?} - discarding {} of {} fragments' worth of data", message_id, timeout, assembler.merged_size(), assembler.fragment_count());
                    }
                    keep
                });
        }
    }

    fn close(&self) {
        self.pipeline.close();
    }
}

async fn do_recv_loop(socket: Arc<dyn ReceiveSocket>, active: Arc<ActiveEndPoint>, error_backoff: Duration, mut shutdown: watch::Receiver<bool>) {
    info!("starting receive loop");

    let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
    loop {
        let received = select! {
            _ = shutdown.changed() => break,
            received = socket.recv_packet(&mut buf) => received,
        };

        let (num_read, from) = match received {
            Ok(x) => x,
            Err(e) => {
                error!("socket error: {}", e);
                select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(error_backoff) => continue,
                }
            }
        };

        let correlation_id = Uuid::new_v4();
        active.on_datagram(from, &buf[..num_read])
            .instrument(span!(Level::TRACE, "datagram_received", ?correlation_id))
            .await;
    }
    debug!("receive loop stopped");
}

async fn do_cleanup_loop(active: Arc<ActiveEndPoint>, cleanup_interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = interval_at(Instant::now() + cleanup_interval, cleanup_interval);
    loop {
        select! {
            _ = shutdown.changed() => break,
            _ = ticks.tick() => active.cleanup(Instant::now()),
        }
    }
    debug!("cleanup loop stopped");
}
