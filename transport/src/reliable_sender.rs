use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace, warn};
use crate::config::RudpConfig;
use crate::error::{TransportError, TransportResult};
use crate::message_id::MessageId;
use crate::packet_header::PacketHeader;
use crate::send_pipeline::SendPipeline;

/// The result of a completed [ReliableSender::send_message] call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SendOutcome {
    pub message_id: MessageId,
    pub fragment_count: u16,
    /// Indexes of fragments of a reliable message that were given up after all retries. The
    ///  receiver will never complete such a message.
    pub unacknowledged: Vec<u16>,
}

impl SendOutcome {
    pub fn is_fully_acknowledged(&self) -> bool {
        self.unacknowledged.is_empty()
    }
}

struct AckFlags {
    flags: Vec<AtomicBool>,
}
impl AckFlags {
    fn new(fragment_count: u16) -> AckFlags {
        AckFlags {
            flags: (0..fragment_count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn set(&self, fragment_index: u16) -> bool {
        match self.flags.get(fragment_index as usize) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn is_set(&self, fragment_index: u16) -> bool {
        self.flags.get(fragment_index as usize)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

type PendingAcks = Arc<Mutex<FxHashMap<MessageId, Arc<AckFlags>>>>;

/// Keeps a message's ack flags registered for as long as the send is in progress, and removes
///  them when dropped - including when the send future is cancelled
struct AckRegistration {
    pending_acks: PendingAcks,
    message_id: MessageId,
    flags: Arc<AckFlags>,
}

impl Drop for AckRegistration {
    fn drop(&mut self) {
        self.pending_acks.lock().unwrap()
            .remove(&self.message_id);
    }
}

#[derive(Clone, Copy)]
struct RetryPolicy {
    retry_count: u32,
    retry_interval: Duration,
    ack_poll_interval: Duration,
}

/// Splits messages into fragments and sends them, retrying each fragment of a reliable
///  message until it is acknowledged or the configured number of attempts is used up.
pub struct ReliableSender {
    config: Arc<RudpConfig>,
    pipeline: Arc<SendPipeline>,
    pending_acks: PendingAcks,
}

impl ReliableSender {
    pub fn new(config: Arc<RudpConfig>, pipeline: Arc<SendPipeline>) -> ReliableSender {
        ReliableSender {
            config,
            pipeline,
            pending_acks: Default::default(),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_count: self.config.reliable_retry_count,
            retry_interval: self.config.reliable_retry_interval,
            ack_poll_interval: self.config.ack_poll_interval,
        }
    }

    /// Sends a message, returning when all fragments were either acknowledged or given up
    ///  (for reliable messages) or handed to the socket (for unreliable ones).
    ///
    /// Fragments that are never acknowledged do not fail the call, they are reported in the
    ///  returned [SendOutcome].
    pub async fn send_message(&self, to: SocketAddr, routing_key: i32, payload: &[u8], reliable: bool) -> TransportResult<SendOutcome> {
        let max = self.config.max_message_len();
        if payload.len() > max {
            return Err(TransportError::PayloadTooLarge { len: payload.len(), max });
        }

        let fragment_count = self.config.fragment_count(payload.len()) as u16;
        let registration = self.register_message(fragment_count);
        let message_id = registration.message_id;
        trace!("sending message {} with {} bytes in {} fragments to {:?}", message_id, payload.len(), fragment_count, to);

        let datagrams = self.fragments(message_id, routing_key, fragment_count, payload);
        let policy = self.retry_policy();

        let mut acknowledged = Vec::with_capacity(fragment_count as usize);
        if self.config.parallel_sending {
            let mut fragment_sends = JoinSet::new();
            for (fragment_index, datagram) in datagrams.into_iter().enumerate() {
                let pipeline = self.pipeline.clone();
                let flags = registration.flags.clone();
                fragment_sends.spawn(async move {
                    let fragment_index = fragment_index as u16;
                    let result = send_fragment(&pipeline, &flags, policy, to, message_id, fragment_index, datagram, reliable).await;
                    (fragment_index, result)
                });
            }
            while let Some(joined) = fragment_sends.join_next().await {
                match joined {
                    Ok((fragment_index, result)) => acknowledged.push((fragment_index, result?)),
                    Err(e) => {
                        error!("fragment send for message {} failed: {}", message_id, e);
                        return Err(TransportError::Closed);
                    }
                }
            }
            acknowledged.sort_by_key(|(fragment_index, _)| *fragment_index);
        }
        else {
            for (fragment_index, datagram) in datagrams.into_iter().enumerate() {
                let fragment_index = fragment_index as u16;
                let result = send_fragment(&self.pipeline, &registration.flags, policy, to, message_id, fragment_index, datagram, reliable).await?;
                acknowledged.push((fragment_index, result));
            }
        }

        let unacknowledged = acknowledged.into_iter()
            .filter(|(_, acked)| !acked)
            .map(|(fragment_index, _)| fragment_index)
            .collect::<Vec<_>>();
        if !unacknowledged.is_empty() {
            debug!("message {} to {:?}: {} of {} fragments were not acknowledged", message_id, to, unacknowledged.len(), fragment_count);
        }

        Ok(SendOutcome {
            message_id,
            fragment_count,
            unacknowledged,
        })
    }

    /// Registers ack flags under a random message id that is not currently in use
    fn register_message(&self, fragment_count: u16) -> AckRegistration {
        let flags = Arc::new(AckFlags::new(fragment_count));
        let mut pending_acks = self.pending_acks.lock().unwrap();

        let message_id = loop {
            let candidate = MessageId::random();
            if !pending_acks.contains_key(&candidate) {
                break candidate;
            }
            debug!("message id {} is in use by another send - drawing a new one", candidate);
        };
        pending_acks.insert(message_id, flags.clone());

        AckRegistration {
            pending_acks: self.pending_acks.clone(),
            message_id,
            flags,
        }
    }

    fn fragments(&self, message_id: MessageId, routing_key: i32, fragment_count: u16, payload: &[u8]) -> Vec<Bytes> {
        let fragment_payload_len = self.config.fragment_payload_len();
        (0..fragment_count)
            .map(|fragment_index| {
                let offs = fragment_index as usize * fragment_payload_len;
                let end = payload.len().min(offs + fragment_payload_len);
                let fragment_payload = &payload[offs..end];

                let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + fragment_payload.len());
                PacketHeader::fragment(message_id, fragment_index, fragment_count, routing_key)
                    .ser(&mut buf);
                buf.put_slice(fragment_payload);
                buf.freeze()
            })
            .collect()
    }

    /// Records an ack received from the peer. Acks for messages that are not (or no longer)
    ///  being sent are ignored.
    pub fn report_ack(&self, message_id: MessageId, fragment_index: u16) {
        let flags = self.pending_acks.lock().unwrap()
            .get(&message_id)
            .cloned();

        match flags {
            Some(flags) => {
                if !flags.set(fragment_index) {
                    debug!("ack for message {} has fragment index {} out of range - ignoring", message_id, fragment_index);
                }
            }
            None => trace!("ack for message {} that is not in flight - ignoring", message_id),
        }
    }

    #[cfg(test)]
    fn num_pending(&self) -> usize {
        self.pending_acks.lock().unwrap().len()
    }
}

/// Sends a single fragment. For a reliable message, returns whether it was acknowledged; an
///  unreliable fragment counts as acknowledged once it is handed to the socket.
#[allow(clippy::too_many_arguments)]
async fn send_fragment(pipeline: &SendPipeline, flags: &AckFlags, policy: RetryPolicy, to: SocketAddr, message_id: MessageId, fragment_index: u16, datagram: Bytes, reliable: bool) -> TransportResult<bool> {
    if !reliable {
        match pipeline.send_packet(to, datagram).await {
            Ok(()) => trace!("sent fragment {} of message {}", fragment_index, message_id),
            Err(TransportError::Io(e)) => error!("error sending fragment {} of message {} to {:?}: {}", fragment_index, message_id, to, e),
            Err(e) => return Err(e),
        }
        return Ok(true);
    }

    for attempt in 1..=policy.retry_count {
        match pipeline.send_packet(to, datagram.clone()).await {
            Ok(()) => trace!("sent fragment {} of message {} (attempt #{})", fragment_index, message_id, attempt),
            Err(TransportError::Io(e)) => error!("error sending fragment {} of message {} to {:?} (attempt #{}): {}", fragment_index, message_id, to, attempt, e),
            Err(e) => return Err(e),
        }

        if wait_for_ack(pipeline, flags, fragment_index, policy).await? {
            return Ok(true);
        }
    }

    warn!("fragment {} of message {} to {:?} was not acknowledged after {} attempts - giving up", fragment_index, message_id, to, policy.retry_count);
    Ok(false)
}

async fn wait_for_ack(pipeline: &SendPipeline, flags: &AckFlags, fragment_index: u16, policy: RetryPolicy) -> TransportResult<bool> {
    let deadline = Instant::now() + policy.retry_interval;
    loop {
        if flags.is_set(fragment_index) {
            return Ok(true);
        }
        if pipeline.is_closed() {
            return Err(TransportError::Closed);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(policy.ack_poll_interval).await;
    }
}
