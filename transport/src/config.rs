use std::time::Duration;
use anyhow::bail;
use crate::packet_header::PacketHeader;

/// The largest UDP payload that fits into an IPv4 datagram
const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Clone, Debug)]
pub struct RudpConfig {
    /// This is the size of the datagrams the transport produces, *including* the fragment
    ///  header. Messages are split into fragments of `mtu - 12` payload bytes each.
    ///
    /// The transport does not attempt path MTU discovery; choosing this value too big causes
    ///  IP-level fragmentation (or silent drops on some routes), choosing it too small wastes
    ///  bandwidth on headers.
    pub mtu: usize,

    /// If true, all fragments of a message are put on the wire at once and their acks are
    ///  awaited together. If false, each fragment is sent (and for reliable messages,
    ///  acknowledged or given up) before the next one starts - slower, but gentler on
    ///  networks that drop bursts.
    pub parallel_sending: bool,

    /// Number of send attempts for each fragment of a reliable message before it is given up
    pub reliable_retry_count: u32,
    /// How long to wait for an ack after each attempt
    pub reliable_retry_interval: Duration,
    /// Granularity for checking whether an ack arrived
    pub ack_poll_interval: Duration,

    /// If false, datagrams go straight to the socket
    pub enable_send_rate_limit: bool,
    /// Token bucket capacity in bytes, i.e. the maximum burst
    pub send_bucket_byte_size: u64,
    /// Sustained send rate in bytes per second
    pub send_bucket_refill_rate_per_sec: u64,
    /// Tokens are added in discrete ticks of this length
    pub refill_interval: Duration,
    /// Delay between attempts of the send queue to take tokens for the datagram at its head
    pub send_queue_poll_interval: Duration,

    /// How long the id of a completed message is remembered to suppress re-delivery of
    ///  late duplicate fragments
    pub duplicate_ttl: Duration,
    pub cleanup_interval: Duration,

    /// Partially received messages are discarded after this time. `None` keeps them
    ///  until the endpoint is closed.
    pub incomplete_message_timeout: Option<Duration>,

    /// Pause in the receive loop after a socket error, to avoid spinning on persistent errors
    pub receive_error_backoff: Duration,

    /// This is the number of fragment buffers that will be pooled at a given time - buffers in
    ///  excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,
}

impl Default for RudpConfig {
    fn default() -> Self {
        RudpConfig {
            mtu: 1400,
            parallel_sending: true,
            reliable_retry_count: 5,
            reliable_retry_interval: Duration::from_millis(50),
            ack_poll_interval: Duration::from_millis(1),
            enable_send_rate_limit: false,
            send_bucket_byte_size: 3_000_000,
            send_bucket_refill_rate_per_sec: 1_875_000,
            refill_interval: Duration::from_millis(100),
            send_queue_poll_interval: Duration::from_millis(1),
            duplicate_ttl: Duration::from_secs(1),
            cleanup_interval: Duration::from_millis(100),
            incomplete_message_timeout: Some(Duration::from_secs(5)),
            receive_error_backoff: Duration::from_millis(500),
            buffer_pool_size: 4096,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= PacketHeader::SERIALIZED_LEN {
            bail!("MTU of {} leaves no room for payload after the {} byte header", self.mtu, PacketHeader::SERIALIZED_LEN);
        }
        if self.mtu > MAX_UDP_PAYLOAD {
            bail!("MTU of {} exceeds the maximum UDP payload of {}", self.mtu, MAX_UDP_PAYLOAD);
        }
        if self.reliable_retry_count == 0 {
            bail!("reliable retry count must be at least 1");
        }
        if self.ack_poll_interval.is_zero() || self.refill_interval.is_zero() || self.cleanup_interval.is_zero() || self.send_queue_poll_interval.is_zero() {
            bail!("polling and timer intervals must be non-zero");
        }

        if self.enable_send_rate_limit {
            if self.send_bucket_byte_size < self.mtu as u64 {
                bail!("send bucket of {} bytes cannot hold a single datagram of {} bytes", self.send_bucket_byte_size, self.mtu);
            }
            if self.refill_tokens_per_tick() == 0 {
                bail!("send bucket refill rate of {} bytes/s adds no tokens per tick", self.send_bucket_refill_rate_per_sec);
            }
        }

        Ok(())
    }

    /// payload bytes carried by each (but the last) fragment
    pub fn fragment_payload_len(&self) -> usize {
        self.mtu - PacketHeader::SERIALIZED_LEN
    }

    /// The fragment count is a u16 on the wire, which bounds the size of a message
    pub fn max_message_len(&self) -> usize {
        self.fragment_payload_len() * u16::MAX as usize
    }

    /// An empty message still occupies one (empty) fragment
    pub fn fragment_count(&self, message_len: usize) -> usize {
        message_len.div_ceil(self.fragment_payload_len()).max(1)
    }

    pub fn refill_tokens_per_tick(&self) -> u64 {
        (self.send_bucket_refill_rate_per_sec as u128 * self.refill_interval.as_micros() / 1_000_000) as u64
    }
}
