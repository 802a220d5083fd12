//! A message oriented transport on top of UDP, with optional reliability per message and no
//!  ordering guarantees.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer without a dedicated server vs. client
//!   * each node has a single UDP socket that it sends from and receives on
//!   * there is no handshake and no notion of a connection - any node can send to any other
//!      node at any time
//! * The abstraction is sending / receiving *messages*, i.e. defined-length chunks of data as
//!    opposed to streams of bytes
//!   * messages are dispatched to handlers by an application defined 'routing key'
//!   * messages can be bigger than a datagram: they are split into fragments of a configured
//!      MTU, and reassembled by the receiver
//! * Reliability is a per-message choice
//!   * every fragment is acknowledged by the receiver, and for reliable messages the sender
//!      re-sends each fragment until it is acknowledged or a configured number of attempts is
//!      used up
//!   * there is *no* guarantee of delivery: fragments that are given up are reported to the
//!      sender, and the receiver never sees the message
//!   * a message is delivered at most once, even if its fragments arrive several times
//! * There is no ordering guarantee between messages, even from the same sender
//! * Sending can be rate limited by a token bucket to avoid overwhelming the network
//!
//! ## Wire format
//!
//! Every datagram starts with a fixed 12 byte header, all numbers little endian:
//!
//! ```ascii
//!  0: message id (i32) - random per message
//!  4: fragment index (u16) - index of this fragment in its message, or of the acknowledged
//!      fragment for an ack
//!  6: fragment count (u16) - number of fragments of the message; 0 marks the datagram as an ack
//!  8: routing key (i32) - application level dispatch key, 0 for acks
//! 12: fragment payload (absent for acks)
//! ```
//!
//! Each fragment carries `mtu - 12` bytes of payload (the last one possibly less), so the maximum
//!  message size is `(mtu - 12) * 65535` bytes. An empty message is a single fragment without
//!  payload.
//!
//! ## Acknowledgement and retries
//!
//! A receiver acknowledges *every* fragment it receives, including fragments of messages that
//!  are already complete, so a sender's retries terminate even if earlier acks were lost.
//!
//! The receiver remembers the ids of completed messages for a configured time to prevent late
//!  copies of their fragments from being delivered a second time. After that time, such a
//!  fragment starts a new message with the same id.
//!
//! NB: Message ids are random 32 bit numbers. An endpoint does not reuse an id while a send with
//!  that id is in flight, but there is no protection against different senders picking the
//!  same id for concurrent messages to the same receiver.

pub mod buffer_pool;
pub mod config;
pub mod duplicate_cache;
pub mod end_point;
pub mod error;
pub mod fragment_assembler;
pub mod handler_registry;
pub mod message_id;
pub mod packet_header;
pub mod rate_limiter;
pub mod reliable_sender;
pub mod send_pipeline;
pub mod udp_socket;

#[cfg(test)]
mod test_util;

pub use config::RudpConfig;
pub use end_point::EndPoint;
pub use error::{TransportError, TransportResult};
pub use handler_registry::{HandlerRegistration, MessageHandler};
pub use message_id::MessageId;
pub use reliable_sender::SendOutcome;
