use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::message_id::MessageId;

/// The fixed-size header in front of every datagram, all numbers little endian:
///
/// ```ascii
///  0: message id (i32)
///  4: fragment index (u16) - for an ack, the index of the acknowledged fragment
///  6: fragment count (u16) - 0 marks the datagram as an ack
///  8: routing key (i32) - 0 for acks
/// 12: payload (absent for acks)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_id: MessageId,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub routing_key: i32,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = size_of::<i32>() + 2*size_of::<u16>() + size_of::<i32>();

    pub fn fragment(message_id: MessageId, fragment_index: u16, fragment_count: u16, routing_key: i32) -> PacketHeader {
        debug_assert!(fragment_count > 0);
        PacketHeader {
            message_id,
            fragment_index,
            fragment_count,
            routing_key,
        }
    }

    pub fn ack(message_id: MessageId, fragment_index: u16) -> PacketHeader {
        PacketHeader {
            message_id,
            fragment_index,
            fragment_count: 0,
            routing_key: 0,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.fragment_count == 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.message_id.to_raw());
        buf.put_u16_le(self.fragment_index);
        buf.put_u16_le(self.fragment_count);
        buf.put_i32_le(self.routing_key);
    }

    pub fn to_bytes(&self) -> [u8; Self::SERIALIZED_LEN] {
        let mut result = [0u8; Self::SERIALIZED_LEN];
        self.ser(&mut &mut result[..]);
        result
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("datagram of {} bytes is shorter than the packet header", buf.remaining());
        }

        Ok(PacketHeader {
            message_id: MessageId::from_raw(buf.get_i32_le()),
            fragment_index: buf.get_u16_le(),
            fragment_count: buf.get_u16_le(),
            routing_key: buf.get_i32_le(),
        })
    }

    /// The part of a datagram after the header - empty if there is none
    pub fn payload_of(datagram: &[u8]) -> &[u8] {
        if datagram.len() <= Self::SERIALIZED_LEN {
            &[]
        }
        else {
            &datagram[Self::SERIALIZED_LEN..]
        }
    }
}
