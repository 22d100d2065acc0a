//! Wire format of the transport.
//!
//! Every datagram is one [`Packet`]: an 11-byte header followed by up to
//! 1024 payload bytes. All numbers are in network byte order (BE):
//!
//! ```ascii
//!     0                   1                   2                   3
//!     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  0 | type          | sequence number                               |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  4 |               | peer IPv4 address                             |
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  8 |               | peer port                     | payload ...
//!    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The peer address names the *other* end of the logical connection: on a
//! freshly sent packet it is the destination the router should forward to,
//! and the router rewrites it to the observed sender address before
//! delivery, so the receiver reads it as the reply-to address.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddrV4;

use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::TryFromPrimitive;

/// type(1) + sequence number(4) + IPv4 address(4) + port(2)
pub const HEADER_LEN: usize = 11;
pub const MAX_PAYLOAD: usize = 1024;

pub const MIN_PACKET_LEN: usize = HEADER_LEN;
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_PAYLOAD;

/// Wait per retry attempt before a packet is re-sent (see
/// [`super::reliable::ReliableSender`]).
pub const RETRY_TIMEOUT_MILLIS: u64 = 2000;

#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Syn = 0,
    Ack = 1,
    SynAck = 2,
    Fin = 3,
    Data = 4,
}

/// An immutable wire packet. Constructed per send, never mutated.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub sequence_number: u32,
    pub peer_addr: SocketAddrV4,
    pub payload: Bytes,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {:?} peer={} sz={}",
            self.sequence_number,
            self.packet_type,
            self.peer_addr,
            self.payload.len()
        )
    }
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        sequence_number: u32,
        peer_addr: SocketAddrV4,
        payload: Bytes,
    ) -> Packet {
        Packet {
            packet_type,
            sequence_number,
            peer_addr,
            payload,
        }
    }

    /// SYN / SYNACK / ACK / FIN carry no payload - their information is
    /// entirely in the header.
    pub fn control(packet_type: PacketType, sequence_number: u32, peer_addr: SocketAddrV4) -> Packet {
        Packet::new(packet_type, sequence_number, peer_addr, Bytes::new())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.packet_type as u8);
        buf.put_u32(self.sequence_number);
        buf.put_u32(self.peer_addr.ip().to_bits());
        buf.put_u16(self.peer_addr.port());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a packet from a raw datagram. A buffer outside the valid
    /// length range or with an unknown type byte is 'no packet' rather than
    /// an error - the protocol silently ignores such datagrams.
    pub fn decode(mut buf: &[u8]) -> Option<Packet> {
        if buf.len() < MIN_PACKET_LEN || buf.len() > MAX_PACKET_LEN {
            return None;
        }

        let packet_type = PacketType::try_from(buf.try_get_u8().ok()?).ok()?;
        let sequence_number = buf.try_get_u32().ok()?;
        let ip = buf.try_get_u32().ok()?;
        let port = buf.try_get_u16().ok()?;

        Some(Packet {
            packet_type,
            sequence_number,
            peer_addr: SocketAddrV4::new(ip.into(), port),
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

/// Splits a message into the outbound half of an exchange: DATA packets of
/// up to [`MAX_PAYLOAD`] bytes with sequence numbers advancing by 2 from
/// `start_seq`, terminated by a FIN one past the last DATA sequence number.
/// An empty message yields a lone FIN at `start_seq`.
pub fn split_message(
    data: &[u8],
    peer_addr: SocketAddrV4,
    start_seq: u32,
) -> BTreeMap<u32, Packet> {
    let mut packets = BTreeMap::new();

    let mut seq = start_seq;
    let mut fin_seq = start_seq;
    for chunk in data.chunks(MAX_PAYLOAD) {
        packets.insert(
            seq,
            Packet::new(
                PacketType::Data,
                seq,
                peer_addr,
                Bytes::copy_from_slice(chunk),
            ),
        );
        fin_seq = seq + 1;
        seq += 2;
    }

    packets.insert(fin_seq, Packet::control(PacketType::Fin, fin_seq, peer_addr));
    packets
}
