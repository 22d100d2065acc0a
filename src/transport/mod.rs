//! A reliable, ordered, connection-oriented byte transport on top of
//! unreliable UDP datagrams.
//!
//! The protocol is deliberately stop-and-wait: one unacknowledged packet in
//! flight per sender, matched purely by sequence number (`ack.seq ==
//! sent.seq + 1`). One logical exchange looks like this:
//!
//! * handshake: SYN (seq 0) → SYNACK (seq 1)
//! * request:   DATA packets at seq 2, 4, 6, ... each answered by an ACK
//!              one past it, closed by a FIN one past the last DATA
//! * response:  the same DATA/FIN convention in the other direction,
//!              numbered from the request FIN + 1 - so the first response
//!              DATA doubles as that FIN's acknowledgment
//! * teardown:  the receiver of a stream-closing FIN answers with a plain
//!              ACK so the other side's retry loop can terminate
//!
//! All traffic passes through the [`crate::router`] emulator, which may
//! drop, delay, reorder and thereby duplicate packets; correctness rests on
//! retransmission plus sequence-keyed duplicate suppression alone. There is
//! no windowing, no congestion control and no checksum beyond what UDP
//! provides.

pub mod client;
pub mod packet;
pub mod reliable;
pub mod server;
