//! The initiating side of an exchange: drives the handshake, streams the
//! request out as DATA packets terminated by a FIN, and collects the
//! response stream the peer sends back under the same convention.

use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::transport::packet::{split_message, Packet, PacketType};
use crate::transport::reliable::{PacketHandler, ReliableSender, Reply};

/// The sequence number of the opening SYN. The request stream starts two
/// past it, leaving room for the SYNACK.
const SYN_SEQ: u32 = 0;
const REQUEST_START_SEQ: u32 = 2;

pub struct Client {
    sender: ReliableSender,
    server_addr: SocketAddrV4,
}

impl Client {
    /// All traffic goes through the router at `router_addr`; `server_addr`
    /// is what the packets themselves are addressed to.
    pub async fn bind(
        bind_addr: SocketAddr,
        server_addr: SocketAddrV4,
        router_addr: SocketAddr,
    ) -> anyhow::Result<Client> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        Ok(Client {
            sender: ReliableSender::new(socket, router_addr),
            server_addr,
        })
    }

    /// Runs one complete exchange: handshake, request out, response in.
    /// Returns the reassembled response bytes once the peer's FIN arrives.
    ///
    /// There is no unreachable-server escape hatch: if no matching
    /// acknowledgment ever arrives this retries forever. Callers that need
    /// a bound put a timeout around the future.
    pub async fn execute(&self, request: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut exchange = ClientExchange::new();

        info!(server = %self.server_addr, "opening exchange");
        let syn = Packet::control(PacketType::Syn, SYN_SEQ, self.server_addr);
        self.sender.send_with_retry(&syn, &mut exchange).await?;
        debug!("handshake complete");

        let to_send = split_message(request, self.server_addr, REQUEST_START_SEQ);
        for packet in to_send.values() {
            self.sender.send_with_retry(packet, &mut exchange).await?;
        }
        debug!(packets = to_send.len(), "request stream sent");

        // the response may already have started arriving through the FIN's
        // retry dispatch; drain the socket until its FIN shows up
        while !exchange.done {
            let Some(packet) = self.sender.recv().await? else {
                trace!("undecodable datagram - ignoring");
                continue;
            };
            if let Some(reply) = exchange.on_packet(&packet) {
                match reply {
                    Reply::Once(reply) | Reply::WithRetry(reply) => {
                        self.sender.send_once(&reply).await?
                    }
                }
            }
        }

        let response = exchange.into_response();
        info!(len = response.len(), "exchange complete");
        Ok(response)
    }

    /// Total re-sends across all exchanges on this client. Observability
    /// only.
    pub fn retries(&self) -> u64 {
        self.sender.retries()
    }
}

/// Inbound half of the client's exchange. DATA and FIN packets are recorded
/// keyed by sequence number and acknowledged; a duplicate is not recorded
/// again but its acknowledgment is re-issued, so a peer whose ack got lost
/// still converges.
struct ClientExchange {
    received: BTreeMap<u32, Packet>,
    done: bool,
}

impl ClientExchange {
    fn new() -> ClientExchange {
        ClientExchange {
            received: BTreeMap::new(),
            done: false,
        }
    }

    /// Response payloads in sequence-number order, FIN excluded. Arrival
    /// order does not matter.
    fn into_response(self) -> Vec<u8> {
        let mut response = Vec::new();
        for packet in self.received.values() {
            if packet.packet_type == PacketType::Data {
                response.extend_from_slice(&packet.payload);
            }
        }
        response
    }

    fn ack(packet: &Packet) -> Reply {
        // the inbound packet's peer field was rewritten by the router to
        // the real sender, so it is the right reply-to address
        Reply::Once(Packet::control(
            PacketType::Ack,
            packet.sequence_number.wrapping_add(1),
            packet.peer_addr,
        ))
    }
}

impl PacketHandler for ClientExchange {
    fn on_packet(&mut self, packet: &Packet) -> Option<Reply> {
        match packet.packet_type {
            PacketType::SynAck | PacketType::Ack => None,
            PacketType::Data => {
                if self.received.contains_key(&packet.sequence_number) {
                    debug!("duplicate of {:?} - re-acknowledging only", packet);
                } else {
                    self.received.insert(packet.sequence_number, packet.clone());
                }
                Some(Self::ack(packet))
            }
            PacketType::Fin => {
                if self.received.contains_key(&packet.sequence_number) {
                    debug!("duplicate of {:?} - re-acknowledging only", packet);
                } else {
                    debug!("response stream complete at {:?}", packet);
                    self.received.insert(packet.sequence_number, packet.clone());
                }
                self.done = true;
                Some(Self::ack(packet))
            }
            PacketType::Syn => {
                warn!("unexpected {:?} on the initiating side - ignoring", packet);
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bytes::Bytes;

    use super::*;

    fn server() -> SocketAddrV4 {
        SocketAddrV4::from_str("127.0.0.1:8007").unwrap()
    }

    fn data(seq: u32, payload: &'static [u8]) -> Packet {
        Packet::new(PacketType::Data, seq, server(), Bytes::from_static(payload))
    }

    #[test]
    fn test_reassembles_in_key_order_regardless_of_arrival() {
        let mut exchange = ClientExchange::new();

        // later sequence number delivered first
        exchange.on_packet(&data(5, b"world"));
        exchange.on_packet(&data(3, b"hello "));
        assert!(!exchange.done);

        exchange.on_packet(&Packet::control(PacketType::Fin, 6, server()));
        assert!(exchange.done);

        assert_eq!(exchange.into_response(), b"hello world");
    }

    #[test]
    fn test_duplicate_data_is_recorded_once_but_reacked() {
        let mut exchange = ClientExchange::new();

        let first = exchange.on_packet(&data(3, b"payload"));
        let second = exchange.on_packet(&data(3, b"payload"));

        assert_eq!(exchange.received.len(), 1);
        for reply in [first, second] {
            match reply {
                Some(Reply::Once(ack)) => {
                    assert_eq!(ack.packet_type, PacketType::Ack);
                    assert_eq!(ack.sequence_number, 4);
                }
                _ => panic!("expected a plain ack"),
            }
        }
    }

    #[test]
    fn test_fin_is_acknowledged_and_excluded_from_response() {
        let mut exchange = ClientExchange::new();
        exchange.on_packet(&data(3, b"body"));

        let reply = exchange.on_packet(&Packet::control(PacketType::Fin, 4, server()));
        match reply {
            Some(Reply::Once(ack)) => assert_eq!(ack.sequence_number, 5),
            _ => panic!("expected a plain ack"),
        }

        assert_eq!(exchange.into_response(), b"body");
    }

    #[test]
    fn test_acks_and_synacks_carry_no_state() {
        let mut exchange = ClientExchange::new();
        assert!(exchange
            .on_packet(&Packet::control(PacketType::SynAck, 1, server()))
            .is_none());
        assert!(exchange
            .on_packet(&Packet::control(PacketType::Ack, 3, server()))
            .is_none());
        assert!(exchange.received.is_empty());
    }
}
