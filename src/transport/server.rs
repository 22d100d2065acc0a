//! The responding side: accepts handshakes, accumulates the inbound
//! DATA/FIN stream into a request, hands the request to the application
//! collaborator and streams its response back under the same DATA/FIN
//! convention. Serves any number of independent exchanges in sequence.

use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::router::ShutdownSignal;
use crate::transport::packet::{split_message, Packet, PacketType, MAX_PACKET_LEN};
use crate::transport::reliable::{PacketHandler, ReliableSender, Reply};

/// The application behind the transport. Opaque to the protocol: it gets
/// the reassembled request and returns the full response to stream back.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &str) -> anyhow::Result<String>;
}

pub struct Server {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn RequestHandler>,
    /// set once the response stream's FIN heads for the router, which closes
    /// itself after forwarding it (experiment-ending hook, not protocol)
    shutdown: Option<ShutdownSignal>,
}

impl Server {
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
        shutdown: Option<ShutdownSignal>,
    ) -> anyhow::Result<Server> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        Ok(Server {
            socket,
            handler,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive loop over independent exchanges; runs until the socket fails
    /// or the task is cancelled. The router's address is learned from each
    /// datagram's UDP source, so the server needs no routing configuration.
    pub async fn serve(&self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "server listening");

        let mut exchange = ServerExchange::new();
        let mut buf = [0u8; MAX_PACKET_LEN + 1];

        loop {
            let (len, router_addr) = self.socket.recv_from(&mut buf).await?;
            let Some(packet) = Packet::decode(&buf[..len]) else {
                trace!("undecodable datagram - ignoring");
                continue;
            };
            trace!("received {:?} via {}", packet, router_addr);

            let sender = ReliableSender::new(self.socket.clone(), router_addr);
            match exchange.on_packet(&packet) {
                Some(Reply::WithRetry(reply)) => {
                    // the accepted response (the first DATA of the request
                    // stream) is dispatched into the exchange inline
                    sender.send_with_retry(&reply, &mut exchange).await?;
                }
                Some(Reply::Once(reply)) => sender.send_once(&reply).await?,
                None => {}
            }

            if exchange.request_complete() {
                self.respond(&sender, &mut exchange).await?;
            }
        }
    }

    async fn respond(
        &self,
        sender: &ReliableSender,
        exchange: &mut ServerExchange,
    ) -> anyhow::Result<()> {
        let (request, fin_seq, client_addr) = exchange.request()?;
        info!(len = request.len(), client = %client_addr, "request complete");

        let response = self.handler.handle(&request)?;

        // the response stream's first DATA is numbered one past the
        // request's FIN and doubles as that FIN's acknowledgment
        let to_send = split_message(response.as_bytes(), client_addr, fin_seq.wrapping_add(1));
        if let Some(signal) = &self.shutdown {
            signal.set();
        }
        for packet in to_send.values() {
            sender.send_with_retry(packet, exchange).await?;
        }
        debug!(packets = to_send.len(), "response stream acknowledged");

        // per-exchange state is cleared only now: until the response is
        // through, re-delivered request packets must still look like
        // duplicates
        exchange.clear();
        Ok(())
    }
}

/// Inbound half of one exchange on the responding side. As on the client,
/// duplicate suppression is a single check keyed by sequence number, and a
/// duplicate gets its acknowledgment re-issued without being re-recorded -
/// regardless of whether the packet arrived through the receive loop or
/// through a retry loop's dispatch.
struct ServerExchange {
    received: BTreeMap<u32, Packet>,
    fin_seq: Option<u32>,
}

impl ServerExchange {
    fn new() -> ServerExchange {
        ServerExchange {
            received: BTreeMap::new(),
            fin_seq: None,
        }
    }

    fn request_complete(&self) -> bool {
        self.fin_seq.is_some()
    }

    /// Reassembled request (DATA payloads in sequence-number order), the
    /// FIN's sequence number, and the client's reply-to address.
    fn request(&self) -> anyhow::Result<(String, u32, SocketAddrV4)> {
        let fin_seq = self.fin_seq.ok_or_else(|| anyhow!("request stream has no FIN yet"))?;
        let fin = self
            .received
            .get(&fin_seq)
            .ok_or_else(|| anyhow!("FIN packet missing from inbound map"))?;

        let mut request = Vec::new();
        for packet in self.received.values() {
            if packet.packet_type == PacketType::Data {
                request.extend_from_slice(&packet.payload);
            }
        }
        Ok((
            String::from_utf8_lossy(&request).into_owned(),
            fin_seq,
            fin.peer_addr,
        ))
    }

    fn clear(&mut self) {
        self.received.clear();
        self.fin_seq = None;
    }

    fn ack(packet: &Packet) -> Packet {
        Packet::control(
            PacketType::Ack,
            packet.sequence_number.wrapping_add(1),
            packet.peer_addr,
        )
    }
}

impl PacketHandler for ServerExchange {
    fn on_packet(&mut self, packet: &Packet) -> Option<Reply> {
        match packet.packet_type {
            PacketType::Syn => {
                let synack = Packet::control(
                    PacketType::SynAck,
                    packet.sequence_number.wrapping_add(1),
                    packet.peer_addr,
                );
                if self.received.contains_key(&packet.sequence_number) {
                    debug!("duplicate of {:?} - re-acknowledging only", packet);
                    Some(Reply::Once(synack))
                } else {
                    info!("accepting handshake {:?}", packet);
                    self.received.insert(packet.sequence_number, packet.clone());
                    Some(Reply::WithRetry(synack))
                }
            }
            PacketType::Data => {
                if self.received.contains_key(&packet.sequence_number) {
                    debug!("duplicate of {:?} - re-acknowledging only", packet);
                } else {
                    self.received.insert(packet.sequence_number, packet.clone());
                }
                Some(Reply::Once(Self::ack(packet)))
            }
            PacketType::Fin => {
                if self.received.contains_key(&packet.sequence_number) {
                    // the response stream's retries re-deliver its implicit
                    // acknowledgment, nothing to do here
                    debug!("duplicate of {:?} - ignoring", packet);
                } else {
                    debug!("request stream complete at {:?}", packet);
                    self.received.insert(packet.sequence_number, packet.clone());
                    self.fin_seq = Some(packet.sequence_number);
                }
                None
            }
            PacketType::Ack | PacketType::SynAck => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bytes::Bytes;

    use super::*;

    fn client() -> SocketAddrV4 {
        SocketAddrV4::from_str("127.0.0.1:41000").unwrap()
    }

    fn data(seq: u32, payload: &'static [u8]) -> Packet {
        Packet::new(PacketType::Data, seq, client(), Bytes::from_static(payload))
    }

    #[test]
    fn test_fresh_syn_is_answered_reliably_duplicate_once() {
        let mut exchange = ServerExchange::new();
        let syn = Packet::control(PacketType::Syn, 0, client());

        match exchange.on_packet(&syn) {
            Some(Reply::WithRetry(synack)) => {
                assert_eq!(synack.packet_type, PacketType::SynAck);
                assert_eq!(synack.sequence_number, 1);
            }
            _ => panic!("fresh SYN must be answered with a reliable SYNACK"),
        }
        match exchange.on_packet(&syn) {
            Some(Reply::Once(synack)) => assert_eq!(synack.sequence_number, 1),
            _ => panic!("duplicate SYN must be re-acknowledged once"),
        }
        assert_eq!(exchange.received.len(), 1);
    }

    #[test]
    fn test_delivering_same_data_twice_records_once() {
        let mut exchange = ServerExchange::new();
        exchange.on_packet(&data(2, b"abc"));
        exchange.on_packet(&data(2, b"abc"));
        assert_eq!(exchange.received.len(), 1);
    }

    #[test]
    fn test_request_reassembly_skips_control_packets() {
        let mut exchange = ServerExchange::new();
        exchange.on_packet(&Packet::control(PacketType::Syn, 0, client()));
        // arrival order scrambled on purpose
        exchange.on_packet(&data(4, b" HTTP/1.0\r\n\r\n"));
        exchange.on_packet(&data(2, b"GET /foo.txt"));
        assert!(!exchange.request_complete());

        exchange.on_packet(&Packet::control(PacketType::Fin, 5, client()));
        assert!(exchange.request_complete());

        let (request, fin_seq, client_addr) = exchange.request().unwrap();
        assert_eq!(request, "GET /foo.txt HTTP/1.0\r\n\r\n");
        assert_eq!(fin_seq, 5);
        assert_eq!(client_addr, client());
    }

    #[test]
    fn test_clear_makes_room_for_the_next_exchange() {
        let mut exchange = ServerExchange::new();
        exchange.on_packet(&Packet::control(PacketType::Syn, 0, client()));
        exchange.on_packet(&data(2, b"x"));
        exchange.on_packet(&Packet::control(PacketType::Fin, 3, client()));

        exchange.clear();
        assert!(!exchange.request_complete());

        // the next exchange reuses the same sequence numbers
        match exchange.on_packet(&Packet::control(PacketType::Syn, 0, client())) {
            Some(Reply::WithRetry(_)) => {}
            _ => panic!("post-clear SYN must look fresh"),
        }
    }

    #[test]
    fn test_acks_do_not_enter_the_inbound_map() {
        let mut exchange = ServerExchange::new();
        assert!(exchange
            .on_packet(&Packet::control(PacketType::Ack, 3, client()))
            .is_none());
        assert!(exchange.received.is_empty());
    }
}
