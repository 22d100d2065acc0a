//! Stop-and-wait retry discipline shared by both connection roles.
//!
//! [`ReliableSender::send_with_retry`] keeps at most one unacknowledged
//! packet in flight: it sends, waits a bounded interval for *any* inbound
//! datagram, and accepts it as the acknowledgment only if its sequence
//! number is exactly one past the sent packet's. Anything else - timeout,
//! undecodable datagram, wrong sequence number - causes the same packet to
//! be re-sent, without an upper bound on attempts. The only ways out are a
//! matching response or cancellation of the owning task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::transport::packet::{Packet, MAX_PACKET_LEN, RETRY_TIMEOUT_MILLIS};

/// Reaction of a [`PacketHandler`] to an inbound packet.
pub enum Reply {
    /// A plain acknowledgment: sent once, never retried. Retransmission
    /// pressure comes from the acknowledged packet's sender.
    Once(Packet),
    /// A packet that must itself be delivered reliably (e.g. the SYNACK
    /// answering a fresh handshake).
    WithRetry(Packet),
}

/// Per-exchange protocol state machine, driven by both the role's own
/// receive loop and - for responses accepted inside the retry loop - by
/// [`ReliableSender::send_with_retry`] before it returns. Implementations
/// do no I/O; duplicate suppression lives here, in exactly one place.
pub trait PacketHandler {
    fn on_packet(&mut self, packet: &Packet) -> Option<Reply>;
}

pub struct ReliableSender {
    socket: Arc<UdpSocket>,
    router_addr: SocketAddr,
    retry_timeout: Duration,
    retries: AtomicU64,
}

impl ReliableSender {
    pub fn new(socket: Arc<UdpSocket>, router_addr: SocketAddr) -> ReliableSender {
        ReliableSender {
            socket,
            router_addr,
            retry_timeout: Duration::from_millis(RETRY_TIMEOUT_MILLIS),
            retries: AtomicU64::new(0),
        }
    }

    /// Sends `packet` towards the router and re-sends it until a response
    /// with sequence number `packet.sequence_number + 1` arrives. The
    /// accepted response is dispatched to `handler` before this returns; a
    /// reply the handler produces in this context is always a plain
    /// acknowledgment and is sent once.
    pub async fn send_with_retry(
        &self,
        packet: &Packet,
        handler: &mut impl PacketHandler,
    ) -> anyhow::Result<Packet> {
        let encoded = packet.encode();
        let expected_seq = packet.sequence_number.wrapping_add(1);
        let mut attempt: u64 = 0;

        loop {
            if attempt > 0 {
                self.retries.fetch_add(1, Ordering::Relaxed);
                debug!(attempt, "retrying {:?}", packet);
            }
            attempt += 1;

            self.socket.send_to(&encoded, self.router_addr).await?;

            match self.wait_for_response().await? {
                Some(response) if response.sequence_number == expected_seq => {
                    trace!("{:?} acknowledged by {:?}", packet, response);
                    match handler.on_packet(&response) {
                        Some(Reply::Once(reply)) => self.send_once(&reply).await?,
                        Some(Reply::WithRetry(reply)) => {
                            // responses accepted mid-retry never open a new
                            // reliable send; degrade rather than recurse
                            warn!("reliable reply {:?} from retry dispatch, sending once", reply);
                            self.send_once(&reply).await?;
                        }
                        None => {}
                    }
                    return Ok(response);
                }
                Some(response) => {
                    debug!(
                        expected_seq,
                        "response {:?} does not acknowledge {:?}", response, packet
                    );
                }
                None => {
                    trace!("no response to {:?} within {:?}", packet, self.retry_timeout);
                }
            }
        }
    }

    /// One datagram, no delivery guarantee.
    pub async fn send_once(&self, packet: &Packet) -> anyhow::Result<()> {
        trace!("sending {:?}", packet);
        self.socket.send_to(&packet.encode(), self.router_addr).await?;
        Ok(())
    }

    /// Blocks until the next datagram arrives; an undecodable one is 'no
    /// packet'.
    pub async fn recv(&self) -> anyhow::Result<Option<Packet>> {
        let mut buf = [0u8; MAX_PACKET_LEN + 1];
        let (len, _) = self.socket.recv_from(&mut buf).await?;
        Ok(Packet::decode(&buf[..len]))
    }

    async fn wait_for_response(&self) -> anyhow::Result<Option<Packet>> {
        let mut buf = [0u8; MAX_PACKET_LEN + 1];
        match timeout(self.retry_timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Ok(Packet::decode(&buf[..len])),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    /// Number of re-sends since construction. Observability only.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;
    use std::str::FromStr;

    use bytes::Bytes;

    use super::*;
    use crate::transport::packet::PacketType;

    struct RecordingHandler {
        seen: Vec<Packet>,
        reply: Option<Packet>,
    }
    impl PacketHandler for RecordingHandler {
        fn on_packet(&mut self, packet: &Packet) -> Option<Reply> {
            self.seen.push(packet.clone());
            self.reply.take().map(Reply::Once)
        }
    }

    fn test_peer() -> SocketAddrV4 {
        SocketAddrV4::from_str("127.0.0.1:19999").unwrap()
    }

    async fn bound_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        (a, b)
    }

    #[tokio::test]
    async fn test_accepts_only_matching_sequence() {
        let (sender_socket, peer_socket) = bound_pair().await;
        let sender = ReliableSender::new(sender_socket, peer_socket.local_addr().unwrap());

        let peer = {
            let socket = peer_socket.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_PACKET_LEN];
                // first answer with a non-matching sequence number, then,
                // after the re-send arrives, with the real acknowledgment
                let (_, from) = socket.recv_from(&mut buf).await.unwrap();
                let wrong = Packet::control(PacketType::Ack, 17, test_peer());
                socket.send_to(&wrong.encode(), from).await.unwrap();

                let (_, from) = socket.recv_from(&mut buf).await.unwrap();
                let ack = Packet::control(PacketType::Ack, 5, test_peer());
                socket.send_to(&ack.encode(), from).await.unwrap();
            })
        };

        let mut handler = RecordingHandler { seen: Vec::new(), reply: None };
        let data = Packet::new(PacketType::Data, 4, test_peer(), Bytes::from_static(b"abc"));
        let response = sender.send_with_retry(&data, &mut handler).await.unwrap();

        assert_eq!(response.sequence_number, 5);
        assert_eq!(handler.seen.len(), 1);
        assert_eq!(sender.retries(), 1);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_reply_is_sent() {
        let (sender_socket, peer_socket) = bound_pair().await;
        let sender = ReliableSender::new(sender_socket, peer_socket.local_addr().unwrap());

        let peer = {
            let socket = peer_socket.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_PACKET_LEN];
                let (_, from) = socket.recv_from(&mut buf).await.unwrap();
                let ack = Packet::control(PacketType::Data, 1, test_peer());
                socket.send_to(&ack.encode(), from).await.unwrap();

                // the handler's reply must arrive as a separate datagram
                let (len, _) = socket.recv_from(&mut buf).await.unwrap();
                Packet::decode(&buf[..len]).unwrap()
            })
        };

        let mut handler = RecordingHandler {
            seen: Vec::new(),
            reply: Some(Packet::control(PacketType::Ack, 2, test_peer())),
        };
        let syn = Packet::control(PacketType::Syn, 0, test_peer());
        sender.send_with_retry(&syn, &mut handler).await.unwrap();

        let reply = peer.await.unwrap();
        assert_eq!(reply.packet_type, PacketType::Ack);
        assert_eq!(reply.sequence_number, 2);
        assert_eq!(sender.retries(), 0);
    }
}
