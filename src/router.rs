//! The network emulator: a UDP relay that models an unreliable link.
//!
//! Every datagram is either dropped (probability `drop_rate`) or forwarded
//! after a uniformly drawn delay in `[0, max_delay]`. Forwarding rewrites
//! the packet header's peer address to the *observed* UDP sender, so each
//! side only ever addresses the other by what the router tells it - peers
//! never need each other's real address. Deliveries with a non-zero delay
//! run as independent tasks and freely overtake each other; the protocol
//! has to cope with the resulting reordering and duplication on its own.

use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, trace, warn};

use crate::transport::packet::{PacketType, HEADER_LEN};

/// Handle to the "a FIN has gone towards the router" flag. The server role
/// sets it when its response stream ends; the router then closes its socket
/// after forwarding that FIN. Models an experiment ending, not a protocol
/// rule.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        ShutdownSignal::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub bind_addr: SocketAddr,
    /// probability in [0, 1] that a packet is silently discarded
    pub drop_rate: f64,
    /// upper bound of the uniformly drawn per-packet delivery delay
    pub max_delay: Duration,
    /// RNG seed for reproducible runs; defaults to the current time
    pub seed: Option<u64>,
}

impl RouterConfig {
    pub fn new(bind_addr: SocketAddr) -> RouterConfig {
        RouterConfig {
            bind_addr,
            drop_rate: 0.0,
            max_delay: Duration::ZERO,
            seed: None,
        }
    }
}

pub struct Router {
    config: RouterConfig,
    socket: Arc<UdpSocket>,
    /// packets accepted but not yet delivered; observability only
    queue_depth: Arc<AtomicUsize>,
    shutdown: ShutdownSignal,
    cancel_sender: broadcast::Sender<()>,
}

impl Router {
    pub async fn bind(config: RouterConfig) -> anyhow::Result<Router> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let (cancel_sender, _) = broadcast::channel(1);
        Ok(Router {
            config,
            socket,
            queue_depth: Arc::new(AtomicUsize::new(0)),
            shutdown: ShutdownSignal::new(),
            cancel_sender,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// The flag the server role sets when its response stream's FIN departs.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Relay loop. Returns normally once a FIN is delivered with the
    /// shutdown flag set, or with an error if the socket fails.
    pub async fn run(&self) -> anyhow::Result<()> {
        let seed = self.config.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64
        });
        let mut rng = StdRng::seed_from_u64(seed);

        info!(
            drop_rate = self.config.drop_rate,
            max_delay_ms = self.config.max_delay.as_millis() as u64,
            seed,
            "router listening at {}",
            self.local_addr()?
        );

        let mut cancel_receiver = self.cancel_sender.subscribe();
        let mut buf = [0u8; 2048];

        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => self.process(&buf[..len], from, &mut rng).await,
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => {
                    info!("final FIN delivered - closing router socket");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn process(&self, data: &[u8], from: SocketAddr, rng: &mut StdRng) {
        let Some(packet) = ForwardedPacket::parse(data, from) else {
            trace!(len = data.len(), %from, "not a packet - ignoring");
            return;
        };

        if rng.gen::<f64>() < self.config.drop_rate {
            info!(queue = self.queue_depth(), "packet {:?} is dropped", packet);
            return;
        }

        self.queue_depth.fetch_add(1, Ordering::Relaxed);

        if self.config.max_delay.is_zero() {
            self.deliver(packet).await;
            return;
        }

        let delay = Duration::from_millis(rng.gen_range(0..=self.config.max_delay.as_millis() as u64));
        info!(
            queue = self.queue_depth(),
            "packet {:?} is delayed for {} ms",
            packet,
            delay.as_millis()
        );

        let socket = self.socket.clone();
        let queue_depth = self.queue_depth.clone();
        let shutdown = self.shutdown.clone();
        let cancel_sender = self.cancel_sender.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            deliver(&socket, &queue_depth, &shutdown, &cancel_sender, packet).await;
        });
    }

    async fn deliver(&self, packet: ForwardedPacket) {
        deliver(
            &self.socket,
            &self.queue_depth,
            &self.shutdown,
            &self.cancel_sender,
            packet,
        )
        .await;
    }
}

async fn deliver(
    socket: &UdpSocket,
    queue_depth: &AtomicUsize,
    shutdown: &ShutdownSignal,
    cancel_sender: &broadcast::Sender<()>,
    packet: ForwardedPacket,
) {
    let result = socket.send_to(&packet.bytes, packet.dest).await;
    queue_depth.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok(_) => {
            info!(
                queue = queue_depth.load(Ordering::Relaxed),
                "packet {:?} is delivered", packet
            );
            if packet.is_fin() && shutdown.is_set() {
                // receivers may be gone already, so the error is irrelevant
                let _ = cancel_sender.send(());
            }
        }
        Err(e) => {
            // the router never retries - that is entirely the senders' job
            warn!("failed to deliver {:?}: {}", packet, e);
        }
    }
}

/// The router's view of a datagram: just the routing fields off the raw
/// header, plus the bytes to forward with the peer address rewritten to the
/// observed sender. Deliberately not the full [`crate::transport::packet::Packet`] -
/// the payload passes through untouched.
struct ForwardedPacket {
    packet_type: u8,
    sequence_number: u32,
    from: SocketAddr,
    dest: SocketAddr,
    bytes: Vec<u8>,
}

impl ForwardedPacket {
    fn parse(data: &[u8], from: SocketAddr) -> Option<ForwardedPacket> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let packet_type = data[0];
        let sequence_number = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let ip = std::net::Ipv4Addr::new(data[5], data[6], data[7], data[8]);
        let port = u16::from_be_bytes([data[9], data[10]]);

        // a loopback destination means "whoever is on the same host" - let
        // peers address each other generically
        let dest_ip = if ip.is_loopback() {
            from.ip()
        } else {
            IpAddr::V4(ip)
        };

        let mut bytes = data.to_vec();
        match from {
            SocketAddr::V4(from_v4) => {
                bytes[5..9].copy_from_slice(&from_v4.ip().octets());
                bytes[9..11].copy_from_slice(&from_v4.port().to_be_bytes());
            }
            SocketAddr::V6(_) => {
                // the header only holds IPv4; leave the declared address as
                // the reply-to in this (unsupported) case
                warn!(%from, "IPv6 sender, cannot rewrite reply address");
            }
        }

        Some(ForwardedPacket {
            packet_type,
            sequence_number,
            from,
            dest: SocketAddr::new(dest_ip, port),
            bytes,
        })
    }

    fn is_fin(&self) -> bool {
        self.packet_type == PacketType::Fin as u8
    }
}

impl Debug for ForwardedPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} type={} {} -> {} sz={}",
            self.sequence_number,
            self.packet_type,
            self.from,
            self.dest,
            self.bytes.len() - HEADER_LEN
        )
    }
}
