use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::NetworkConfig;
use super::manager::NetworkEvent;
use super::protocol::{Envelope, Payload, Protocol};
use super::registry::{PeerRegistry, Upsert};
use super::stats::Counters;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Periodic presence broadcasts plus the listener that turns peers'
/// announces into registry entries.
#[derive(Debug)]
pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    protocol: Protocol,
    config: NetworkConfig,
    local_ip: IpAddr,
    /// Actual bound messaging port, advertised in every announce.
    tcp_port: u16,
    registry: Arc<PeerRegistry>,
    counters: Arc<Counters>,
    events: mpsc::Sender<NetworkEvent>,
}

impl DiscoveryService {
    /// Bind the discovery socket with broadcast enabled. A failure here is
    /// fatal to start-up only; the caller surfaces it and stays stopped.
    pub async fn bind(config: &NetworkConfig) -> Result<Arc<UdpSocket>, DiscoveryError> {
        let addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), config.udp_port);

        debug!("binding discovery socket to {}", addr);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                port: config.udp_port,
                source,
            })?;
        socket.set_broadcast(true)?;
        info!("discovery socket bound to {}", socket.local_addr()?);

        Ok(Arc::new(socket))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        protocol: Protocol,
        config: NetworkConfig,
        local_ip: IpAddr,
        tcp_port: u16,
        registry: Arc<PeerRegistry>,
        counters: Arc<Counters>,
        events: mpsc::Sender<NetworkEvent>,
    ) -> Self {
        Self {
            socket,
            protocol,
            config,
            local_ip,
            tcp_port,
            registry,
            counters,
            events,
        }
    }

    /// Start the announce and receive loops. The returned handles are the
    /// only way to stop them; aborting closes the socket.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        vec![self.spawn_announce_loop(), self.spawn_recv_loop()]
    }

    fn spawn_announce_loop(&self) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let protocol = self.protocol.clone();
        let cadence = self.config.broadcast_interval;
        let local_ip = self.local_ip;
        let tcp_port = self.tcp_port;
        // Announce to the configured discovery port; fall back to the bound
        // port when the configuration asked for an ephemeral one.
        let announce_port = match self.config.udp_port {
            0 => self.socket.local_addr().map(|a| a.port()).unwrap_or(0),
            port => port,
        };

        tokio::spawn(async move {
            let mut interval = time::interval(cadence);

            loop {
                interval.tick().await;

                let data = match protocol.announce(tcp_port).encode() {
                    Ok(data) => data,
                    Err(e) => {
                        error!("failed to encode announce: {}", e);
                        continue;
                    }
                };

                let dest = broadcast_addr(local_ip, announce_port);
                if let Err(e) = socket.send_to(&data, dest).await {
                    // Subnet broadcast can fail on odd interface setups; the
                    // global broadcast address is the fallback.
                    let fallback =
                        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), announce_port);
                    if let Err(e2) = socket.send_to(&data, fallback).await {
                        warn!("announce to {} failed: {} (fallback: {})", dest, e, e2);
                    }
                } else {
                    debug!("announced to {}", dest);
                }
            }
        })
    }

    fn spawn_recv_loop(&self) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let registry = Arc::clone(&self.registry);
        let counters = Arc::clone(&self.counters);
        let events = self.events.clone();
        let local_ip = self.local_ip;

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];

            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("discovery receive failed: {}", e);
                        continue;
                    }
                };

                let Some((nickname, tcp_port)) = parse_announce(&buf[..len], src, local_ip)
                else {
                    continue;
                };

                let outcome = registry
                    .upsert(src.ip(), &nickname, Some(tcp_port), Instant::now())
                    .await;

                match outcome {
                    Upsert::New => {
                        counters.peers_discovered.fetch_add(1, Ordering::Relaxed);
                        info!("discovered peer {} at {}", nickname, src.ip());
                        let _ = events
                            .send(NetworkEvent::SystemLog(format!(
                                "Peer joined: {} ({})",
                                nickname,
                                src.ip()
                            )))
                            .await;
                        let _ = events
                            .send(NetworkEvent::PeersUpdated(registry.snapshot().await))
                            .await;
                    }
                    Upsert::Renamed => {
                        let _ = events
                            .send(NetworkEvent::PeersUpdated(registry.snapshot().await))
                            .await;
                    }
                    Upsert::Refreshed => {}
                }
            }
        })
    }
}

/// Decode an announce datagram, discarding self-originated and malformed
/// input. Returns the advertised nickname and messaging port.
fn parse_announce(data: &[u8], src: SocketAddr, local_ip: IpAddr) -> Option<(String, u16)> {
    if src.ip() == local_ip {
        return None;
    }

    match Envelope::decode(data) {
        Ok(Envelope {
            payload: Payload::Announce { nickname, tcp_port },
            ..
        }) => Some((nickname, tcp_port)),
        Ok(envelope) => {
            debug!(
                "ignoring non-announce datagram from {}: {:?}",
                src, envelope.payload
            );
            None
        }
        Err(e) => {
            debug!("dropping malformed datagram from {}: {}", src, e);
            None
        }
    }
}

/// Subnet broadcast address for the local IP (last octet 255); the global
/// broadcast address when the local address is not a routable IPv4 one.
fn broadcast_addr(local_ip: IpAddr, port: u16) -> SocketAddr {
    match local_ip {
        IpAddr::V4(ip) if !ip.is_loopback() => {
            let octets = ip.octets();
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], 255)),
                port,
            )
        }
        _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
    }
}

/// Best-effort local address resolution: a connected UDP socket reveals the
/// interface the OS would route external traffic through. No packets are
/// actually sent.
pub(crate) async fn resolve_local_ip() -> std::io::Result<IpAddr> {
    let probe = UdpSocket::bind(("0.0.0.0", 0)).await?;
    probe.connect(("8.8.8.8", 80)).await?;
    Ok(probe.local_addr()?.ip())
}
