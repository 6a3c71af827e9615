use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use super::NetworkConfig;
use super::manager::NetworkEvent;
use super::protocol::{ChatCodec, Envelope, Payload, Protocol, ProtocolError};
use super::registry::{PeerRegistry, Upsert};
use super::stats::Counters;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to bind messaging listener on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("connection to {addr} timed out")]
    ConnectTimeout { addr: SocketAddr },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reliable message delivery: a TCP listener for inbound chat frames and a
/// per-peer outbound connection pool. One failing destination never affects
/// the others, and a failed send never evicts a peer from the registry --
/// eviction belongs to the inactivity sweep alone.
#[derive(Debug)]
pub struct MessagingService {
    protocol: Protocol,
    config: NetworkConfig,
    registry: Arc<PeerRegistry>,
    counters: Arc<Counters>,
    events: mpsc::Sender<NetworkEvent>,
    /// Reader and writer tasks spawned for individual connections, aborted
    /// together on shutdown.
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MessagingService {
    /// Bind the messaging listener. Fatal to start-up on failure, same
    /// all-or-nothing contract as the discovery socket.
    pub async fn bind(config: &NetworkConfig) -> Result<TcpListener, MessagingError> {
        let addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), config.tcp_port);

        debug!("binding messaging listener to {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MessagingError::Bind {
                port: config.tcp_port,
                source,
            })?;
        info!("messaging listener bound to {}", listener.local_addr()?);

        Ok(listener)
    }

    pub fn new(
        protocol: Protocol,
        config: NetworkConfig,
        registry: Arc<PeerRegistry>,
        counters: Arc<Counters>,
        events: mpsc::Sender<NetworkEvent>,
    ) -> Self {
        Self {
            protocol,
            config,
            registry,
            counters,
            events,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start accepting inbound connections on the bound listener.
    pub fn start(&self, listener: TcpListener) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let counters = Arc::clone(&self.counters);
        let events = self.events.clone();
        let tasks = Arc::clone(&self.tasks);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {}", addr);
                        let reader = tokio::spawn(read_connection(
                            stream,
                            addr,
                            Arc::clone(&registry),
                            Arc::clone(&counters),
                            events.clone(),
                        ));
                        tasks.lock().await.push(reader);
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                    }
                }
            }
        })
    }

    /// Fan a message out to the selected peers. Destinations are
    /// deduplicated; the return value is how many distinct destinations were
    /// attempted. Each delivery proceeds independently of the others.
    pub async fn send_to_peers(&self, peer_ips: &[IpAddr], body: &str) -> usize {
        let mut seen = HashSet::new();
        let targets: Vec<IpAddr> = peer_ips
            .iter()
            .copied()
            .filter(|ip| seen.insert(*ip))
            .collect();

        for ip in &targets {
            self.dispatch(*ip, self.protocol.chat(body)).await;
        }

        targets.len()
    }

    /// Route one envelope to one destination: reuse the peer's live send
    /// channel when there is one, otherwise dial in a background task so a
    /// slow or dead peer cannot stall the caller.
    async fn dispatch(&self, ip: IpAddr, envelope: Envelope) {
        let (sender, advertised_port) = self.registry.route(ip).await;

        let envelope = match sender {
            Some(tx) => match tx.try_send(envelope) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    report_undelivered(&self.events, ip, "send queue full").await;
                    return;
                }
                Err(TrySendError::Closed(envelope)) => {
                    self.registry.clear_sender(ip).await;
                    envelope
                }
            },
            None => envelope,
        };

        let addr = SocketAddr::new(ip, advertised_port.unwrap_or(self.config.tcp_port));
        let connect_timeout = self.config.connect_timeout;
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let tasks = Arc::clone(&self.tasks);

        let dial = tokio::spawn(async move {
            match open_connection(addr, connect_timeout, &registry, &tasks).await {
                Ok(tx) => {
                    if tx.send(envelope).await.is_err() {
                        report_undelivered(&events, ip, "connection closed before delivery")
                            .await;
                    }
                }
                Err(e) => report_undelivered(&events, ip, &e.to_string()).await,
            }
        });
        self.tasks.lock().await.push(dial);
    }

    /// Abort every connection task this service spawned.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Read framed chat messages from one inbound connection until it closes or
/// produces a malformed frame. Sender identity comes from the connection's
/// peer address, never from the frame.
async fn read_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    counters: Arc<Counters>,
    events: mpsc::Sender<NetworkEvent>,
) {
    let mut frames = FramedRead::new(stream, ChatCodec);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Envelope {
                payload:
                    Payload::Chat {
                        timestamp_ms,
                        nickname,
                        body,
                    },
                ..
            }) => {
                let ip = addr.ip();
                let outcome = registry.upsert(ip, &nickname, None, Instant::now()).await;

                counters.messages_received.fetch_add(1, Ordering::Relaxed);
                let _ = events
                    .send(NetworkEvent::MessageReceived {
                        timestamp_ms,
                        nickname: nickname.clone(),
                        ip,
                        body,
                    })
                    .await;

                match outcome {
                    Upsert::New => {
                        counters.peers_discovered.fetch_add(1, Ordering::Relaxed);
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
            Ok(other) => {
                debug!("ignoring non-chat frame from {}: {:?}", addr, other.payload);
            }
            Err(e) => {
                // Malformed input poisons only this connection; the listener
                // keeps serving the rest.
                warn!("dropping connection from {}: {}", addr, e);
                break;
            }
        }
    }

    debug!("connection from {} closed", addr);
}

/// Dial a destination within the configured timeout and hand its socket to a
/// dedicated writer task. The returned channel is also attached to the
/// registry entry so later sends reuse the connection.
async fn open_connection(
    addr: SocketAddr,
    connect_timeout: Duration,
    registry: &PeerRegistry,
    tasks: &Mutex<Vec<JoinHandle<()>>>,
) -> Result<mpsc::Sender<Envelope>, MessagingError> {
    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(MessagingError::Connect { addr, source }),
        Err(_) => return Err(MessagingError::ConnectTimeout { addr }),
    };
    debug!("connected to {}", addr);

    let (tx, mut rx) = mpsc::channel::<Envelope>(64);

    let writer = tokio::spawn(async move {
        let mut framed = FramedWrite::new(stream, ChatCodec);
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = framed.send(envelope).await {
                warn!("send to {} failed: {}", addr, e);
                break;
            }
        }
        debug!("writer for {} exited", addr);
    });
    tasks.lock().await.push(writer);

    registry.attach_sender(addr.ip(), tx.clone()).await;
    Ok(tx)
}

async fn report_undelivered(events: &mpsc::Sender<NetworkEvent>, ip: IpAddr, reason: &str) {
    warn!("peer {} unreachable: {}", ip, reason);
    let _ = events
        .send(NetworkEvent::SystemLog(format!(
            "Could not deliver to {}: {}",
            ip, reason
        )))
        .await;
}
