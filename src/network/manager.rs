use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::NetworkConfig;
use super::discovery::{self, DiscoveryError, DiscoveryService};
use super::messaging::{MessagingError, MessagingService};
use super::protocol::Protocol;
use super::registry::{PeerInfo, PeerRegistry};
use super::stats::{Counters, SessionStats, SessionStatus, StatsCollector};

/// Capacity of the event channel handed to the host.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("networking is already running; call cleanup() first")]
    AlreadyRunning,
}

/// Everything the engine pushes to the host.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A chat message arrived from a peer.
    MessageReceived {
        timestamp_ms: u64,
        nickname: String,
        ip: IpAddr,
        body: String,
    },
    /// The set of known peers changed (joined, renamed or timed out).
    PeersUpdated(HashMap<IpAddr, PeerInfo>),
    /// Human-readable engine status line.
    SystemLog(String),
}

#[derive(Debug)]
struct EngineState {
    status: SessionStatus,
    local_ip: IpAddr,
    udp_port: u16,
    tcp_port: u16,
    started_at: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
    messaging: Option<Arc<MessagingService>>,
}

impl EngineState {
    fn stopped() -> Self {
        Self {
            status: SessionStatus::Stopped,
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 0,
            tcp_port: 0,
            started_at: None,
            tasks: Vec::new(),
            messaging: None,
        }
    }
}

/// The engine the host talks to. Composes the registry, discovery,
/// messaging and stats components; every operation returns promptly and all
/// asynchronous results surface through the event channel returned by
/// [`NetworkManager::new`].
#[derive(Debug)]
pub struct NetworkManager {
    config: NetworkConfig,
    registry: Arc<PeerRegistry>,
    counters: Arc<Counters>,
    stats: StatsCollector,
    events: mpsc::Sender<NetworkEvent>,
    state: Mutex<EngineState>,
}

impl NetworkManager {
    /// Build an engine instance and the event stream the host consumes.
    pub fn new(config: NetworkConfig) -> (Self, mpsc::Receiver<NetworkEvent>) {
        let (events, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(PeerRegistry::new());
        let counters = Arc::new(Counters::new());
        let stats = StatsCollector::new(Arc::clone(&registry), Arc::clone(&counters));

        let manager = Self {
            config,
            registry,
            counters,
            stats,
            events,
            state: Mutex::new(EngineState::stopped()),
        };
        (manager, event_rx)
    }

    /// Bind both sockets and start the discovery and messaging loops.
    /// All-or-nothing: any bind failure tears down whatever was already
    /// opened, logs the cause through the event stream and returns `false`.
    /// A second call while running is rejected the same way; restart
    /// requires an intervening [`cleanup`](Self::cleanup).
    pub async fn start_networking(&self) -> bool {
        match self.try_start().await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to start networking: {}", e);
                let _ = self
                    .events
                    .send(NetworkEvent::SystemLog(format!(
                        "Failed to start networking: {}",
                        e
                    )))
                    .await;
                false
            }
        }
    }

    async fn try_start(&self) -> Result<(), NetworkError> {
        let mut state = self.state.lock().await;
        if state.status != SessionStatus::Stopped {
            return Err(NetworkError::AlreadyRunning);
        }
        state.status = SessionStatus::Starting;

        // Both sockets must bind before any task spawns.
        let udp_socket = match DiscoveryService::bind(&self.config).await {
            Ok(socket) => socket,
            Err(e) => {
                state.status = SessionStatus::Stopped;
                return Err(e.into());
            }
        };
        let listener = match MessagingService::bind(&self.config).await {
            Ok(listener) => listener,
            Err(e) => {
                // Drop the half-open discovery socket before reporting.
                drop(udp_socket);
                state.status = SessionStatus::Stopped;
                return Err(e.into());
            }
        };

        let local_ip = discovery::resolve_local_ip()
            .await
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let udp_port = udp_socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.udp_port);
        let tcp_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.tcp_port);

        let protocol = Protocol::new(self.config.nickname.clone());
        let discovery = DiscoveryService::new(
            udp_socket,
            protocol.clone(),
            self.config.clone(),
            local_ip,
            tcp_port,
            Arc::clone(&self.registry),
            Arc::clone(&self.counters),
            self.events.clone(),
        );
        let messaging = Arc::new(MessagingService::new(
            protocol,
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.counters),
            self.events.clone(),
        ));

        self.counters.reset();
        let mut tasks = discovery.start();
        tasks.push(messaging.start(listener));

        state.local_ip = local_ip;
        state.udp_port = udp_port;
        state.tcp_port = tcp_port;
        state.started_at = Some(Instant::now());
        state.tasks = tasks;
        state.messaging = Some(messaging);
        state.status = SessionStatus::Running;

        info!(
            "networking started as {} on {} (udp {}, tcp {})",
            self.config.nickname, local_ip, udp_port, tcp_port
        );
        let _ = self
            .events
            .send(NetworkEvent::SystemLog(format!(
                "Networking started as {} on {} (udp {}, tcp {})",
                self.config.nickname, local_ip, udp_port, tcp_port
            )))
            .await;
        Ok(())
    }

    /// Evict peers that stayed silent past the configured timeout. Invoked
    /// by the host on its own cadence; re-emits the peer list only when the
    /// set actually changed.
    pub async fn check_inactive_peers(&self) {
        let removed = self
            .registry
            .prune(Instant::now(), self.config.peer_timeout)
            .await;
        if removed.is_empty() {
            return;
        }

        for (ip, nickname) in &removed {
            info!("peer {} ({}) timed out", nickname, ip);
            let _ = self
                .events
                .send(NetworkEvent::SystemLog(format!(
                    "Peer left: {} ({})",
                    nickname, ip
                )))
                .await;
        }
        let _ = self
            .events
            .send(NetworkEvent::PeersUpdated(self.registry.snapshot().await))
            .await;
    }

    /// Send a message to each of the selected peers. `messages_sent` grows
    /// by the number of distinct destinations attempted in this call,
    /// reachable or not; delivery itself proceeds in the background.
    pub async fn send_message_to_selected_peers(&self, peer_ips: &[IpAddr], body: &str) {
        let messaging = self.state.lock().await.messaging.clone();
        let Some(messaging) = messaging else {
            let _ = self
                .events
                .send(NetworkEvent::SystemLog(
                    "Cannot send: networking is not running".to_string(),
                ))
                .await;
            return;
        };

        let attempted = messaging.send_to_peers(peer_ips, body).await;
        self.counters
            .messages_sent
            .fetch_add(attempted as u64, Ordering::Relaxed);
    }

    /// Point-in-time statistics, assembled fresh on every call.
    pub async fn get_stats(&self) -> SessionStats {
        let state = self.state.lock().await;
        self.stats
            .collect(
                state.status,
                state.local_ip,
                state.udp_port,
                state.tcp_port,
                state.started_at,
            )
            .await
    }

    /// Read-only copy of the current peer set.
    pub async fn peers(&self) -> HashMap<IpAddr, PeerInfo> {
        self.registry.snapshot().await
    }

    /// Stop every task and close the sockets and all peer connections.
    /// Aborting the accept/receive tasks closes the sockets they own, so
    /// nothing waits for peers to disconnect voluntarily. Idempotent.
    pub async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        if state.status == SessionStatus::Stopped && state.tasks.is_empty() {
            return;
        }

        for task in state.tasks.drain(..) {
            task.abort();
        }
        if let Some(messaging) = state.messaging.take() {
            messaging.shutdown().await;
        }
        self.registry.clear().await;

        state.started_at = None;
        state.status = SessionStatus::Stopped;

        info!("networking stopped");
        let _ = self
            .events
            .send(NetworkEvent::SystemLog("Networking stopped".to_string()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_config(nickname: &str) -> NetworkConfig {
        NetworkConfig {
            nickname: nickname.to_string(),
            udp_port: 0,
            tcp_port: 0,
            ..NetworkConfig::default()
        }
    }

    async fn wait_for<T>(
        events: &mut mpsc::Receiver<NetworkEvent>,
        mut pick: impl FnMut(NetworkEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if let Some(value) = pick(event) {
                    return value;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn start_and_cleanup_are_idempotent() {
        let (manager, _events) = NetworkManager::new(test_config("alice"));

        assert!(manager.start_networking().await);
        let stats = manager.get_stats().await;
        assert_eq!(stats.status, SessionStatus::Running);
        assert_ne!(stats.tcp_port, 0);
        assert_ne!(stats.udp_port, 0);

        manager.cleanup().await;
        manager.cleanup().await;
        assert_eq!(manager.get_stats().await.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_rejected_until_cleanup() {
        let (manager, _events) = NetworkManager::new(test_config("alice"));

        assert!(manager.start_networking().await);
        assert!(!manager.start_networking().await);

        manager.cleanup().await;
        assert!(manager.start_networking().await);
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn bind_failure_is_all_or_nothing() {
        // Occupy a TCP port, then ask an engine to use it: the start must
        // fail as a whole and leave the engine stopped.
        let occupied = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let config = NetworkConfig {
            tcp_port: occupied.local_addr().unwrap().port(),
            ..test_config("alice")
        };

        let (manager, mut events) = NetworkManager::new(config);
        assert!(!manager.start_networking().await);
        assert_eq!(manager.get_stats().await.status, SessionStatus::Stopped);

        let log = wait_for(&mut events, |e| match e {
            NetworkEvent::SystemLog(msg) if msg.contains("Failed to start") => Some(msg),
            _ => None,
        })
        .await;
        assert!(log.contains("bind"));
    }

    #[tokio::test]
    async fn send_isolates_unreachable_destinations() {
        let (alice, mut alice_events) = NetworkManager::new(test_config("alice"));
        let (bob, mut bob_events) = NetworkManager::new(test_config("bob"));
        assert!(alice.start_networking().await);
        assert!(bob.start_networking().await);

        let bob_ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        let bob_port = bob.get_stats().await.tcp_port;

        // A port nothing listens on: bind, note the address, drop.
        let dead = TcpListener::bind("127.0.0.2:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let dead_ip = dead_addr.ip();

        // Seed alice's registry as if both peers had announced.
        alice
            .registry
            .upsert(bob_ip, "bob", Some(bob_port), Instant::now())
            .await;
        alice
            .registry
            .upsert(dead_ip, "ghost", Some(dead_addr.port()), Instant::now())
            .await;

        let body = "hej från test\nsecond line \u{1f980}";
        alice
            .send_message_to_selected_peers(&[bob_ip, dead_ip, bob_ip], body)
            .await;

        // Per-destination convention: two distinct destinations attempted.
        assert_eq!(alice.get_stats().await.messages_sent, 2);

        // The reachable peer gets the body byte for byte, attributed to
        // alice by nickname and connection address.
        let (nickname, ip, received) = wait_for(&mut bob_events, |e| match e {
            NetworkEvent::MessageReceived {
                nickname, ip, body, ..
            } => Some((nickname, ip, body)),
            _ => None,
        })
        .await;
        assert_eq!(nickname, "alice");
        assert_eq!(ip, bob_ip);
        assert_eq!(received, body);
        assert_eq!(bob.get_stats().await.messages_received, 1);

        // The unreachable peer is named in a system log on alice's side and
        // stays in her registry; only the inactivity sweep may evict it.
        let log = wait_for(&mut alice_events, |e| match e {
            NetworkEvent::SystemLog(msg) if msg.contains(&dead_ip.to_string()) => Some(msg),
            _ => None,
        })
        .await;
        assert!(log.contains("Could not deliver"));
        assert!(alice.peers().await.contains_key(&dead_ip));

        alice.cleanup().await;
        bob.cleanup().await;
    }

    #[tokio::test]
    async fn connection_is_reused_across_sends() {
        let (alice, _alice_events) = NetworkManager::new(test_config("alice"));
        let (bob, mut bob_events) = NetworkManager::new(test_config("bob"));
        assert!(alice.start_networking().await);
        assert!(bob.start_networking().await);

        let bob_ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        let bob_port = bob.get_stats().await.tcp_port;
        alice
            .registry
            .upsert(bob_ip, "bob", Some(bob_port), Instant::now())
            .await;

        alice.send_message_to_selected_peers(&[bob_ip], "one").await;
        wait_for(&mut bob_events, |e| match e {
            NetworkEvent::MessageReceived { body, .. } if body == "one" => Some(()),
            _ => None,
        })
        .await;

        // The first delivery attached a send channel to the registry entry;
        // the second message must travel through it, in order.
        let (sender, _) = alice.registry.route(bob_ip).await;
        assert!(sender.is_some());

        alice.send_message_to_selected_peers(&[bob_ip], "two").await;
        wait_for(&mut bob_events, |e| match e {
            NetworkEvent::MessageReceived { body, .. } if body == "two" => Some(()),
            _ => None,
        })
        .await;
        assert_eq!(bob.get_stats().await.messages_received, 2);

        alice.cleanup().await;
        bob.cleanup().await;
    }

    #[tokio::test]
    async fn prune_never_decrements_discovered_counter() {
        // A zero timeout makes any real silence long enough to evict.
        let config = NetworkConfig {
            peer_timeout: Duration::ZERO,
            ..test_config("carol")
        };
        let (manager, _events) = NetworkManager::new(config);

        manager
            .registry
            .upsert("10.0.0.1".parse().unwrap(), "ghost", Some(45678), Instant::now())
            .await;
        manager.counters.peers_discovered.fetch_add(1, Ordering::Relaxed);

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.check_inactive_peers().await;

        assert!(manager.peers().await.is_empty());
        assert_eq!(manager.get_stats().await.peers_discovered, 1);
    }
}
