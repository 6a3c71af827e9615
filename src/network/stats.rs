use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::registry::PeerRegistry;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Stopped => write!(f, "Stopped"),
            SessionStatus::Starting => write!(f, "Starting"),
            SessionStatus::Running => write!(f, "Running"),
        }
    }
}

/// Monotonic counters shared by the discovery and messaging paths. Eviction
/// of a timed-out peer never decrements `peers_discovered`.
#[derive(Debug, Default)]
pub struct Counters {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub peers_discovered: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero everything at the start of a fresh session.
    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.peers_discovered.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time session statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub status: SessionStatus,
    pub local_ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub peers_discovered: u64,
    /// Peers currently in the registry (unlike `peers_discovered`, this one
    /// shrinks when the inactivity sweep evicts someone).
    pub active_peers: usize,
    pub session_started_at: Option<Instant>,
    pub session_duration: Duration,
}

/// Derives statistics fresh on every call; nothing here is cached.
#[derive(Debug)]
pub struct StatsCollector {
    registry: Arc<PeerRegistry>,
    counters: Arc<Counters>,
}

impl StatsCollector {
    pub fn new(registry: Arc<PeerRegistry>, counters: Arc<Counters>) -> Self {
        Self { registry, counters }
    }

    pub async fn collect(
        &self,
        status: SessionStatus,
        local_ip: IpAddr,
        udp_port: u16,
        tcp_port: u16,
        started_at: Option<Instant>,
    ) -> SessionStats {
        SessionStats {
            status,
            local_ip,
            udp_port,
            tcp_port,
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            peers_discovered: self.counters.peers_discovered.load(Ordering::Relaxed),
            active_peers: self.registry.len().await,
            session_started_at: started_at,
            session_duration: started_at.map(|t| t.elapsed()).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn collector() -> StatsCollector {
        StatsCollector::new(Arc::new(PeerRegistry::new()), Arc::new(Counters::new()))
    }

    #[tokio::test]
    async fn session_duration_strictly_increases() {
        let collector = collector();
        let local: IpAddr = Ipv4Addr::LOCALHOST.into();
        let started = Some(Instant::now());

        let first = collector
            .collect(SessionStatus::Running, local, 1, 2, started)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = collector
            .collect(SessionStatus::Running, local, 1, 2, started)
            .await;

        assert!(second.session_duration > first.session_duration);
    }

    #[tokio::test]
    async fn collect_reads_counters_fresh() {
        let collector = collector();
        let local: IpAddr = Ipv4Addr::LOCALHOST.into();

        let before = collector
            .collect(SessionStatus::Running, local, 1, 2, None)
            .await;
        assert_eq!(before.messages_sent, 0);
        assert_eq!(before.session_duration, Duration::ZERO);

        collector.counters.messages_sent.fetch_add(3, Ordering::Relaxed);
        collector
            .counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let after = collector
            .collect(SessionStatus::Running, local, 1, 2, None)
            .await;
        assert_eq!(after.messages_sent, 3);
        assert_eq!(after.messages_received, 1);
    }
}
