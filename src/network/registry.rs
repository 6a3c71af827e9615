use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::protocol::Envelope;

/// A peer known to the registry.
#[derive(Debug)]
pub struct Peer {
    pub nickname: String,
    /// Messaging port the peer advertised; unknown until its first announce.
    pub tcp_port: Option<u16>,
    pub last_seen: Instant,
    /// Send handle of an established outbound connection, if any.
    pub sender: Option<mpsc::Sender<Envelope>>,
}

/// Read-only peer view handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub nickname: String,
}

/// Outcome of a registry upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First sighting of this IP.
    New,
    /// Known peer announcing a different nickname.
    Renamed,
    /// Known peer, liveness refreshed.
    Refreshed,
}

/// Authoritative map of known peers, one entry per IP. All mutation goes
/// through a single lock so the discovery receiver, the messaging receiver,
/// the send path and the inactivity sweep never interleave.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<IpAddr, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. `last_seen` only ever moves forward, and
    /// `tcp_port` is overwritten only when the caller actually knows it
    /// (announces do, inbound messages don't).
    pub async fn upsert(
        &self,
        ip: IpAddr,
        nickname: &str,
        tcp_port: Option<u16>,
        now: Instant,
    ) -> Upsert {
        let mut peers = self.peers.lock().await;

        match peers.get_mut(&ip) {
            Some(peer) => {
                if let Some(port) = tcp_port {
                    peer.tcp_port = Some(port);
                }
                if now > peer.last_seen {
                    peer.last_seen = now;
                }
                if peer.nickname != nickname {
                    debug!("peer {} renamed {} -> {}", ip, peer.nickname, nickname);
                    peer.nickname = nickname.to_string();
                    Upsert::Renamed
                } else {
                    Upsert::Refreshed
                }
            }
            None => {
                peers.insert(
                    ip,
                    Peer {
                        nickname: nickname.to_string(),
                        tcp_port,
                        last_seen: now,
                        sender: None,
                    },
                );
                Upsert::New
            }
        }
    }

    /// Evict peers silent for longer than `timeout`, returning what was
    /// removed. Exact and idempotent: a second call with no intervening
    /// activity removes nothing further.
    pub async fn prune(&self, now: Instant, timeout: Duration) -> Vec<(IpAddr, String)> {
        let mut peers = self.peers.lock().await;

        let expired: Vec<IpAddr> = peers
            .iter()
            .filter(|(_, peer)| now.duration_since(peer.last_seen) > timeout)
            .map(|(ip, _)| *ip)
            .collect();

        expired
            .into_iter()
            .filter_map(|ip| peers.remove(&ip).map(|peer| (ip, peer.nickname)))
            .collect()
    }

    /// Current send handle (if still alive) and advertised TCP port for a
    /// destination. A handle whose writer has exited is dropped here so the
    /// next send redials.
    pub async fn route(&self, ip: IpAddr) -> (Option<mpsc::Sender<Envelope>>, Option<u16>) {
        let mut peers = self.peers.lock().await;

        match peers.get_mut(&ip) {
            Some(peer) => {
                if peer.sender.as_ref().is_some_and(|tx| tx.is_closed()) {
                    peer.sender = None;
                }
                (peer.sender.clone(), peer.tcp_port)
            }
            None => (None, None),
        }
    }

    /// Remember the send handle of a freshly established outbound connection
    /// so later sends reuse it.
    pub async fn attach_sender(&self, ip: IpAddr, sender: mpsc::Sender<Envelope>) {
        if let Some(peer) = self.peers.lock().await.get_mut(&ip) {
            peer.sender = Some(sender);
        }
    }

    /// Forget a dead send handle so the next send redials.
    pub async fn clear_sender(&self, ip: IpAddr) {
        if let Some(peer) = self.peers.lock().await.get_mut(&ip) {
            peer.sender = None;
        }
    }

    /// Read-only copy for reporting; never exposes the live map.
    pub async fn snapshot(&self) -> HashMap<IpAddr, PeerInfo> {
        self.peers
            .lock()
            .await
            .iter()
            .map(|(ip, peer)| {
                (
                    *ip,
                    PeerInfo {
                        nickname: peer.nickname.clone(),
                    },
                )
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Drop every peer together with its connection handle.
    pub async fn clear(&self) {
        self.peers.lock().await.clear();
    }
}
