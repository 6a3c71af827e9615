mod discovery;
mod manager;
mod messaging;
mod protocol;
mod registry;
mod stats;

pub use discovery::{DiscoveryError, DiscoveryService};
pub use manager::{NetworkError, NetworkEvent, NetworkManager};
pub use messaging::{MessagingError, MessagingService};
pub use protocol::{ChatCodec, Envelope, PROTOCOL_VERSION, Payload, Protocol, ProtocolError};
pub use registry::{Peer, PeerInfo, PeerRegistry, Upsert};
pub use stats::{Counters, SessionStats, SessionStatus, StatsCollector};

use std::time::Duration;

/// Configuration for the network engine.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Nickname announced to the network
    pub nickname: String,
    /// UDP discovery port; 0 binds an ephemeral port
    pub udp_port: u16,
    /// TCP messaging port; 0 binds an ephemeral port
    pub tcp_port: u16,
    /// Cadence of presence announcements; keep it well under
    /// `peer_timeout` so several announces land within one timeout window
    pub broadcast_interval: Duration,
    /// Silence after which a peer is considered departed
    pub peer_timeout: Duration,
    /// Cadence at which the host should drive `check_inactive_peers`
    pub sweep_interval: Duration,
    /// Upper bound on outbound connection establishment
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            udp_port: 45679,
            tcp_port: 45678,
            broadcast_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}
