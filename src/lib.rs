//! Serverless LAN chat engine: peers find each other with UDP broadcast
//! announces, exchange framed text messages over per-peer TCP connections
//! and are evicted from the registry after a configurable silence.
//!
//! The host constructs a [`network::NetworkManager`], consumes the event
//! stream it returns and drives the inactivity sweep on its own cadence;
//! everything else runs on tokio tasks inside the engine.
//!
//! Known limitations, by design: announces and messages are neither
//! authenticated nor encrypted, so any host on the broadcast domain can
//! claim an arbitrary nickname or inject messages, and the same nickname
//! may legitimately appear on several IPs at once.

pub mod network;
pub mod utils;

pub use network::{NetworkConfig, NetworkEvent, NetworkManager, SessionStats, SessionStatus};
