use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

use lanchat::network::{NetworkConfig, NetworkEvent, NetworkManager};
use lanchat::utils::setup_logging;

/// Serverless LAN chat: discover peers via UDP broadcast, chat over TCP.
#[derive(Debug, Parser)]
#[command(name = "lanchat", version)]
struct Args {
    /// Nickname announced to the network
    #[arg(short, long, default_value = "anonymous")]
    nickname: String,

    /// UDP discovery port
    #[arg(long, default_value_t = 45679)]
    udp_port: u16,

    /// TCP messaging port
    #[arg(long, default_value_t = 45678)]
    tcp_port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    setup_logging(level).map_err(|e| anyhow::anyhow!("logging setup failed: {}", e))?;

    let config = NetworkConfig {
        nickname: args.nickname,
        udp_port: args.udp_port,
        tcp_port: args.tcp_port,
        ..NetworkConfig::default()
    };
    let sweep_interval = config.sweep_interval;

    let (manager, mut events) = NetworkManager::new(config);
    let manager = Arc::new(manager);

    if !manager.start_networking().await {
        anyhow::bail!("could not start networking; are the ports free?");
    }

    // Render engine events to the terminal.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NetworkEvent::MessageReceived {
                    nickname, ip, body, ..
                } => {
                    println!("[{}@{}] {}", nickname, ip, body);
                }
                NetworkEvent::PeersUpdated(peers) => {
                    let mut names: Vec<String> = peers
                        .iter()
                        .map(|(ip, info)| format!("{} ({})", info.nickname, ip))
                        .collect();
                    names.sort();
                    if names.is_empty() {
                        println!("* no peers online");
                    } else {
                        println!("* peers online: {}", names.join(", "));
                    }
                }
                NetworkEvent::SystemLog(line) => println!("* {}", line),
            }
        }
    });

    // The host drives the inactivity sweep on a fixed cadence.
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                manager.check_inactive_peers().await;
            }
        });
    }

    println!("Type a message to send it to every known peer. Commands: /stats, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" => break,
            "/stats" => {
                let stats = manager.get_stats().await;
                println!(
                    "* {} | {} (udp {}, tcp {}) | sent {} / received {} | discovered {} ({} online) | up {:.0?}",
                    stats.status,
                    stats.local_ip,
                    stats.udp_port,
                    stats.tcp_port,
                    stats.messages_sent,
                    stats.messages_received,
                    stats.peers_discovered,
                    stats.active_peers,
                    stats.session_duration,
                );
            }
            body => {
                let peers: Vec<_> = manager.peers().await.keys().copied().collect();
                if peers.is_empty() {
                    println!("* no peers known yet");
                } else {
                    manager.send_message_to_selected_peers(&peers, body).await;
                }
            }
        }
    }

    manager.cleanup().await;
    Ok(())
}
