//! Configuration for syncd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// syncd - device sync protocol daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "syncd")]
#[command(about = "Peer-to-peer sync daemon for append-only event logs")]
pub struct Config {
    /// Listen address for the sync HTTP server
    #[arg(short, long, default_value = "0.0.0.0:0")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage and the identity file
    #[arg(short, long, default_value = "./data/syncd")]
    pub data_dir: PathBuf,

    /// Human-readable name announced in discovery beacons
    #[arg(long, env = "SYNCD_DEVICE_NAME")]
    pub device_name: Option<String>,

    /// UDP port used for peer discovery beacons
    #[arg(long, default_value_t = sync_net::discovery::DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// Seconds between discovery beacon broadcasts
    #[arg(long, default_value = "5")]
    pub broadcast_interval_secs: u64,

    /// Seconds of silence before a peer is evicted from the directory
    #[arg(long, default_value = "15")]
    pub peer_timeout_secs: u64,

    /// Seconds a minted challenge remains valid
    #[arg(long, default_value = "30")]
    pub challenge_ttl_secs: u64,

    /// Seconds before an outbound sync request gives up
    #[arg(long, default_value = "5")]
    pub request_timeout_secs: u64,

    /// Seconds between background sync-with-all-peers sweeps
    #[arg(long, default_value = "60")]
    pub sync_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.discovery_port == 0 {
            anyhow::bail!("discovery_port must be nonzero");
        }
        Ok(())
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn device_name(&self) -> String {
        self.device_name.clone().unwrap_or_else(|| {
            hostname_fallback()
        })
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unnamed-device".to_string())
}
