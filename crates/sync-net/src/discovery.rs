//! LAN peer discovery: signed presence beacons broadcast over UDP, and the
//! live peer directory built from the beacons we receive.

use crate::identity::{user_id_of, CryptographicIdentity};
use crate::peer::{now_millis, PeerRecord};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DISCOVERY_PORT: u16 = 37520;
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
pub const PEER_TIMEOUT_MS: u64 = 15_000;
const MAX_DATAGRAM_BYTES: usize = 4096;
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// The signed, unsigned payload of a presence beacon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeaconPayload {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "httpPort")]
    pub http_port: u16,
    pub timestamp: u64,
    #[serde(rename = "signPublicKey")]
    pub sign_public_key: String,
    #[serde(rename = "encryptPublicKey")]
    pub encrypt_public_key: String,
}

/// The beacon envelope as it appears on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Beacon {
    pub payload: BeaconPayload,
    pub signature: String,
}

/// Thread-safe table of currently live peers, refreshed by the listen loop
/// and read by the coordinator and sync client.
#[derive(Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: PeerRecord) -> bool {
        let mut peers = self.peers.write();
        let is_new = !peers.contains_key(&record.device_id);
        peers.insert(record.device_id.clone(), record);
        is_new
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<PeerRecord> {
        self.peers
            .read()
            .values()
            .find(|p| p.device_name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Remove peers that have not been seen within `timeout_ms`, returning
    /// the evicted records.
    pub fn evict_stale(&self, timeout_ms: u64) -> Vec<PeerRecord> {
        let mut peers = self.peers.write();
        let stale: Vec<String> = peers
            .iter()
            .filter(|(_, p)| p.is_expired(timeout_ms))
            .map(|(id, _)| id.clone())
            .collect();
        stale.iter().filter_map(|id| peers.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }
}

/// Build, sign, and broadcast one presence beacon.
pub fn build_beacon(
    identity: &CryptographicIdentity,
    device_id: &str,
    device_name: &str,
    http_port: u16,
) -> Result<Beacon, crate::identity::CryptoError> {
    let payload = BeaconPayload {
        device_id: device_id.to_string(),
        device_name: device_name.to_string(),
        http_port,
        timestamp: now_millis() / 1000,
        sign_public_key: identity.signing_public_key_b64(),
        encrypt_public_key: identity.agreement_public_key_b64(),
    };
    let signature = identity.sign(&payload)?;
    Ok(Beacon { payload, signature })
}

/// Bind the discovery UDP socket on `port` with broadcast and address reuse
/// enabled.
pub fn bind_discovery_socket(port: u16) -> Result<UdpSocket, DiscoveryError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    let addr: SocketAddr = (IpAddr::from([0, 0, 0, 0]), port).into();
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Run the broadcast loop until `running` is cleared. Intended to be spawned
/// on a blocking thread since it owns a synchronous `UdpSocket`.
#[allow(clippy::too_many_arguments)]
pub fn run_broadcast_loop(
    socket: &UdpSocket,
    identity: &CryptographicIdentity,
    device_id: &str,
    device_name: &str,
    http_port: u16,
    discovery_port: u16,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    let target: SocketAddr = (IpAddr::from([255, 255, 255, 255]), discovery_port).into();
    while running.load(Ordering::Relaxed) {
        if let Ok(beacon) = build_beacon(identity, device_id, device_name, http_port) {
            if let Ok(bytes) = serde_json::to_vec(&beacon) {
                let _ = socket.send_to(&bytes, target);
            }
        }
        std::thread::sleep(interval);
    }
}

/// Run the listen loop until `running` is cleared, updating `directory` as
/// valid beacons from our own user arrive.
pub fn run_listen_loop(
    socket: &UdpSocket,
    local_user_id: &str,
    local_device_id: &str,
    directory: &PeerDirectory,
    peer_timeout_ms: u64,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_BYTES];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                if let Some(record) = validate_beacon(&buf[..len], addr, local_user_id, local_device_id) {
                    let name = record.device_name.clone();
                    if directory.upsert(record) {
                        tracing::info!(peer = %name, "peer discovered");
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(_) => continue,
        }
        for evicted in directory.evict_stale(peer_timeout_ms) {
            tracing::info!(peer = %evicted.device_name, "peer lost");
        }
    }
}

fn validate_beacon(
    bytes: &[u8],
    addr: SocketAddr,
    local_user_id: &str,
    local_device_id: &str,
) -> Option<PeerRecord> {
    let beacon: Beacon = serde_json::from_slice(bytes).ok()?;

    if !CryptographicIdentity::verify(&beacon.payload.sign_public_key, &beacon.payload, &beacon.signature) {
        return None;
    }

    let sign_key_bytes: [u8; 32] = BASE64.decode(&beacon.payload.sign_public_key).ok()?.try_into().ok()?;
    if user_id_of(&sign_key_bytes) != local_user_id {
        return None;
    }

    if beacon.payload.device_id == local_device_id {
        return None;
    }

    Some(PeerRecord::new(
        beacon.payload.device_id,
        beacon.payload.device_name,
        addr.ip(),
        beacon.payload.http_port,
        beacon.payload.sign_public_key,
        beacon.payload.encrypt_public_key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_upsert_refreshes_existing() {
        let dir = PeerDirectory::new();
        let peer = PeerRecord::new(
            "d1".into(), "Alice".into(), "127.0.0.1".parse().unwrap(), 9000, "sk".into(), "ek".into(),
        );
        assert!(dir.upsert(peer.clone()));
        assert!(!dir.upsert(peer));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn directory_finds_peer_case_insensitively() {
        let dir = PeerDirectory::new();
        let peer = PeerRecord::new(
            "d1".into(), "Alice's Phone".into(), "127.0.0.1".parse().unwrap(), 9000, "sk".into(), "ek".into(),
        );
        dir.upsert(peer);
        assert!(dir.find_by_name("alice's phone").is_some());
        assert!(dir.find_by_name("nope").is_none());
    }

    #[test]
    fn wrong_user_beacon_is_rejected() {
        let identity = CryptographicIdentity::generate();
        let other_user_id = "ffffffffffffffff";
        let beacon = build_beacon(&identity, "dev-a", "Alice", 9000).unwrap();
        assert_ne!(identity.user_id(), other_user_id);
        let record = validate_beacon(
            &serde_json::to_vec(&beacon).unwrap(),
            "127.0.0.1:1234".parse().unwrap(),
            other_user_id,
            "dev-b",
        );
        assert!(record.is_none());
    }

    #[test]
    fn self_echo_beacon_is_rejected() {
        let identity = CryptographicIdentity::generate();
        let beacon = build_beacon(&identity, "dev-a", "Alice", 9000).unwrap();
        let record = validate_beacon(
            &serde_json::to_vec(&beacon).unwrap(),
            "127.0.0.1:1234".parse().unwrap(),
            &identity.user_id(),
            "dev-a",
        );
        assert!(record.is_none());
    }
}
