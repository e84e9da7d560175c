//! Peer records: what we remember about another device belonging to the
//! same user, discovered over the LAN.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// A device we have recently heard a valid beacon from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRecord {
    pub device_id: String,
    pub device_name: String,
    pub address: IpAddr,
    pub sync_port: u16,
    pub signing_public_key: String,
    pub agreement_public_key: String,
    pub last_seen: u64,
}

impl PeerRecord {
    pub fn new(
        device_id: String,
        device_name: String,
        address: IpAddr,
        sync_port: u16,
        signing_public_key: String,
        agreement_public_key: String,
    ) -> Self {
        Self {
            device_id,
            device_name,
            address,
            sync_port,
            signing_public_key,
            agreement_public_key,
            last_seen: now_millis(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }

    pub fn is_expired(&self, timeout_ms: u64) -> bool {
        now_millis().saturating_sub(self.last_seen) > timeout_ms
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.sync_port)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_expires_after_timeout() {
        let mut peer = PeerRecord::new(
            "d1".into(),
            "Alice's Laptop".into(),
            "127.0.0.1".parse().unwrap(),
            9000,
            "sign-pk".into(),
            "agree-pk".into(),
        );
        assert!(!peer.is_expired(15_000));
        peer.last_seen = now_millis().saturating_sub(20_000);
        assert!(peer.is_expired(15_000));
    }
}
