//! Networking layer for the device sync protocol.
//!
//! This crate provides:
//! - Cryptographic identity (signing, key agreement, AEAD envelopes)
//! - LAN peer discovery via signed UDP beacons
//! - The peer record and directory shared by discovery and sync

pub mod discovery;
pub mod identity;
pub mod peer;

pub use discovery::{Beacon, BeaconPayload, PeerDirectory, DISCOVERY_PORT};
pub use identity::{CryptographicIdentity, Envelope};
pub use peer::PeerRecord;
