//! syncd - peer-to-peer device sync daemon
//!
//! This crate provides:
//! - The durable, append-only `EventLog` backed by sled
//! - The sync HTTP server (challenge / inventory / pull / push)
//! - The sync client that drives the three-phase exchange against a peer
//! - The `Coordinator`, which owns the identity, event log, and peer
//!   directory and is the shared context every handler and background loop
//!   runs against

pub mod client;
pub mod config;
pub mod event_log;
pub mod repl;
pub mod server;
pub mod storage;

pub use client::{SyncClient, SyncClientError, SyncSummary};
pub use config::Config;
pub use event_log::EventLog;
pub use server::Coordinator;
pub use storage::Storage;
