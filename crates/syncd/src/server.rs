//! Sync HTTP server: challenge issuance, authentication, and the
//! inventory/pull/push endpoints. Context (identity, event log, peer
//! directory, challenge table) is constructed once and passed into the
//! router explicitly -- no process-wide globals.

use crate::client::SyncClient;
use crate::config::Config;
use crate::event_log::EventLog;
use crate::storage::Storage;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::Event;
use sync_net::discovery::PeerDirectory;
use sync_net::{CryptographicIdentity, Envelope};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("event log error: {0}")]
    EventLog(#[from] crate::event_log::EventLogError),
    #[error("crypto error: {0}")]
    Crypto(#[from] sync_net::identity::CryptoError),
}

/// Single-use challenges, evicted after their TTL.
pub struct ChallengeTable {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl ChallengeTable {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl }
    }

    pub fn mint(&self) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let challenge = BASE64.encode(bytes);
        self.evict_expired();
        self.entries.write().insert(challenge.clone(), Instant::now());
        challenge
    }

    /// Check whether `challenge` exists and has not expired, without
    /// consuming it. An expired entry is evicted as a side effect. Callers
    /// must verify the requester's signature and `user_id` against this
    /// check before calling [`Self::consume`] -- checking validity up front
    /// lets an unsigned or wrongly-signed request fail before it burns the
    /// challenge for whoever actually holds the signing key.
    pub fn is_valid(&self, challenge: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get(challenge) {
            Some(issued_at) if issued_at.elapsed() <= self.ttl => true,
            Some(_) => {
                entries.remove(challenge);
                false
            }
            None => false,
        }
    }

    /// Remove `challenge` so it can never be used again. Returns `false` if
    /// it was already consumed or had expired in the meantime.
    pub fn consume(&self, challenge: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.remove(challenge) {
            Some(issued_at) => issued_at.elapsed() <= self.ttl,
            None => false,
        }
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries.write().retain(|_, issued_at| issued_at.elapsed() <= ttl);
    }
}

/// Message signed by the client to prove possession of its signing key.
#[derive(Serialize, Deserialize)]
struct ChallengeMessage {
    challenge: String,
}

/// Decoded form of the `X-Auth-Response` header.
#[derive(Serialize, Deserialize)]
struct AuthResponse {
    challenge: String,
    signature: String,
    #[serde(rename = "signPublicKey")]
    sign_public_key: String,
}

/// Shared context handed to every request handler.
pub struct Coordinator {
    pub config: Config,
    pub identity: CryptographicIdentity,
    pub device_id: String,
    pub event_log: Arc<EventLog>,
    pub peer_directory: Arc<PeerDirectory>,
    pub challenges: ChallengeTable,
    pub http_port: RwLock<u16>,
    pub running: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let identity = CryptographicIdentity::create_or_load(&config.identity_path())?;
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let event_log = Arc::new(EventLog::open(storage)?);
        let device_id = uuid::Uuid::new_v4().to_string();
        let challenges = ChallengeTable::new(config.challenge_ttl());

        Ok(Self {
            config,
            identity,
            device_id,
            event_log,
            peer_directory: Arc::new(PeerDirectory::new()),
            challenges,
            http_port: RwLock::new(0),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn user_id(&self) -> String {
        self.identity.user_id()
    }

    pub fn http_port(&self) -> u16 {
        *self.http_port.read()
    }

    /// Create a new CREATE/UPDATE/DELETE event and append it locally.
    pub fn create_local_event(
        &self,
        event_type: sync_core::EventType,
        subject_id: &str,
        content: &str,
    ) -> Result<Event, ServerError> {
        let timestamp = sync_net::peer::now_millis();
        let event = Event::new(uuid::Uuid::new_v4().to_string(), event_type, subject_id.to_string(), content.to_string(), timestamp);
        self.event_log.add(event.clone())?;
        Ok(event)
    }

    pub fn project(&self) -> std::collections::BTreeMap<String, sync_core::Projected> {
        self.event_log.project()
    }

    pub fn peers(&self) -> Vec<sync_net::PeerRecord> {
        self.peer_directory.list()
    }

    pub fn find_peer(&self, name: &str) -> Option<sync_net::PeerRecord> {
        self.peer_directory.find_by_name(name)
    }

    /// Run the three-phase sync exchange against one peer, identified by
    /// `device_name`.
    pub async fn sync_with(self: &Arc<Self>, device_name: &str) -> Result<crate::client::SyncSummary, crate::client::SyncClientError> {
        let peer = self
            .find_peer(device_name)
            .ok_or_else(|| crate::client::SyncClientError::Protocol(format!("no peer named '{device_name}'")))?;
        SyncClient::new(self.clone()).sync_with(&peer).await
    }

    /// Run the three-phase sync exchange against every currently known peer.
    pub async fn sync_with_all(
        self: &Arc<Self>,
    ) -> Vec<(sync_net::PeerRecord, Result<crate::client::SyncSummary, crate::client::SyncClientError>)> {
        let client = SyncClient::new(self.clone());
        let mut results = Vec::new();
        for peer in self.peers() {
            let outcome = client.sync_with(&peer).await;
            results.push((peer, outcome));
        }
        results
    }

    pub fn quit(&self) {
        self.shutdown();
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Outcome of a successfully authenticated request: the derived session key
/// to encrypt the response with.
struct Authenticated {
    session_key: [u8; 32],
}

fn authenticate(coordinator: &Coordinator, headers: &HeaderMap) -> Result<Authenticated, StatusCode> {
    let auth_header = headers.get("X-Auth-Response").ok_or(StatusCode::UNAUTHORIZED)?;
    let auth_bytes =
        BASE64.decode(auth_header.as_bytes()).map_err(|_| StatusCode::UNAUTHORIZED)?;
    let auth: AuthResponse = serde_json::from_slice(&auth_bytes).map_err(|_| StatusCode::UNAUTHORIZED)?;

    if !coordinator.challenges.is_valid(&auth.challenge) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let message = ChallengeMessage { challenge: auth.challenge.clone() };
    if !CryptographicIdentity::verify(&auth.sign_public_key, &message, &auth.signature) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let signer_key_bytes = BASE64.decode(&auth.sign_public_key).map_err(|_| StatusCode::UNAUTHORIZED)?;
    let signer_arr: [u8; 32] = signer_key_bytes.try_into().map_err(|_| StatusCode::UNAUTHORIZED)?;
    if sync_net::identity::user_id_of(&signer_arr) != coordinator.user_id() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    // Only burn the challenge once the caller has proven it holds the
    // matching signing key for our user -- an attacker who merely observed
    // the cleartext challenge cannot get this far.
    if !coordinator.challenges.consume(&auth.challenge) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let encrypt_key_header = headers.get("X-Encrypt-Key").ok_or(StatusCode::UNAUTHORIZED)?;
    let encrypt_key_b64 = encrypt_key_header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;
    let session_key = coordinator
        .identity
        .derive_shared_key(encrypt_key_b64)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    Ok(Authenticated { session_key })
}

fn encrypted_response<T: Serialize>(key: &[u8; 32], value: &T) -> Result<Json<Envelope>, StatusCode> {
    let plaintext = serde_json::to_vec(value).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let envelope = CryptographicIdentity::encrypt(&plaintext, key).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(envelope))
}

async fn challenge_handler(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let challenge = coordinator.challenges.mint();
    Json(serde_json::json!({
        "challenge": challenge,
        "serverEncryptKey": coordinator.identity.agreement_public_key_b64(),
    }))
}

#[derive(Serialize, Deserialize)]
struct InventoryResponse {
    hashes: Vec<String>,
}

async fn inventory_handler(State(coordinator): State<Arc<Coordinator>>, headers: HeaderMap) -> Response {
    match authenticate(&coordinator, &headers) {
        Ok(auth) => {
            let body = InventoryResponse { hashes: coordinator.event_log.hashes() };
            match encrypted_response(&auth.session_key, &body) {
                Ok(json) => json.into_response(),
                Err(status) => status.into_response(),
            }
        }
        Err(status) => status.into_response(),
    }
}

#[derive(Deserialize)]
struct PullQuery {
    hashes: String,
}

#[derive(Serialize, Deserialize)]
struct PullResponse {
    events: Vec<Event>,
}

async fn pull_handler(
    State(coordinator): State<Arc<Coordinator>>,
    headers: HeaderMap,
    Query(query): Query<PullQuery>,
) -> Response {
    match authenticate(&coordinator, &headers) {
        Ok(auth) => {
            let requested: Vec<String> = query.hashes.split(',').filter(|h| !h.is_empty()).map(String::from).collect();
            let events = coordinator.event_log.events_for(&requested);
            let body = PullResponse { events };
            match encrypted_response(&auth.session_key, &body) {
                Ok(json) => json.into_response(),
                Err(status) => status.into_response(),
            }
        }
        Err(status) => status.into_response(),
    }
}

#[derive(Serialize, Deserialize)]
struct PushRequest {
    events: Vec<Event>,
}

#[derive(Serialize, Deserialize)]
struct PushResponse {
    added: usize,
}

async fn push_handler(State(coordinator): State<Arc<Coordinator>>, headers: HeaderMap, body: Bytes) -> Response {
    let auth = match authenticate(&coordinator, &headers) {
        Ok(auth) => auth,
        Err(status) => return status.into_response(),
    };

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let plaintext = match CryptographicIdentity::decrypt(&envelope, &auth.session_key) {
        Ok(p) => p,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let request: PushRequest = match serde_json::from_slice(&plaintext) {
        Ok(r) => r,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let added = match coordinator.event_log.merge(request.events) {
        Ok(added) => added,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    match encrypted_response(&auth.session_key, &PushResponse { added }) {
        Ok(json) => json.into_response(),
        Err(status) => status.into_response(),
    }
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/sync/challenge", get(challenge_handler))
        .route("/sync/inventory", get(inventory_handler))
        .route("/sync/pull", get(pull_handler))
        .route("/sync/push", post(push_handler))
        .with_state(coordinator)
}

/// Bind and serve the sync HTTP router, recording the bound port on
/// `coordinator`. Runs until the listener is dropped or the process exits.
pub async fn run_http_server(coordinator: Arc<Coordinator>) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(coordinator.config.listen).await?;
    let local_addr = listener.local_addr()?;
    *coordinator.http_port.write() = local_addr.port();
    info!("sync HTTP server listening on {}", local_addr);

    axum::serve(listener, router(coordinator.clone()))
        .with_graceful_shutdown(wait_for_shutdown(coordinator))
        .await?;
    Ok(())
}

async fn wait_for_shutdown(coordinator: Arc<Coordinator>) {
    while coordinator.running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Periodically sync with every known peer until shutdown.
pub async fn run_background_sync_loop(coordinator: Arc<Coordinator>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(coordinator.config.sync_interval_secs));
    while coordinator.running.load(Ordering::SeqCst) {
        ticker.tick().await;
        let client = SyncClient::new(coordinator.clone());
        for peer in coordinator.peers() {
            match client.sync_with(&peer).await {
                Ok(summary) => info!(peer = %peer.device_name, pulled = summary.pulled, pushed = summary.pushed, "synced"),
                Err(e) => warn!(peer = %peer.device_name, error = %e, "sync failed"),
            }
        }
    }
}
