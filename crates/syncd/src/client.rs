//! Sync client: the three-phase Inventory / Pull / Push exchange a device
//! runs against one peer. Each phase is independently authenticated -- a
//! fresh challenge is minted and a fresh session key derived for every
//! request, so there is no session to keep alive between phases.

use crate::server::Coordinator;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sync_core::Event;
use sync_net::identity::CryptoError;
use sync_net::{CryptographicIdentity, Envelope, PeerRecord};
use thiserror::Error;

/// Pull requests are batched so a single exchange never asks for an
/// unbounded number of events at once.
const PULL_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum SyncClientError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncSummary {
    pub pulled: usize,
    pub pushed: usize,
}

#[derive(Serialize, Deserialize)]
struct ChallengeMessage {
    challenge: String,
}

#[derive(Deserialize)]
struct ChallengeResponse {
    challenge: String,
    #[serde(rename = "serverEncryptKey")]
    server_encrypt_key: String,
}

#[derive(Serialize, Deserialize)]
struct AuthResponse {
    challenge: String,
    signature: String,
    #[serde(rename = "signPublicKey")]
    sign_public_key: String,
}

#[derive(Deserialize)]
struct InventoryResponse {
    hashes: Vec<String>,
}

#[derive(Deserialize)]
struct PullResponse {
    events: Vec<Event>,
}

#[derive(Serialize)]
struct PushRequest {
    events: Vec<Event>,
}

#[derive(Deserialize)]
struct PushResponse {
    added: usize,
}

pub struct SyncClient {
    coordinator: Arc<Coordinator>,
    http: reqwest::Client,
}

impl SyncClient {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(coordinator.config.request_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { coordinator, http }
    }

    /// Run all three phases against `peer`. A Push failure is logged by the
    /// caller but does not undo a successful Pull.
    pub async fn sync_with(&self, peer: &PeerRecord) -> Result<SyncSummary, SyncClientError> {
        let (pulled, peer_hashes) = self.pull_phase(peer).await?;
        let pushed = self.push_phase(peer, &peer_hashes).await?;
        Ok(SyncSummary { pulled, pushed })
    }

    /// Mint a fresh challenge from `peer`, sign it, and derive the session
    /// key the rest of this request will use. Returns the auth headers and
    /// the session key.
    async fn authenticate(&self, peer: &PeerRecord) -> Result<(String, [u8; 32]), SyncClientError> {
        let challenge_resp: ChallengeResponse = self
            .http
            .get(format!("{}/sync/challenge", peer.base_url()))
            .send()
            .await?
            .json()
            .await?;

        let message = ChallengeMessage { challenge: challenge_resp.challenge.clone() };
        let signature = self.coordinator.identity.sign(&message)?;
        let auth = AuthResponse {
            challenge: challenge_resp.challenge,
            signature,
            sign_public_key: self.coordinator.identity.signing_public_key_b64(),
        };
        let auth_header = BASE64.encode(serde_json::to_vec(&auth).map_err(|e| SyncClientError::Protocol(e.to_string()))?);

        let session_key = self.coordinator.identity.derive_shared_key(&challenge_resp.server_encrypt_key)?;
        Ok((auth_header, session_key))
    }

    fn encrypt_key_header(&self) -> String {
        self.coordinator.identity.agreement_public_key_b64()
    }

    /// Phase I (Inventory) + Phase II (Pull): diff hash sets against `peer`
    /// and merge in whatever we are missing, in batches of
    /// [`PULL_BATCH_SIZE`]. Returns the number of events pulled and the
    /// peer's full inventory, so Phase III can push only what it lacks.
    ///
    /// Exposed as `pub` (rather than only called from [`Self::sync_with`])
    /// so a caller can drive Phase III separately and observe that a Phase
    /// II merge already landed even if Phase III subsequently fails.
    pub async fn pull_phase(&self, peer: &PeerRecord) -> Result<(usize, std::collections::HashSet<String>), SyncClientError> {
        let (auth_header, session_key) = self.authenticate(peer).await?;
        let inventory_resp = self
            .http
            .get(format!("{}/sync/inventory", peer.base_url()))
            .header("X-Auth-Response", &auth_header)
            .header("X-Encrypt-Key", self.encrypt_key_header())
            .send()
            .await?;
        let envelope: Envelope = inventory_resp.json().await?;
        let plaintext = CryptographicIdentity::decrypt(&envelope, &session_key)?;
        let inventory: InventoryResponse =
            serde_json::from_slice(&plaintext).map_err(|e| SyncClientError::Protocol(e.to_string()))?;

        let peer_hashes: std::collections::HashSet<String> = inventory.hashes.into_iter().collect();
        let local_hashes: std::collections::HashSet<String> = self.coordinator.event_log.hashes().into_iter().collect();
        let missing: Vec<String> = peer_hashes.difference(&local_hashes).cloned().collect();

        let mut pulled = 0;
        for batch in missing.chunks(PULL_BATCH_SIZE) {
            let (auth_header, session_key) = self.authenticate(peer).await?;
            let query = batch.join(",");
            let pull_resp = self
                .http
                .get(format!("{}/sync/pull", peer.base_url()))
                .query(&[("hashes", query.as_str())])
                .header("X-Auth-Response", &auth_header)
                .header("X-Encrypt-Key", self.encrypt_key_header())
                .send()
                .await?;
            let envelope: Envelope = pull_resp.json().await?;
            let plaintext = CryptographicIdentity::decrypt(&envelope, &session_key)?;
            let response: PullResponse =
                serde_json::from_slice(&plaintext).map_err(|e| SyncClientError::Protocol(e.to_string()))?;
            pulled += self
                .coordinator
                .event_log
                .merge(response.events)
                .map_err(|e| SyncClientError::Protocol(e.to_string()))?;
        }

        Ok((pulled, peer_hashes))
    }

    /// Phase III (Push): send every locally-held event `peer_hashes` did not
    /// already claim to have.
    pub async fn push_phase(
        &self,
        peer: &PeerRecord,
        peer_hashes: &std::collections::HashSet<String>,
    ) -> Result<usize, SyncClientError> {
        let (auth_header, session_key) = self.authenticate(peer).await?;
        let local_only: Vec<String> =
            self.coordinator.event_log.hashes().into_iter().filter(|h| !peer_hashes.contains(h)).collect();
        let events = self.coordinator.event_log.events_for(&local_only);
        if events.is_empty() {
            return Ok(0);
        }
        let request = PushRequest { events };
        let plaintext = serde_json::to_vec(&request).map_err(|e| SyncClientError::Protocol(e.to_string()))?;
        let envelope = CryptographicIdentity::encrypt(&plaintext, &session_key)?;

        let push_resp = self
            .http
            .post(format!("{}/sync/push", peer.base_url()))
            .header("X-Auth-Response", &auth_header)
            .header("X-Encrypt-Key", self.encrypt_key_header())
            .json(&envelope)
            .send()
            .await?;
        let response_envelope: Envelope = push_resp.json().await?;
        let response_plaintext = CryptographicIdentity::decrypt(&response_envelope, &session_key)?;
        let response: PushResponse =
            serde_json::from_slice(&response_plaintext).map_err(|e| SyncClientError::Protocol(e.to_string()))?;
        Ok(response.added)
    }
}
