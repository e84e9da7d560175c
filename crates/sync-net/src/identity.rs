//! Cryptographic identity: the signing and key-agreement keypair a device
//! uses to authenticate itself and to encrypt sync traffic with its peers.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use sync_core::canonical::canonical_bytes;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

const HKDF_INFO: &[u8] = b"sync-protocol-v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("key derivation failed")]
    KeyDerivationFailed,
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An encrypted envelope as sent on the wire: a fresh random nonce and the
/// AEAD ciphertext (which includes the authentication tag).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: String,
    pub ciphertext: String,
}

/// On-disk representation of a persisted identity.
#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    sign_private: String,
    encrypt_private: String,
}

/// A device's long-lived signing (Ed25519) and key-agreement (X25519)
/// keypair. Private key material never leaves this type.
pub struct CryptographicIdentity {
    signing_key: SigningKey,
    agreement_secret: StaticSecret,
}

impl CryptographicIdentity {
    /// Load a previously persisted identity from `path`, or generate a new
    /// one and persist it there.
    pub fn create_or_load(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let persisted: PersistedIdentity = serde_json::from_slice(&bytes)?;
            let sign_bytes = BASE64.decode(persisted.sign_private)?;
            let encrypt_bytes = BASE64.decode(persisted.encrypt_private)?;
            let sign_arr: [u8; 32] =
                sign_bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
            let encrypt_arr: [u8; 32] =
                encrypt_bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
            return Ok(Self {
                signing_key: SigningKey::from_bytes(&sign_arr),
                agreement_secret: StaticSecret::from(encrypt_arr),
            });
        }

        let identity = Self::generate();
        identity.persist(path)?;
        Ok(identity)
    }

    pub(crate) fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            agreement_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    fn persist(&self, path: &Path) -> Result<(), CryptoError> {
        let persisted = PersistedIdentity {
            sign_private: BASE64.encode(self.signing_key.to_bytes()),
            encrypt_private: BASE64.encode(self.agreement_secret.to_bytes()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        std::fs::write(path, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
        Ok(())
    }

    pub fn signing_public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn signing_public_key_b64(&self) -> String {
        BASE64.encode(self.signing_public_key())
    }

    pub fn agreement_public_key(&self) -> [u8; 32] {
        *X25519Public::from(&self.agreement_secret).as_bytes()
    }

    pub fn agreement_public_key_b64(&self) -> String {
        BASE64.encode(self.agreement_public_key())
    }

    /// `user_id = sha256(signing_public_key)[0..16 hex chars]`
    pub fn user_id(&self) -> String {
        user_id_of(&self.signing_public_key())
    }

    /// Sign the canonical JSON form of `message` with Ed25519, returning a
    /// base64 signature.
    pub fn sign<T: Serialize>(&self, message: &T) -> Result<String, CryptoError> {
        let bytes = canonical_bytes(message).map_err(|_| CryptoError::KeyDerivationFailed)?;
        let signature = self.signing_key.sign(&bytes);
        Ok(BASE64.encode(signature.to_bytes()))
    }

    /// Verify a base64 Ed25519 signature over the canonical JSON form of
    /// `message`. Any malformed input simply yields `false`.
    pub fn verify<T: Serialize>(signer_public_key_b64: &str, message: &T, signature_b64: &str) -> bool {
        verify_inner(signer_public_key_b64, message, signature_b64).unwrap_or(false)
    }

    /// Derive the 32-byte session key shared with a peer's X25519 public
    /// key via ECDH + HKDF-SHA256 (empty salt, fixed info string).
    pub fn derive_shared_key(&self, peer_agreement_public_key_b64: &str) -> Result<[u8; 32], CryptoError> {
        let peer_bytes = BASE64.decode(peer_agreement_public_key_b64)?;
        let peer_arr: [u8; 32] = peer_bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        let peer_public = X25519Public::from(peer_arr);
        let shared_secret = self.agreement_secret.diffie_hellman(&peer_public);

        let hkdf = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(HKDF_INFO, &mut key).map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(key)
    }

    /// Encrypt `plaintext` under `key` with a fresh random 12-byte nonce and
    /// empty associated data.
    pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Envelope, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(Envelope { nonce: BASE64.encode(nonce_bytes), ciphertext: BASE64.encode(ciphertext) })
    }

    /// Decrypt an [`Envelope`] under `key`.
    pub fn decrypt(envelope: &Envelope, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let nonce_bytes = BASE64.decode(&envelope.nonce)?;
        if nonce_bytes.len() != 12 {
            return Err(CryptoError::InvalidKeyLength);
        }
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = BASE64.decode(&envelope.ciphertext)?;
        cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl Drop for CryptographicIdentity {
    fn drop(&mut self) {
        self.agreement_secret.zeroize();
    }
}

fn verify_inner<T: Serialize>(
    signer_public_key_b64: &str,
    message: &T,
    signature_b64: &str,
) -> Result<bool, CryptoError> {
    let public_bytes = BASE64.decode(signer_public_key_b64)?;
    let public_arr: [u8; 32] = public_bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
    let verifying_key = VerifyingKey::from_bytes(&public_arr).map_err(|_| CryptoError::InvalidKeyLength)?;

    let sig_bytes = BASE64.decode(signature_b64)?;
    let sig_arr: [u8; 64] = sig_bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
    let signature = Signature::from_bytes(&sig_arr);

    let bytes = canonical_bytes(message).map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(verifying_key.verify(&bytes, &signature).is_ok())
}

/// `user_id = sha256(signing_public_key)[0..16 hex chars]`
pub fn user_id_of(signing_public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(signing_public_key);
    hex::encode(&digest[..8])
}
