//! In-memory Ed25519 key store.
//!
//! Implements [`KeyService`] for agents that keep their keys in process.
//! Keys are either generated from the OS RNG or derived from a wallet seed
//! string (SHA-256 of the seed becomes the Ed25519 secret), so a demo agent
//! restarted with the same seed keeps the same public key.

use async_trait::async_trait;
use dashmap::DashMap;
use didlink_types::error::{DidLinkError, DidLinkResult};
use didlink_types::identity::KeyHandle;
use didlink_types::keys::KeyService;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Ed25519 keys indexed by handle.
#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: DashMap<KeyHandle, SigningKey>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh random key and return its handle.
    pub fn generate(&self) -> KeyHandle {
        let signing_key = SigningKey::generate(&mut OsRng);
        let handle = KeyHandle::new(format!("ed25519:{}", uuid::Uuid::new_v4()));
        debug!(key = %handle, "Generated signing key");
        self.keys.insert(handle.clone(), signing_key);
        handle
    }

    /// Derive a key from `seed`. The same seed always yields the same key
    /// and the same handle.
    pub fn derive_key(&self, seed: &str) -> KeyHandle {
        let secret: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        let signing_key = SigningKey::from_bytes(&secret);
        let fingerprint = hex::encode(&signing_key.verifying_key().to_bytes()[..8]);
        let handle = KeyHandle::new(format!("ed25519:{fingerprint}"));
        self.keys.insert(handle.clone(), signing_key);
        handle
    }

    pub fn contains(&self, handle: &KeyHandle) -> bool {
        self.keys.contains_key(handle)
    }

    fn signing_key(&self, handle: &KeyHandle) -> DidLinkResult<SigningKey> {
        self.keys
            .get(handle)
            .map(|k| k.value().clone())
            .ok_or_else(|| DidLinkError::Key(format!("unknown key handle '{handle}'")))
    }
}

fn parse_verifying_key(public_key: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(public_key).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

#[async_trait]
impl KeyService for InMemoryKeyStore {
    async fn public_key(&self, handle: &KeyHandle) -> DidLinkResult<String> {
        let key = self.signing_key(handle)?;
        Ok(hex::encode(key.verifying_key().to_bytes()))
    }

    async fn sign(&self, handle: &KeyHandle, data: &[u8]) -> DidLinkResult<Vec<u8>> {
        let key = self.signing_key(handle)?;
        Ok(key.sign(data).to_bytes().to_vec())
    }

    async fn verify(&self, public_key: &str, data: &[u8], signature: &[u8]) -> bool {
        let Some(verifying_key) = parse_verifying_key(public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key.verify(data, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sign_and_verify() {
        let store = InMemoryKeyStore::new();
        let handle = store.generate();
        let public_key = store.public_key(&handle).await.unwrap();
        assert_eq!(public_key.len(), 64);

        let sig = store.sign(&handle, b"connection info").await.unwrap();
        assert!(store.verify(&public_key, b"connection info", &sig).await);
        assert!(!store.verify(&public_key, b"tampered", &sig).await);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let store = InMemoryKeyStore::new();
        let signer = store.generate();
        let other = store.generate();
        let sig = store.sign(&signer, b"data").await.unwrap();
        let other_pk = store.public_key(&other).await.unwrap();
        assert!(!store.verify(&other_pk, b"data", &sig).await);
    }

    #[tokio::test]
    async fn test_malformed_inputs_verify_false() {
        let store = InMemoryKeyStore::new();
        let handle = store.generate();
        let pk = store.public_key(&handle).await.unwrap();
        assert!(!store.verify("not-hex", b"data", &[0u8; 64]).await);
        assert!(!store.verify(&pk, b"data", &[0u8; 3]).await);
    }

    #[tokio::test]
    async fn test_seed_is_deterministic() {
        let a = InMemoryKeyStore::new();
        let b = InMemoryKeyStore::new();
        let ha = a.derive_key("demo-agent-acme");
        let hb = b.derive_key("demo-agent-acme");
        assert_eq!(ha, hb);
        assert_eq!(
            a.public_key(&ha).await.unwrap(),
            b.public_key(&hb).await.unwrap()
        );
        assert_ne!(a.derive_key("demo-agent-bob"), ha);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let store = InMemoryKeyStore::new();
        let err = store.public_key(&KeyHandle::new("missing")).await.unwrap_err();
        assert!(matches!(err, DidLinkError::Key(_)));
    }
}
