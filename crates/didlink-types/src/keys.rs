//! Key service contract. Signing and verification live outside the core.

use crate::error::DidLinkResult;
use crate::identity::KeyHandle;
use async_trait::async_trait;

/// External wallet / key store.
///
/// Public keys cross this boundary hex encoded; signatures as raw bytes.
#[async_trait]
pub trait KeyService: Send + Sync + 'static {
    /// The public key belonging to `handle`.
    async fn public_key(&self, handle: &KeyHandle) -> DidLinkResult<String>;

    /// Sign `data` with the key behind `handle`.
    async fn sign(&self, handle: &KeyHandle, data: &[u8]) -> DidLinkResult<Vec<u8>>;

    /// Check `signature` over `data` against `public_key`.
    ///
    /// Malformed keys or signatures verify as `false`.
    async fn verify(&self, public_key: &str, data: &[u8], signature: &[u8]) -> bool;
}
