// Cryptographic primitives for the Swarm node
//
// Receipts and handshakes are signed with recoverable secp256k1 signatures
// over Ethereum-prefixed keccak256 digests, so the signer's overlay can be
// derived from the signature alone.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{NodeError, Result};
use crate::types::Address;

/// Length of a recoverable signature: r ‖ s ‖ v
pub const SIGNATURE_LENGTH: usize = 65;

/// Signing capability injected into the protocols
pub trait Signer: Send + Sync {
    /// Sign `data` with the Ethereum signed-message prefix
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Public key of the signer
    fn public_key(&self) -> VerifyingKey;
}

/// Signer backed by an in-memory secp256k1 key
pub struct DefaultSigner {
    key: Mutex<SigningKey>,
}

impl DefaultSigner {
    /// Wrap an existing signing key
    pub fn new(key: SigningKey) -> Self {
        Self {
            key: Mutex::new(key),
        }
    }

    /// Generate a fresh random key
    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut OsRng))
    }

    /// Load a key from 32 raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(bytes)?;
        Ok(Self::new(key))
    }

    /// Export the key as hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.key.lock().to_bytes())
    }
}

impl Signer for DefaultSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let digest = hash_with_ethereum_prefix(data);
        let (signature, recovery_id) = self.key.lock().sign_prehash_recoverable(&digest)?;

        let mut out = Vec::with_capacity(SIGNATURE_LENGTH);
        out.extend_from_slice(&signature.to_bytes());
        out.push(recovery_id.to_byte() + 27);
        Ok(out)
    }

    fn public_key(&self) -> VerifyingKey {
        *self.key.lock().verifying_key()
    }
}

/// keccak256 of the input
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// keccak256 of `"\x19Ethereum Signed Message:\n" ‖ len ‖ data`
pub fn hash_with_ethereum_prefix(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", data.len()).as_bytes());
    hasher.update(data);
    hasher.finalize().into()
}

/// Recover the public key that produced `signature` over `data`
pub fn recover(signature: &[u8], data: &[u8]) -> Result<VerifyingKey> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(NodeError::Crypto(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_LENGTH,
            signature.len()
        )));
    }

    let v = signature[64];
    let recovery_byte = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_byte(recovery_byte)
        .ok_or_else(|| NodeError::Crypto(format!("invalid recovery id {}", v)))?;
    let sig = Signature::from_slice(&signature[..64])?;

    let digest = hash_with_ethereum_prefix(data);
    Ok(VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)?)
}

/// Ethereum address of a public key
pub fn ethereum_address(key: &VerifyingKey) -> [u8; 20] {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    out
}

/// Overlay address for a public key on the given network:
/// `keccak256(eth_address ‖ network_id (u64 LE))`
pub fn overlay_address(key: &VerifyingKey, network_id: u64) -> Address {
    let mut data = Vec::with_capacity(28);
    data.extend_from_slice(&ethereum_address(key));
    data.extend_from_slice(&network_id.to_le_bytes());
    Address::new(keccak256(&data))
}

/// Recover the overlay address of whoever signed `data`
pub fn recover_overlay(signature: &[u8], data: &[u8], network_id: u64) -> Result<Address> {
    let key = recover(signature, data)?;
    Ok(overlay_address(&key, network_id))
}

/// Load a hex-encoded key from `path`, creating and saving a new one when the
/// file does not exist.
pub fn load_or_create_key<P: AsRef<Path>>(path: P) -> Result<DefaultSigner> {
    let path = path.as_ref();
    if path.exists() {
        let text = fs::read_to_string(path)?;
        let bytes = hex::decode(text.trim())
            .map_err(|e| NodeError::Crypto(format!("invalid key file {}: {}", path.display(), e)))?;
        return DefaultSigner::from_bytes(&bytes);
    }

    let signer = DefaultSigner::random();
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, signer.to_hex())?;
    info!("Generated new node key at {}", path.display());
    Ok(signer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_recover() {
        let signer = DefaultSigner::random();
        let data = b"chunk address and network id";

        let signature = signer.sign(data).unwrap();
        assert_eq!(signature.len(), SIGNATURE_LENGTH);

        let recovered = recover(&signature, data).unwrap();
        assert_eq!(recovered, signer.public_key());
    }

    #[test]
    fn test_recover_other_data_yields_other_key() {
        let signer = DefaultSigner::random();
        let signature = signer.sign(b"one").unwrap();

        match recover(&signature, b"two") {
            Ok(key) => assert_ne!(key, signer.public_key()),
            Err(_) => {}
        }
    }

    #[test]
    fn test_overlay_depends_on_network_id() {
        let signer = DefaultSigner::random();
        let key = signer.public_key();
        assert_ne!(overlay_address(&key, 1), overlay_address(&key, 2));
        assert_eq!(overlay_address(&key, 1), overlay_address(&key, 1));
    }

    #[test]
    fn test_recover_overlay_matches_signer() {
        let signer = DefaultSigner::random();
        let signature = signer.sign(b"receipt").unwrap();
        let overlay = recover_overlay(&signature, b"receipt", 10).unwrap();
        assert_eq!(overlay, overlay_address(&signer.public_key(), 10));
    }

    #[test]
    fn test_recover_rejects_short_signature() {
        assert!(matches!(recover(&[0u8; 10], b"x"), Err(NodeError::Crypto(_))));
    }

    #[test]
    fn test_load_or_create_key_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = load_or_create_key(&path).unwrap();
        let second = load_or_create_key(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }
}
