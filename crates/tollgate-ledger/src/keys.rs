use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

use crate::address::{Address, Network};
use crate::error::LedgerError;

/// Custodial secp256k1 key of a guest wallet.
/// Private key material is erased on drop.
pub struct GuestKey {
    secret: SecretKey,
}

impl GuestKey {
    /// Generate a new random key using OS-provided entropy.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        loop {
            OsRng.fill_bytes(&mut seed);
            // Retry on out-of-range scalars.
            if let Ok(secret) = SecretKey::from_slice(&seed) {
                seed.zeroize();
                return Self { secret };
            }
        }
    }

    /// Create a key from raw bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
        Ok(Self { secret })
    }

    /// Decode from hex, with or without `0x`.
    pub fn from_hex(hex_str: &str) -> Result<Self, LedgerError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_str.trim().trim_start_matches("0x"))
                .map_err(|e| LedgerError::InvalidKey(format!("invalid hex: {}", e)))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Hex encoding of the secret, for the wallet store.
    pub fn to_hex(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(self.secret.secret_bytes());
        Zeroizing::new(hex::encode(&*bytes))
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::signing_only(), &self.secret)
    }

    /// Sighash-all address controlled by this key.
    pub fn address(&self, network: Network) -> Address {
        Address::from_pubkey(network, &self.public_key())
    }
}

impl Clone for GuestKey {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret,
        }
    }
}

impl fmt::Debug for GuestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestKey")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Drop for GuestKey {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct() {
        let a = GuestKey::generate();
        let b = GuestKey::generate();
        assert_ne!(a.to_hex().as_str(), b.to_hex().as_str());
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = GuestKey::generate();
        let restored = GuestKey::from_hex(&format!("0x{}", key.to_hex().as_str())).unwrap();
        assert_eq!(key.public_key(), restored.public_key());
        assert_eq!(
            key.address(Network::Testnet),
            restored.address(Network::Testnet)
        );
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(GuestKey::from_hex("zz").is_err());
        assert!(GuestKey::from_bytes(&[0u8; 32]).is_err());
        assert!(GuestKey::from_bytes(&[1u8; 31]).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = GuestKey::generate();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains(key.to_hex().as_str()));
    }
}
