//! Ledger hashing: blake2b-256 with the `ckb-default-hash` personalization.

use blake2b_simd::{Params, State};

use crate::types::H256;

const PERSONALIZATION: &[u8; 16] = b"ckb-default-hash";

/// Incremental hasher for messages assembled from several parts.
pub struct Hasher {
    state: State,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            state: Params::new()
                .hash_length(32)
                .personal(PERSONALIZATION)
                .to_state(),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.state.update(data);
        self
    }

    pub fn finalize(&self) -> H256 {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.state.finalize().as_bytes());
        H256(out)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn blake2b_256(data: &[u8]) -> H256 {
    Hasher::new().update(data).finalize()
}

/// First 20 bytes of the blake2b-256 digest, used as lock args.
pub fn blake160(data: &[u8]) -> [u8; 20] {
    let digest = blake2b_256(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.0[..20]);
    out
}
