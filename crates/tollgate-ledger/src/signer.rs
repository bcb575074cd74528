//! Sighash-all signing for secp256k1-blake160 locks.
//!
//! All inputs of the transactions built here share one lock, so they form a
//! single signing group: one recoverable signature in the first witness
//! covers the transaction hash and every witness of the transaction.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1, SecretKey};

use crate::error::LedgerError;
use crate::hash::{blake160, Hasher};
use crate::molecule::{witness_args_lock, witness_args_with_lock};
use crate::types::{Transaction, H256};

/// Length of a recoverable signature: `R ‖ S ‖ recovery_id`.
pub const SIGNATURE_SIZE: usize = 65;

/// Message signed for the group: `blake2b(tx_hash ‖ Σ (u64_le(len) ‖ witness))`.
pub fn sighash_message(tx: &Transaction) -> H256 {
    let mut hasher = Hasher::new();
    hasher.update(&tx.hash().0);
    for witness in &tx.witnesses {
        hasher.update(&(witness.len() as u64).to_le_bytes());
        hasher.update(witness);
    }
    hasher.finalize()
}

/// Sign every input of `tx` as one group and write the signature into the
/// first witness. Missing witnesses are filled with empty ones.
pub fn sign_sighash_all(tx: &mut Transaction, key: &SecretKey) -> Result<(), LedgerError> {
    if tx.inputs.is_empty() {
        return Err(LedgerError::Signing("transaction has no inputs".into()));
    }
    if tx.witnesses.len() < tx.inputs.len() {
        tx.witnesses.resize(tx.inputs.len(), Vec::new());
    }
    tx.witnesses[0] = witness_args_with_lock(&[0u8; SIGNATURE_SIZE]);

    let message = sighash_message(tx);
    let signature = sign_recoverable(&message, key);
    tx.witnesses[0] = witness_args_with_lock(&signature);
    Ok(())
}

fn sign_recoverable(message: &H256, key: &SecretKey) -> [u8; SIGNATURE_SIZE] {
    let secp = Secp256k1::signing_only();
    let sig = secp.sign_ecdsa_recoverable(&Message::from_digest(message.0), key);
    let (recovery_id, compact) = sig.serialize_compact();
    let mut out = [0u8; SIGNATURE_SIZE];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    out
}

/// Recover the blake160 pubkey hash that signed the group.
pub fn recover_signer(tx: &Transaction) -> Result<[u8; 20], LedgerError> {
    let first = tx
        .witnesses
        .first()
        .ok_or_else(|| LedgerError::Signing("missing witness".into()))?;
    let lock = witness_args_lock(first)
        .filter(|l| l.len() == SIGNATURE_SIZE)
        .ok_or_else(|| LedgerError::Signing("malformed signature witness".into()))?;

    let mut unsigned = tx.clone();
    unsigned.witnesses[0] = witness_args_with_lock(&[0u8; SIGNATURE_SIZE]);
    let message = sighash_message(&unsigned);

    let recovery_id = RecoveryId::from_i32(lock[64] as i32)?;
    let signature = RecoverableSignature::from_compact(&lock[..64], recovery_id)?;
    let pubkey = Secp256k1::verification_only()
        .recover_ecdsa(&Message::from_digest(message.0), &signature)?;
    Ok(blake160(&pubkey.serialize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::sighash_lock;
    use crate::keys::GuestKey;
    use crate::types::{CellInput, CellOutput, OutPoint};

    fn two_input_tx(key: &GuestKey) -> Transaction {
        let lock = sighash_lock(blake160(&key.public_key().serialize()));
        Transaction {
            version: 0,
            cell_deps: vec![],
            header_deps: vec![],
            inputs: (0..2)
                .map(|i| {
                    CellInput::new(OutPoint {
                        tx_hash: H256([3; 32]),
                        index: i,
                    })
                })
                .collect(),
            outputs: vec![CellOutput::bare(10_000_000_000, lock)],
            outputs_data: vec![vec![]],
            witnesses: vec![],
        }
    }

    #[test]
    fn test_sign_fills_witnesses_and_recovers() {
        let key = GuestKey::generate();
        let mut tx = two_input_tx(&key);
        sign_sighash_all(&mut tx, key.secret_key()).unwrap();

        assert_eq!(tx.witnesses.len(), 2);
        assert_eq!(tx.witnesses[0].len(), 85);
        assert!(tx.witnesses[1].is_empty());
        assert_eq!(
            recover_signer(&tx).unwrap(),
            blake160(&key.public_key().serialize())
        );
    }

    #[test]
    fn test_signature_covers_every_witness() {
        let key = GuestKey::generate();
        let mut tx = two_input_tx(&key);
        sign_sighash_all(&mut tx, key.secret_key()).unwrap();
        let signer = blake160(&key.public_key().serialize());

        tx.witnesses[1] = vec![0xff];
        let recovered = recover_signer(&tx).unwrap_or([0u8; 20]);
        assert_ne!(recovered, signer);
    }

    #[test]
    fn test_sign_requires_inputs() {
        let key = GuestKey::generate();
        let mut tx = two_input_tx(&key);
        tx.inputs.clear();
        assert!(sign_sighash_all(&mut tx, key.secret_key()).is_err());
    }
}
