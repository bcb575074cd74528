//! Human-readable ledger addresses.
//!
//! Full format payload: `0x00 ‖ code_hash ‖ hash_type ‖ args`, bech32m with
//! HRP `ckb` (mainnet) or `ckt` (testnet). The legacy short format for the
//! default sighash lock is accepted on decode.

use bech32::{FromBase32, ToBase32, Variant};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;
use crate::hash::blake160;
use crate::types::{CellDep, DepType, OutPoint, Script, ScriptHashType, H256};

/// Code hash of the secp256k1-blake160 sighash-all lock.
pub const SECP256K1_BLAKE160_CODE_HASH: H256 = H256([
    0x9b, 0xd7, 0xe0, 0x6f, 0x3e, 0xcf, 0x4b, 0xe0, 0xf2, 0xfc, 0xd2, 0x18, 0x8b, 0x23, 0xf1, 0xb9,
    0xfc, 0xc8, 0x8e, 0x5d, 0x4b, 0x65, 0xa8, 0x63, 0x7b, 0x17, 0x72, 0x3b, 0xbd, 0xa3, 0xcc, 0xe8,
]);

const FULL_FORMAT: u8 = 0x00;
const SHORT_FORMAT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn hrp(&self) -> &'static str {
        match self {
            Self::Mainnet => "ckb",
            Self::Testnet => "ckt",
        }
    }

    fn from_hrp(hrp: &str) -> Option<Self> {
        match hrp {
            "ckb" => Some(Self::Mainnet),
            "ckt" => Some(Self::Testnet),
            _ => None,
        }
    }

    /// Dep-group cell that provides the secp256k1 sighash lock code.
    pub fn secp256k1_dep_group(&self) -> CellDep {
        let tx_hash = match self {
            Self::Mainnet => H256([
                0x71, 0xa7, 0xba, 0x8f, 0xc9, 0x63, 0x49, 0xfe, 0xa0, 0xed, 0x3a, 0x5c, 0x47,
                0x99, 0x2e, 0x3b, 0x40, 0x84, 0xb0, 0x31, 0xa4, 0x22, 0x64, 0xa0, 0x18, 0xe0,
                0x07, 0x2e, 0x81, 0x72, 0xe4, 0x6c,
            ]),
            Self::Testnet => H256([
                0xf8, 0xde, 0x3b, 0xb4, 0x7d, 0x05, 0x5c, 0xdf, 0x46, 0x0d, 0x93, 0xa2, 0xa6,
                0xe1, 0xb0, 0x5f, 0x74, 0x32, 0xf9, 0x77, 0x7c, 0x8c, 0x47, 0x4a, 0xbf, 0x4e,
                0xec, 0x1d, 0x4a, 0xee, 0x5d, 0x37,
            ]),
        };
        CellDep {
            out_point: OutPoint { tx_hash, index: 0 },
            dep_type: DepType::DepGroup,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => f.write_str("mainnet"),
            Self::Testnet => f.write_str("testnet"),
        }
    }
}

/// Sighash-all lock for the given blake160 pubkey hash.
pub fn sighash_lock(args: [u8; 20]) -> Script {
    Script {
        code_hash: SECP256K1_BLAKE160_CODE_HASH,
        hash_type: ScriptHashType::Type,
        args: args.to_vec(),
    }
}

/// A lock script bound to a network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    network: Network,
    script: Script,
}

impl Address {
    pub fn new(network: Network, script: Script) -> Self {
        Self { network, script }
    }

    /// Sighash-all address owned by `pubkey`.
    pub fn from_pubkey(network: Network, pubkey: &PublicKey) -> Self {
        Self::new(network, sighash_lock(blake160(&pubkey.serialize())))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn into_script(self) -> Script {
        self.script
    }

    /// Encode in full format.
    pub fn encode(&self) -> Result<String, LedgerError> {
        let mut payload = Vec::with_capacity(34 + self.script.args.len());
        payload.push(FULL_FORMAT);
        payload.extend_from_slice(&self.script.code_hash.0);
        payload.push(self.script.hash_type.to_byte());
        payload.extend_from_slice(&self.script.args);
        bech32::encode(self.network.hrp(), payload.to_base32(), Variant::Bech32m)
            .map_err(|e| LedgerError::InvalidAddress(e.to_string()))
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        let (hrp, data, variant) =
            bech32::decode(s).map_err(|e| LedgerError::InvalidAddress(format!("{s}: {e}")))?;
        let network = Network::from_hrp(&hrp)
            .ok_or_else(|| LedgerError::InvalidAddress(format!("unknown prefix {hrp}")))?;
        let payload = Vec::<u8>::from_base32(&data)
            .map_err(|e| LedgerError::InvalidAddress(format!("{s}: {e}")))?;

        match (payload.first(), variant) {
            (Some(&FULL_FORMAT), Variant::Bech32m) => {
                if payload.len() < 34 {
                    return Err(LedgerError::InvalidAddress(format!("{s}: payload too short")));
                }
                let mut code_hash = [0u8; 32];
                code_hash.copy_from_slice(&payload[1..33]);
                let hash_type = ScriptHashType::from_byte(payload[33])
                    .map_err(|e| LedgerError::InvalidAddress(e.to_string()))?;
                Ok(Self::new(
                    network,
                    Script {
                        code_hash: H256(code_hash),
                        hash_type,
                        args: payload[34..].to_vec(),
                    },
                ))
            }
            (Some(&SHORT_FORMAT), Variant::Bech32) => {
                // Only code hash index 0x00 (sighash) is supported.
                if payload.len() != 22 || payload[1] != 0x00 {
                    return Err(LedgerError::InvalidAddress(format!(
                        "{s}: unsupported short address"
                    )));
                }
                let mut args = [0u8; 20];
                args.copy_from_slice(&payload[2..]);
                Ok(Self::new(network, sighash_lock(args)))
            }
            _ => Err(LedgerError::InvalidAddress(format!(
                "{s}: unsupported address format"
            ))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode().map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

impl FromStr for Address {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
