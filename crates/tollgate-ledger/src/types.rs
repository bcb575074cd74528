use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// 32-byte hash (transaction hashes, script code hashes).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct H256(pub [u8; 32]);

impl H256 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for H256 {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LedgerError::Decode(format!("expected 32-byte hash, got {s}")))?;
        Ok(Self(arr))
    }
}

/// How a script's `code_hash` is matched against deployed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptHashType {
    Data,
    Type,
    Data1,
    Data2,
}

impl ScriptHashType {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Type => 1,
            Self::Data1 => 2,
            Self::Data2 => 4,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, LedgerError> {
        match b {
            0 => Ok(Self::Data),
            1 => Ok(Self::Type),
            2 => Ok(Self::Data1),
            4 => Ok(Self::Data2),
            other => Err(LedgerError::Decode(format!("unknown hash type {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Type => "type",
            Self::Data1 => "data1",
            Self::Data2 => "data2",
        }
    }
}

impl FromStr for ScriptHashType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Self::Data),
            "type" => Ok(Self::Type),
            "data1" => Ok(Self::Data1),
            "data2" => Ok(Self::Data2),
            other => Err(LedgerError::Decode(format!("unknown hash type {other}"))),
        }
    }
}

/// A lock or type script: the spending predicate of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Script {
    pub code_hash: H256,
    pub hash_type: ScriptHashType,
    pub args: Vec<u8>,
}

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: H256,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInput {
    pub since: u64,
    pub previous_output: OutPoint,
}

impl CellInput {
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            since: 0,
            previous_output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepType {
    Code,
    DepGroup,
}

impl DepType {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Code => 0,
            Self::DepGroup => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDep {
    pub out_point: OutPoint,
    pub dep_type: DepType,
}

/// A transaction output: capacity plus lock and optional type script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOutput {
    /// Capacity in shannons.
    pub capacity: u64,
    pub lock: Script,
    pub type_script: Option<Script>,
}

impl CellOutput {
    pub fn bare(capacity: u64, lock: Script) -> Self {
        Self {
            capacity,
            lock,
            type_script: None,
        }
    }
}

/// An unspent output as returned by the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveCell {
    pub out_point: OutPoint,
    pub output: CellOutput,
    pub data: Vec<u8>,
}

impl LiveCell {
    /// A bare cell carries no type script and is freely splittable.
    pub fn is_bare(&self) -> bool {
        self.output.type_script.is_none()
    }

    pub fn capacity(&self) -> u64 {
        self.output.capacity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub cell_deps: Vec<CellDep>,
    pub header_deps: Vec<H256>,
    pub inputs: Vec<CellInput>,
    pub outputs: Vec<CellOutput>,
    pub outputs_data: Vec<Vec<u8>>,
    pub witnesses: Vec<Vec<u8>>,
}

impl Transaction {
    /// Hash of the raw transaction (witnesses excluded).
    pub fn hash(&self) -> H256 {
        crate::hash::blake2b_256(&crate::molecule::serialize_raw_transaction(self))
    }

    pub fn total_output_capacity(&self) -> u128 {
        self.outputs.iter().map(|o| o.capacity as u128).sum()
    }
}

/// Commitment status reported for a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Proposed,
    Committed,
    Unknown,
    Rejected(String),
}

/// A transaction together with its status.
#[derive(Debug, Clone)]
pub struct TransactionWithStatus {
    pub transaction: Transaction,
    pub status: TxStatus,
}

/// One entry of an address's transaction history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub tx_hash: H256,
    pub block_number: u64,
}

/// One page of indexer cells.
#[derive(Debug, Clone, Default)]
pub struct CellPage {
    pub cells: Vec<LiveCell>,
    /// Cursor to pass for the next page; empty when exhausted.
    pub last_cursor: String,
}

pub(crate) fn decode_hex(s: &str) -> Result<Vec<u8>, LedgerError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| LedgerError::Decode(format!("bad hex {s:?}: {e}")))
}
