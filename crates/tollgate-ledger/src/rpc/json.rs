//! JSON wire types of the node and indexer RPC. Numbers are `0x`-prefixed hex.

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::types::{
    decode_hex, CellDep, CellInput, CellOutput, DepType, LiveCell, OutPoint, Script,
    ScriptHashType, Transaction, TxStatus, H256,
};

pub fn hex_u64(value: u64) -> String {
    format!("{:#x}", value)
}

pub fn parse_u64(s: &str) -> Result<u64, LedgerError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| LedgerError::Decode(format!("bad number {s:?}: {e}")))
}

fn parse_u32(s: &str) -> Result<u32, LedgerError> {
    u32::try_from(parse_u64(s)?).map_err(|_| LedgerError::Decode(format!("{s} exceeds u32")))
}

fn hex_bytes(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub id: u64,
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct Response<T> {
    pub result: Option<T>,
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonScript {
    pub code_hash: String,
    pub hash_type: String,
    pub args: String,
}

impl From<&Script> for JsonScript {
    fn from(s: &Script) -> Self {
        Self {
            code_hash: s.code_hash.to_string(),
            hash_type: s.hash_type.as_str().to_string(),
            args: hex_bytes(&s.args),
        }
    }
}

impl TryFrom<JsonScript> for Script {
    type Error = LedgerError;

    fn try_from(s: JsonScript) -> Result<Self, Self::Error> {
        Ok(Self {
            code_hash: s.code_hash.parse()?,
            hash_type: s.hash_type.parse::<ScriptHashType>()?,
            args: decode_hex(&s.args)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonOutPoint {
    pub tx_hash: String,
    pub index: String,
}

impl From<&OutPoint> for JsonOutPoint {
    fn from(o: &OutPoint) -> Self {
        Self {
            tx_hash: o.tx_hash.to_string(),
            index: hex_u64(o.index as u64),
        }
    }
}

impl TryFrom<JsonOutPoint> for OutPoint {
    type Error = LedgerError;

    fn try_from(o: JsonOutPoint) -> Result<Self, Self::Error> {
        Ok(Self {
            tx_hash: o.tx_hash.parse()?,
            index: parse_u32(&o.index)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonCellInput {
    pub since: String,
    pub previous_output: JsonOutPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonCellDep {
    pub out_point: JsonOutPoint,
    pub dep_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonCellOutput {
    pub capacity: String,
    pub lock: JsonScript,
    #[serde(rename = "type")]
    pub type_script: Option<JsonScript>,
}

impl From<&CellOutput> for JsonCellOutput {
    fn from(o: &CellOutput) -> Self {
        Self {
            capacity: hex_u64(o.capacity),
            lock: (&o.lock).into(),
            type_script: o.type_script.as_ref().map(Into::into),
        }
    }
}

impl TryFrom<JsonCellOutput> for CellOutput {
    type Error = LedgerError;

    fn try_from(o: JsonCellOutput) -> Result<Self, Self::Error> {
        Ok(Self {
            capacity: parse_u64(&o.capacity)?,
            lock: o.lock.try_into()?,
            type_script: o.type_script.map(TryInto::try_into).transpose()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTransaction {
    pub version: String,
    pub cell_deps: Vec<JsonCellDep>,
    pub header_deps: Vec<String>,
    pub inputs: Vec<JsonCellInput>,
    pub outputs: Vec<JsonCellOutput>,
    pub outputs_data: Vec<String>,
    pub witnesses: Vec<String>,
}

impl From<&Transaction> for JsonTransaction {
    fn from(tx: &Transaction) -> Self {
        Self {
            version: hex_u64(tx.version as u64),
            cell_deps: tx
                .cell_deps
                .iter()
                .map(|d| JsonCellDep {
                    out_point: (&d.out_point).into(),
                    dep_type: match d.dep_type {
                        DepType::Code => "code".into(),
                        DepType::DepGroup => "dep_group".into(),
                    },
                })
                .collect(),
            header_deps: tx.header_deps.iter().map(H256::to_string).collect(),
            inputs: tx
                .inputs
                .iter()
                .map(|i| JsonCellInput {
                    since: hex_u64(i.since),
                    previous_output: (&i.previous_output).into(),
                })
                .collect(),
            outputs: tx.outputs.iter().map(Into::into).collect(),
            outputs_data: tx.outputs_data.iter().map(|d| hex_bytes(d)).collect(),
            witnesses: tx.witnesses.iter().map(|w| hex_bytes(w)).collect(),
        }
    }
}

impl TryFrom<JsonTransaction> for Transaction {
    type Error = LedgerError;

    fn try_from(tx: JsonTransaction) -> Result<Self, Self::Error> {
        Ok(Self {
            version: parse_u32(&tx.version)?,
            cell_deps: tx
                .cell_deps
                .into_iter()
                .map(|d| {
                    let dep_type = match d.dep_type.as_str() {
                        "code" => DepType::Code,
                        "dep_group" => DepType::DepGroup,
                        other => {
                            return Err(LedgerError::Decode(format!("unknown dep type {other}")))
                        }
                    };
                    Ok(CellDep {
                        out_point: d.out_point.try_into()?,
                        dep_type,
                    })
                })
                .collect::<Result<_, LedgerError>>()?,
            header_deps: tx
                .header_deps
                .iter()
                .map(|h| h.parse())
                .collect::<Result<_, _>>()?,
            inputs: tx
                .inputs
                .into_iter()
                .map(|i| {
                    Ok(CellInput {
                        since: parse_u64(&i.since)?,
                        previous_output: i.previous_output.try_into()?,
                    })
                })
                .collect::<Result<_, LedgerError>>()?,
            outputs: tx
                .outputs
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            outputs_data: tx
                .outputs_data
                .iter()
                .map(|d| decode_hex(d))
                .collect::<Result<_, _>>()?,
            witnesses: tx
                .witnesses
                .iter()
                .map(|w| decode_hex(w))
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonCell {
    pub output: JsonCellOutput,
    #[serde(default)]
    pub output_data: Option<String>,
    pub out_point: JsonOutPoint,
}

impl TryFrom<JsonCell> for LiveCell {
    type Error = LedgerError;

    fn try_from(c: JsonCell) -> Result<Self, Self::Error> {
        Ok(Self {
            out_point: c.out_point.try_into()?,
            output: c.output.try_into()?,
            data: c.output_data.as_deref().map(decode_hex).transpose()?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonPage<T> {
    pub objects: Vec<T>,
    pub last_cursor: String,
}

#[derive(Debug, Deserialize)]
pub struct JsonTxRecord {
    pub tx_hash: String,
    pub block_number: String,
}

#[derive(Debug, Deserialize)]
pub struct JsonCapacity {
    pub capacity: String,
}

#[derive(Debug, Deserialize)]
pub struct JsonTxStatus {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl From<JsonTxStatus> for TxStatus {
    fn from(s: JsonTxStatus) -> Self {
        match s.status.as_str() {
            "pending" => Self::Pending,
            "proposed" => Self::Proposed,
            "committed" => Self::Committed,
            "rejected" => Self::Rejected(s.reason.unwrap_or_default()),
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonTxWithStatus {
    pub transaction: Option<JsonTransaction>,
    pub tx_status: JsonTxStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_numbers() {
        assert_eq!(hex_u64(0), "0x0");
        assert_eq!(hex_u64(255), "0xff");
        assert_eq!(parse_u64("0x174876e800").unwrap(), 100_000_000_000);
        assert!(parse_u64("0xzz").is_err());
    }

    #[test]
    fn test_cell_from_indexer_json() {
        let raw = serde_json::json!({
            "output": {
                "capacity": "0x2540be400",
                "lock": {
                    "code_hash": "0x9bd7e06f3ecf4be0f2fcd2188b23f1b9fcc88e5d4b65a8637b17723bbda3cce8",
                    "hash_type": "type",
                    "args": "0xb39bbc0b3673c7d36450bc14cfcdad2d559c6c64"
                },
                "type": null
            },
            "output_data": "0x",
            "out_point": {
                "tx_hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
                "index": "0x1"
            },
            "block_number": "0x10",
            "tx_index": "0x0"
        });
        let cell: JsonCell = serde_json::from_value(raw).unwrap();
        let cell: LiveCell = cell.try_into().unwrap();
        assert_eq!(cell.capacity(), 10_000_000_000);
        assert_eq!(cell.out_point.index, 1);
        assert!(cell.is_bare());
        assert!(cell.data.is_empty());
    }

    #[test]
    fn test_tx_status_mapping() {
        let rejected: TxStatus = JsonTxStatus {
            status: "rejected".into(),
            reason: Some("double spend".into()),
        }
        .into();
        assert_eq!(rejected, TxStatus::Rejected("double spend".into()));
        let other: TxStatus = JsonTxStatus {
            status: "mystery".into(),
            reason: None,
        }
        .into();
        assert_eq!(other, TxStatus::Unknown);
    }
}
