//! Tollgate ledger layer
//!
//! Everything the session layer needs from the UTXO ledger: the cell and
//! transaction model, canonical serialization and hashing, sighash-all
//! signing, address encoding, an RPC client abstraction with JSON-RPC and
//! in-memory backends, and the two on-chain workers built on top of them:
//! [`CellCapacityManager`] and [`Withdrawer`].

pub mod error;
pub mod types;
pub mod molecule;
pub mod hash;
pub mod address;
pub mod signer;
pub mod keys;
pub mod rpc;
pub mod memory;
pub mod cells;
pub mod withdraw;

pub use address::{Address, Network};
pub use cells::CellCapacityManager;
pub use error::LedgerError;
pub use keys::GuestKey;
pub use memory::MemoryLedger;
pub use rpc::{CkbRpcClient, LedgerClient};
pub use types::{CellOutput, LiveCell, OutPoint, Script, ScriptHashType, Transaction, TxStatus, H256};
pub use withdraw::Withdrawer;
