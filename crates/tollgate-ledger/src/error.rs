use crate::types::H256;

/// Ledger-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("RPC failure: {0}")]
    Rpc(String),

    #[error("RPC returned malformed data: {0}")]
    Decode(String),

    #[error("no bare cell with at least {required} shannons available for a split")]
    InsufficientCapacityForSplit { required: u64 },

    #[error("transaction {0} not committed before timeout")]
    ConfirmationTimeout(H256),

    #[error("transaction {hash} rejected: {reason}")]
    TransactionRejected { hash: H256, reason: String },

    #[error("insufficient balance for withdrawal: {available} shannons")]
    InsufficientBalance { available: u128 },

    #[error("no sender address found among recent transactions")]
    NoSenderDetected,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("capacity overflow")]
    CapacityOverflow,
}

impl LedgerError {
    /// Whether the failure is expected to clear up on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::ConfirmationTimeout(_))
    }

    /// Whether the failure reflects a wallet without enough capacity.
    pub fn is_insufficiency(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCapacityForSplit { .. } | Self::InsufficientBalance { .. }
        )
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Rpc(e.to_string())
    }
}

impl From<secp256k1::Error> for LedgerError {
    fn from(e: secp256k1::Error) -> Self {
        Self::Signing(e.to_string())
    }
}
