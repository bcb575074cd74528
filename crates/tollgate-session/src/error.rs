use tollgate_core::{Amount, ChannelId, CoreError, SessionId, WalletId};
use tollgate_ledger::LedgerError;

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Session-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session already registered: {0}")]
    AlreadyExists(SessionId),

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("session {id} is {status}, expected active")]
    NotActive { id: SessionId, status: String },

    #[error("payment of {requested} exceeds remaining funding {remaining}")]
    FundingExceeded { requested: Amount, remaining: Amount },

    #[error("insufficient funding for channel: have {available}, need {required}")]
    InsufficientFundingForChannel { available: Amount, required: Amount },

    #[error("wallet {0} already withdrawn")]
    AlreadyWithdrawn(WalletId),

    #[error("channel {0} is not open")]
    ChannelClosed(ChannelId),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("access control error: {0}")]
    Access(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl SessionError {
    /// Failures worth retrying on the next natural cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Channel(_) => true,
            Self::Ledger(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::WalletNotFound(_) | Self::Store(StoreError::NotFound(_))
        )
    }

    /// Failures caused by a caller-supplied value or a wallet without enough funds.
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::NotActive { .. }
            | Self::FundingExceeded { .. }
            | Self::InsufficientFundingForChannel { .. }
            | Self::AlreadyWithdrawn(_)
            | Self::InvalidInput(_) => true,
            Self::Ledger(e) => {
                e.is_insufficiency()
                    || matches!(e, LedgerError::InvalidAddress(_) | LedgerError::NoSenderDetected)
            }
            Self::Core(_) => true,
            _ => false,
        }
    }
}
