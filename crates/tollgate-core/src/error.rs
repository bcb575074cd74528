use crate::state_machine::{SessionEvent, SessionStatus};

/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid session transition from {from} on {event:?}")]
    InvalidStateTransition {
        from: SessionStatus,
        event: SessionEvent,
    },

    #[error("amount overflow")]
    AmountOverflow,

    #[error("amount underflow: {lhs} - {rhs}")]
    AmountUnderflow { lhs: u128, rhs: u128 },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unknown status: {0}")]
    UnknownStatus(String),
}
