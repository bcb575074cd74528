use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Lifecycle status of a guest session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session exists but no channel has been opened yet.
    Pending,
    /// Channel open is in flight.
    ChannelOpening,
    /// Channel is open and the session is being debited.
    Active,
    /// Paid time ran out.
    Expired,
    /// Channel settlement has been requested.
    Settling,
    /// Channel settlement finished (successfully or not).
    Settled,
    /// Session was ended explicitly.
    Ended,
    /// Wallet could not cover the channel funding.
    InsufficientFunds,
    /// Channel open failed.
    ChannelFailed,
    /// Wallet cells could not be prepared for the channel.
    CellPreparationFailed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ChannelOpening => "channel_opening",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Settling => "settling",
            Self::Settled => "settled",
            Self::Ended => "ended",
            Self::InsufficientFunds => "insufficient_funds",
            Self::ChannelFailed => "channel_failed",
            Self::CellPreparationFailed => "cell_preparation_failed",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Settled
                | Self::Ended
                | Self::InsufficientFunds
                | Self::ChannelFailed
                | Self::CellPreparationFailed
        )
    }

    /// Whether the session never reached an open channel.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds | Self::ChannelFailed | Self::CellPreparationFailed
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "channel_opening" => Ok(Self::ChannelOpening),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "settling" => Ok(Self::Settling),
            "settled" => Ok(Self::Settled),
            "ended" => Ok(Self::Ended),
            "insufficient_funds" => Ok(Self::InsufficientFunds),
            "channel_failed" => Ok(Self::ChannelFailed),
            "cell_preparation_failed" => Ok(Self::CellPreparationFailed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Lifecycle status of a custodial guest wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Created,
    Funded,
    ChannelOpen,
    ChannelFailed,
    Withdrawn,
}

impl WalletStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::ChannelOpen => "channel_open",
            Self::ChannelFailed => "channel_failed",
            Self::Withdrawn => "withdrawn",
        }
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The channel open was dispatched.
    ChannelOpening,
    /// The channel is open; debiting can start.
    Activated,
    /// Paid time elapsed.
    Expired,
    /// The session was ended explicitly.
    Ended,
    /// Settlement was dispatched.
    SettlementStarted,
    /// Settlement finished.
    Settled,
    /// Cell preparation failed before the channel could be opened.
    CellPreparationFailed,
    /// The wallet could not cover channel funding.
    InsufficientFunds,
    /// The channel open failed.
    ChannelFailed,
}

/// Session transition table.
///
/// Valid transitions:
/// - Pending → ChannelOpening | Active | Ended | CellPreparationFailed | InsufficientFunds | ChannelFailed
/// - ChannelOpening → Active | ChannelFailed
/// - Active → Expired | Ended | Settling | Settled
/// - Expired → Settling | Settled
/// - Settling → Settled
pub struct SessionStateMachine;

impl SessionStateMachine {
    /// Attempt a transition. Returns the new status or an error for invalid transitions.
    pub fn transition(
        current: SessionStatus,
        event: SessionEvent,
    ) -> Result<SessionStatus, CoreError> {
        use SessionEvent as E;
        use SessionStatus as S;

        let next = match (current, event) {
            (S::Pending, E::ChannelOpening) => S::ChannelOpening,
            (S::Pending | S::ChannelOpening, E::Activated) => S::Active,
            (S::Pending, E::CellPreparationFailed) => S::CellPreparationFailed,
            (S::Pending, E::InsufficientFunds) => S::InsufficientFunds,
            (S::Pending | S::ChannelOpening, E::ChannelFailed) => S::ChannelFailed,
            (S::Pending | S::Active, E::Ended) => S::Ended,

            (S::Active, E::Expired) => S::Expired,
            (S::Active | S::Expired, E::SettlementStarted) => S::Settling,
            (S::Active | S::Expired | S::Settling, E::Settled) => S::Settled,

            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    event,
                })
            }
        };
        Ok(next)
    }

    /// Check if an event would be accepted in the current status.
    pub fn can_transition(current: SessionStatus, event: SessionEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
