pub mod error;
pub mod types;
pub mod state_machine;
pub mod pricing;
pub mod config;

pub use error::CoreError;
pub use pricing::Pricing;
pub use state_machine::{SessionEvent, SessionStateMachine, SessionStatus, WalletStatus};
pub use types::{format_remaining, Amount, ChannelId, SessionId, WalletId, SHANNONS_PER_CKB};
