//! Tollgate session layer
//!
//! Owns the in-memory view of every paid session and the background work
//! around it: the per-minute [`MicropaymentScheduler`], exactly-once
//! settlement through the [`SettlementCoordinator`], and the
//! [`SessionOpener`] that turns a funded wallet into an open channel.
//! The payment channel itself, network access control and persistence are
//! reached through the traits in [`traits`] and [`store`].

pub mod error;
pub mod traits;
pub mod store;
pub mod registry;
pub mod rates;
pub mod supervisor;
pub mod coordinator;
pub mod scheduler;
pub mod opener;
pub mod service;
pub mod adapters;

#[cfg(test)]
mod testing;

pub use coordinator::{SettlementCoordinator, SettlementTrigger};
pub use error::{SessionError, StoreError};
pub use opener::SessionOpener;
pub use rates::PricingHandle;
pub use registry::{NewSession, Session, SessionRegistry};
pub use scheduler::{MicropaymentScheduler, TickReport};
pub use service::{SessionService, SessionView, WalletView};
pub use store::{GuestWallet, MemoryStore, SessionRecord, SessionStore};
pub use supervisor::TaskSupervisor;
pub use traits::{AccessController, ChannelClient, ChannelEventHandler, ChannelNetwork};
