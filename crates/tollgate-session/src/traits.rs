use async_trait::async_trait;
use chrono::TimeDelta;
use std::sync::Arc;

use tollgate_core::{Amount, ChannelId};
use tollgate_ledger::{Address, GuestKey};

use crate::error::SessionError;

/// An incoming request to open a channel with the host.
#[derive(Debug, Clone)]
pub struct ChannelProposal {
    /// Proposing party.
    pub proposer: Address,
    /// Amount the proposer locks into the channel.
    pub proposer_funding: Amount,
    /// Amount the host is asked to lock.
    pub host_funding: Amount,
}

/// A proposed off-chain balance update.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub channel: ChannelId,
    /// State version after the update.
    pub version: u64,
    /// Guest balance after the update.
    pub guest_balance: Amount,
    /// Host balance after the update.
    pub host_balance: Amount,
}

/// Decides on incoming proposals and state updates.
///
/// Called from the channel client's own tasks, so implementations must be
/// cheap and must not block.
pub trait ChannelEventHandler: Send + Sync {
    /// Return `true` to accept the proposal.
    fn on_proposal(&self, proposal: &ChannelProposal) -> bool;

    /// Return `true` to accept the update.
    fn on_update(&self, update: &ChannelUpdate) -> bool;
}

/// One party's handle on the payment-channel network.
///
/// The channel protocol (handshake, signatures, disputes) lives behind this
/// trait; the session layer only sequences calls to it.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Address this client funds channels from.
    fn address(&self) -> &Address;

    /// Open a channel with `peer` and return its handle.
    async fn open(
        &self,
        peer: &Address,
        self_funding: Amount,
        peer_funding: Amount,
    ) -> Result<ChannelId, SessionError>;

    /// Transfer `amount` to the peer off-chain.
    async fn pay(&self, channel: &ChannelId, amount: Amount) -> Result<(), SessionError>;

    /// Cooperatively close the channel with the latest agreed balances.
    async fn settle(&self, channel: &ChannelId) -> Result<(), SessionError>;

    /// Close unilaterally through the on-chain dispute path.
    async fn force_close(&self, channel: &ChannelId) -> Result<(), SessionError>;

    /// On-chain balance of `address`.
    async fn balance(&self, address: &Address) -> Result<Amount, SessionError>;
}

/// Host-side view of the channel network.
///
/// Hands out per-wallet clients (each guest wallet signs its own channel
/// operations) and routes incoming proposals and updates to the registered
/// handler.
pub trait ChannelNetwork: Send + Sync {
    /// Client acting on behalf of the wallet owning `key`.
    fn connect(&self, key: &GuestKey) -> Result<Arc<dyn ChannelClient>, SessionError>;

    /// Install the handler for proposals and updates addressed to the host.
    fn register_handler(&self, handler: Arc<dyn ChannelEventHandler>);

    /// Host address that guests open channels with.
    fn host_address(&self) -> &Address;
}

/// Network access control (captive portal, firewall, router).
#[async_trait]
pub trait AccessController: Send + Sync {
    /// Grant `device` access for `duration`.
    async fn authorize(&self, device: &str, duration: TimeDelta) -> Result<(), SessionError>;

    /// Revoke access for `device`.
    async fn deauthorize(&self, device: &str) -> Result<(), SessionError>;
}
