use crate::traits::{ChannelEventHandler, ChannelProposal, ChannelUpdate};

/// Accepts every channel proposal and every state update.
///
/// No signature, amount or counterparty checks are made. Any guest that
/// can reach the host can open a channel with it and any update the peer
/// proposes is countersigned.
#[derive(Debug)]
pub struct AcceptAllHandler;

impl AcceptAllHandler {
    pub fn new() -> Self {
        tracing::warn!(
            "Channel handler accepts all proposals and updates without verification"
        );
        Self
    }
}

impl Default for AcceptAllHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelEventHandler for AcceptAllHandler {
    fn on_proposal(&self, proposal: &ChannelProposal) -> bool {
        tracing::info!(
            proposer = %proposal.proposer,
            funding = %proposal.proposer_funding,
            host_funding = %proposal.host_funding,
            "Accepting channel proposal"
        );
        true
    }

    fn on_update(&self, update: &ChannelUpdate) -> bool {
        tracing::debug!(
            channel = %update.channel.short(),
            version = update.version,
            guest_balance = %update.guest_balance,
            host_balance = %update.host_balance,
            "Accepting channel update"
        );
        true
    }
}
