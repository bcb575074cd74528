use chrono::{TimeDelta, Utc};
use std::sync::Arc;

use tollgate_core::config::ChannelConfig;
use tollgate_core::{Amount, SessionId, SessionStatus, WalletStatus};
use tollgate_ledger::{Address, CellCapacityManager, GuestKey, Withdrawer};

use crate::error::SessionError;
use crate::rates::PricingHandle;
use crate::registry::{NewSession, Session, SessionRegistry};
use crate::store::{GuestWallet, SessionRecord, SessionStore};
use crate::traits::{AccessController, ChannelNetwork};

/// Turns a funded guest wallet into an active session: records the
/// funding, prepares the wallet's cells, opens the channel with the host
/// and registers the session for debiting.
pub struct SessionOpener {
    store: Arc<dyn SessionStore>,
    registry: Arc<SessionRegistry>,
    network: Arc<dyn ChannelNetwork>,
    cells: Arc<CellCapacityManager>,
    withdrawer: Arc<Withdrawer>,
    access: Arc<dyn AccessController>,
    pricing: PricingHandle,
    config: ChannelConfig,
}

impl SessionOpener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<SessionRegistry>,
        network: Arc<dyn ChannelNetwork>,
        cells: Arc<CellCapacityManager>,
        withdrawer: Arc<Withdrawer>,
        access: Arc<dyn AccessController>,
        pricing: impl Into<PricingHandle>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            store,
            registry,
            network,
            cells,
            withdrawer,
            access,
            pricing: pricing.into(),
            config,
        }
    }

    /// Channel funding a wallet balance yields after the setup reserve.
    pub fn channel_funding(&self, balance: Amount) -> Result<Amount, SessionError> {
        let reserve = self.config.setup_reserve()?;
        let required = self.config.min_channel_funding()?;
        let funding = balance.saturating_sub(reserve);
        if balance < reserve || funding < required {
            return Err(SessionError::InsufficientFundingForChannel {
                available: funding,
                required,
            });
        }
        Ok(funding)
    }

    /// Record that `wallet` holds `balance`: create the pending session,
    /// mark the wallet funded and grant the device access.
    pub async fn register_funding(
        &self,
        wallet: &GuestWallet,
        balance: Amount,
    ) -> Result<SessionRecord, SessionError> {
        let now = Utc::now();
        let funding = balance.saturating_sub(self.config.setup_reserve()?);
        let duration = self.pricing.current().duration_for(funding);
        let record = SessionRecord {
            id: SessionId::new(),
            wallet_id: wallet.id,
            channel_id: None,
            guest_address: wallet.address.clone(),
            host_address: self.network.host_address().encode()?,
            device_id: wallet.device_id.clone(),
            funding_amount: funding,
            remaining: funding,
            spent: Amount::ZERO,
            status: SessionStatus::Pending,
            created_at: now,
            expires_at: now + duration,
            ended_at: None,
        };
        self.store.create_session(record.clone())?;
        self.store
            .update_wallet_funded(&wallet.id, balance, record.id, now)?;
        tracing::info!(
            session_id = %record.id,
            wallet_id = %wallet.id,
            balance = %balance,
            minutes = duration.num_minutes(),
            "Wallet funded; session created"
        );

        if !wallet.device_id.is_empty() {
            if let Err(e) = self.access.authorize(&wallet.device_id, duration).await {
                tracing::warn!(session_id = %record.id, device = %wallet.device_id, error = %e, "Access grant failed");
            }
        }
        Ok(record)
    }

    /// Open the channel for a pending session and start debiting it.
    ///
    /// Every failure leaves a failure status on the persisted session.
    pub async fn open(&self, session_id: &SessionId) -> Result<Session, SessionError> {
        let record = self
            .store
            .get_session(session_id)?
            .ok_or(SessionError::NotFound(*session_id))?;
        let wallet = self
            .store
            .get_wallet(&record.wallet_id)?
            .ok_or_else(|| SessionError::WalletNotFound(record.wallet_id.to_string()))?;

        let (key, address) = match decode_wallet(&wallet) {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.fail(&record, SessionStatus::ChannelFailed, e)),
        };

        if wallet.sender_address.is_none() {
            self.remember_sender(&wallet, &address).await;
        }

        let splits = match self
            .cells
            .ensure_minimum_cells(&key, &address, self.config.min_guest_cells)
            .await
        {
            Ok(splits) => splits,
            Err(e) => {
                return Err(self.fail(&record, SessionStatus::CellPreparationFailed, e.into()))
            }
        };

        let client = match self.network.connect(&key) {
            Ok(client) => client,
            Err(e) => return Err(self.fail(&record, SessionStatus::ChannelFailed, e)),
        };
        let balance = match client.balance(&address).await {
            Ok(balance) => balance,
            Err(e) if e.is_transient() => {
                // Fall back to the detected balance less the split fees.
                let fees = Amount::from(self.cells.fee_shannons().saturating_mul(splits as u64));
                let balance = wallet.balance.saturating_sub(fees);
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    balance = %balance,
                    "Balance query failed; using recorded balance"
                );
                balance
            }
            Err(e) => return Err(self.fail(&record, SessionStatus::ChannelFailed, e)),
        };
        let funding = match self.channel_funding(balance) {
            Ok(funding) => funding,
            Err(e) => return Err(self.fail(&record, SessionStatus::InsufficientFunds, e)),
        };

        self.store
            .update_session_status(session_id, SessionStatus::ChannelOpening)?;
        tracing::info!(
            session_id = %session_id,
            funding = %funding,
            host = %self.network.host_address(),
            "Opening channel"
        );

        let host_funding = self.config.host_funding()?;
        let opened = tokio::time::timeout(
            self.config.open_timeout(),
            client.open(self.network.host_address(), funding, host_funding),
        )
        .await
        .unwrap_or_else(|_| Err(SessionError::Timeout("channel open".into())));
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                let err = self.fail(&record, SessionStatus::ChannelFailed, e);
                if let Err(e) = self
                    .store
                    .update_wallet_status(&wallet.id, WalletStatus::ChannelFailed)
                {
                    tracing::warn!(wallet_id = %wallet.id, error = %e, "Failed to persist wallet status");
                }
                if !record.device_id.is_empty() {
                    if let Err(e) = self.access.deauthorize(&record.device_id).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Access revocation failed");
                    }
                }
                return Err(err);
            }
        };

        let pricing = self.pricing.current();
        let expires_at = record.created_at + pricing.duration_for(funding);
        self.store.modify_session(session_id, &mut |r| {
            r.channel_id = Some(channel);
            r.status = SessionStatus::Active;
            r.funding_amount = funding;
            r.remaining = funding;
            r.expires_at = expires_at;
        })?;
        self.store
            .update_wallet_status(&wallet.id, WalletStatus::ChannelOpen)?;

        // Time between funding and channel open is billed up front.
        let now = Utc::now();
        let catch_up = pricing.catch_up(now - record.created_at)?.min(funding);
        let paid = match client.pay(&channel, catch_up).await {
            Ok(()) => catch_up,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Catch-up payment failed");
                Amount::ZERO
            }
        };

        let new = NewSession::new(
            channel,
            client.clone(),
            address.clone(),
            self.network.host_address().clone(),
            funding,
        )
        .with_id(*session_id)
        .with_wallet(wallet.id)
        .with_device(record.device_id.clone())
        .with_created_at(record.created_at);
        self.registry.create(new).await?;
        let duration = (expires_at - now).max(TimeDelta::zero());
        let session = self
            .registry
            .activate_at(session_id, now, duration, None, paid)
            .await?;

        if let Err(e) = self.store.update_session_balance(session_id, paid) {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to persist catch-up payment");
        }
        match client.balance(&address).await {
            Ok(balance) => {
                if let Err(e) = self.store.update_wallet_balance(&wallet.id, balance) {
                    tracing::warn!(wallet_id = %wallet.id, error = %e, "Failed to persist wallet balance");
                }
            }
            Err(e) => tracing::debug!(wallet_id = %wallet.id, error = %e, "Balance refresh failed"),
        }

        tracing::info!(
            session_id = %session_id,
            channel = %channel.short(),
            catch_up = %paid,
            expires_at = %session.expires_at(),
            "Session active"
        );
        Ok(session)
    }

    async fn remember_sender(&self, wallet: &GuestWallet, address: &Address) {
        let sender = match self.withdrawer.detect_sender_address(address).await {
            Ok(sender) => sender,
            Err(e) => {
                tracing::warn!(wallet_id = %wallet.id, error = %e, "Sender detection failed");
                return;
            }
        };
        match sender.encode() {
            Ok(encoded) => {
                if let Err(e) = self.store.update_wallet_sender(&wallet.id, &encoded) {
                    tracing::warn!(wallet_id = %wallet.id, error = %e, "Failed to store sender address");
                }
            }
            Err(e) => tracing::warn!(wallet_id = %wallet.id, error = %e, "Sender address not encodable"),
        }
    }

    fn fail(&self, record: &SessionRecord, status: SessionStatus, err: SessionError) -> SessionError {
        tracing::error!(session_id = %record.id, status = %status, error = %err, "Session open failed");
        if let Err(e) = self.store.update_session_status(&record.id, status) {
            tracing::warn!(session_id = %record.id, error = %e, "Failed to persist failure status");
        }
        err
    }
}

fn decode_wallet(wallet: &GuestWallet) -> Result<(GuestKey, Address), SessionError> {
    let address = Address::parse(&wallet.address)?;
    let key = GuestKey::from_hex(&wallet.secret_key_hex)?;
    if key.address(address.network()) != address {
        return Err(SessionError::InvalidInput(format!(
            "wallet {} key does not match its address",
            wallet.id
        )));
    }
    Ok((key, address))
}
