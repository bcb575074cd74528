use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use tollgate_core::{
    format_remaining, Amount, Pricing, SessionId, SessionStatus, WalletId, WalletStatus, SHANNONS_PER_CKB,
};
use tollgate_ledger::{GuestKey, Network};

use crate::coordinator::SettlementCoordinator;
use crate::error::SessionError;
use crate::rates::PricingHandle;
use crate::registry::{extend_locked, SessionRegistry};
use crate::store::{GuestWallet, SessionRecord, SessionStore};

/// A persisted session as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub wallet_id: WalletId,
    pub channel_id: Option<String>,
    pub device_id: String,
    pub funding_amount: Amount,
    pub spent: Amount,
    pub remaining: Amount,
    pub status: SessionStatus,
    /// `H:MM:SS` or `M:SS`.
    pub time_remaining: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionView {
    pub fn from_record(record: &SessionRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            wallet_id: record.wallet_id,
            channel_id: record.channel_id.map(|c| c.to_hex()),
            device_id: record.device_id.clone(),
            funding_amount: record.funding_amount,
            spent: record.spent,
            remaining: record.remaining,
            status: record.display_status(now),
            time_remaining: format_remaining(record.remaining_time(now)),
            created_at: record.created_at,
            expires_at: record.expires_at,
            ended_at: record.ended_at,
        }
    }
}

/// A guest wallet without its key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletView {
    pub id: WalletId,
    pub address: String,
    pub funding_threshold: Amount,
    pub balance: Amount,
    pub session_id: Option<SessionId>,
    pub device_id: String,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
}

impl From<&GuestWallet> for WalletView {
    fn from(w: &GuestWallet) -> Self {
        Self {
            id: w.id,
            address: w.address.clone(),
            funding_threshold: w.funding_threshold,
            balance: w.balance,
            session_id: w.session_id,
            device_id: w.device_id.clone(),
            status: w.status,
            created_at: w.created_at,
            funded_at: w.funded_at,
        }
    }
}

/// Caller-facing session lifecycle operations.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    registry: Arc<SessionRegistry>,
    coordinator: Arc<SettlementCoordinator>,
    pricing: PricingHandle,
    network: Network,
    funding_threshold: Amount,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<SessionRegistry>,
        coordinator: Arc<SettlementCoordinator>,
        pricing: impl Into<PricingHandle>,
        network: Network,
        funding_threshold: Amount,
    ) -> Self {
        Self {
            store,
            registry,
            coordinator,
            pricing: pricing.into(),
            network,
            funding_threshold,
        }
    }

    /// Generate a fresh custodial wallet for `device_id` and persist it as `created`.
    pub fn create_wallet(&self, device_id: &str) -> Result<WalletView, SessionError> {
        let key = GuestKey::generate();
        let wallet = GuestWallet {
            id: WalletId::new(),
            address: key.address(self.network).encode()?,
            secret_key_hex: key.to_hex().to_string(),
            funding_threshold: self.funding_threshold,
            balance: Amount::ZERO,
            sender_address: None,
            session_id: None,
            device_id: device_id.to_string(),
            status: WalletStatus::Created,
            created_at: Utc::now(),
            funded_at: None,
        };
        self.store.create_wallet(wallet.clone())?;
        tracing::info!(wallet_id = %wallet.id, address = %wallet.address, "Guest wallet created");
        Ok(WalletView::from(&wallet))
    }

    pub fn get_wallet(&self, id: &WalletId) -> Result<WalletView, SessionError> {
        self.store
            .get_wallet(id)?
            .map(|w| WalletView::from(&w))
            .ok_or_else(|| SessionError::WalletNotFound(id.to_string()))
    }

    /// All persisted sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionView>, SessionError> {
        let now = Utc::now();
        let mut records = self.store.list_sessions()?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .iter()
            .map(|r| SessionView::from_record(r, now))
            .collect())
    }

    pub fn get_session(&self, id: &SessionId) -> Result<SessionView, SessionError> {
        let record = self
            .store
            .get_session(id)?
            .ok_or(SessionError::NotFound(*id))?;
        Ok(SessionView::from_record(&record, Utc::now()))
    }

    /// Buy more time: pay `amount` over the session's channel and push its
    /// expiry out by the minutes that buys.
    pub async fn extend(
        &self,
        id: &SessionId,
        amount: Amount,
    ) -> Result<SessionView, SessionError> {
        if amount.is_zero() {
            return Err(SessionError::InvalidInput("extension amount must be positive".into()));
        }
        let extra = self.pricing.current().duration_for(amount);

        let mut state = self.registry.lock().await;
        let session = state
            .get(id)
            .filter(|s| s.status == SessionStatus::Active)
            .ok_or(SessionError::NotFound(*id))?;
        if session.total_paid.checked_add(amount)? > session.funding_amount {
            return Err(SessionError::FundingExceeded {
                requested: amount,
                remaining: session.remaining(),
            });
        }
        let client = session.client.clone();
        let channel = session.channel;
        client.pay(&channel, amount).await?;

        let session = extend_locked(&mut state, id, extra, amount)?;
        let record = self.store.extend_session(id, extra, session.total_paid)?;
        drop(state);
        Ok(SessionView::from_record(&record, Utc::now()))
    }

    /// End a session explicitly. Settlement and withdrawal continue in the
    /// background; the returned view reads `settling`.
    /// Losing the race to a settlement already under way is not an error.
    pub async fn end(&self, id: &SessionId) -> Result<SessionView, SessionError> {
        if self.store.get_session(id)?.is_none() {
            return Err(SessionError::NotFound(*id));
        }
        if !self.coordinator.end_session(id).await? {
            let record = self
                .store
                .get_session(id)?
                .ok_or(SessionError::NotFound(*id))?;
            match record.status {
                SessionStatus::Expired | SessionStatus::Settling | SessionStatus::Settled => {}
                status => {
                    return Err(SessionError::NotActive {
                        id: *id,
                        status: status.to_string(),
                    })
                }
            }
        }
        self.get_session(id)
    }

    /// Current hourly price in whole CKB.
    pub fn rate_per_hour(&self) -> u64 {
        self.pricing.per_hour_ckb().unwrap_or_else(|| {
            let per_hour = self.pricing.current().rate_per_tick().shannons() * 60 / SHANNONS_PER_CKB;
            u64::try_from(per_hour).unwrap_or(u64::MAX)
        })
    }

    /// Persist a new hourly price and apply it from the next debit on.
    /// Running sessions keep the expiry they were sold.
    pub fn set_rate_per_hour(&self, ckb: u64) -> Result<u64, SessionError> {
        if ckb == 0 {
            return Err(SessionError::InvalidInput("rate_per_hour must be at least 1".into()));
        }
        Pricing::from_hourly_ckb(ckb)?;
        self.store.set_rate_per_hour(ckb)?;
        self.pricing.set_hourly_ckb(ckb)?;
        Ok(ckb)
    }

    /// Sweep the session's wallet to `to`, or back to whoever funded it.
    pub async fn withdraw(
        &self,
        id: &SessionId,
        to: Option<&str>,
    ) -> Result<String, SessionError> {
        let hash = self.coordinator.manual_withdraw(id, to).await?;
        Ok(hash.to_string())
    }
}
