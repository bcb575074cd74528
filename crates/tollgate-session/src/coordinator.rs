use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tollgate_core::config::SettlementConfig;
use tollgate_core::{SessionId, SessionStatus, WalletId, WalletStatus};
use tollgate_ledger::{Address, GuestKey, Withdrawer, H256};

use crate::error::SessionError;
use crate::registry::{Session, SessionRegistry};
use crate::store::SessionStore;
use crate::supervisor::TaskSupervisor;
use crate::traits::AccessController;

/// Extra time a settlement task gets beyond the settle call's own timeout,
/// for the store write and the access revocation.
const SETTLEMENT_TASK_MARGIN: Duration = Duration::from_secs(30);

/// Why a session is being settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementTrigger {
    /// Paid time ran out.
    Expired,
    /// Remaining funding cannot cover another tick.
    InsufficientFunds,
    /// Explicit end request.
    Ended,
}

impl fmt::Display for SettlementTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Expired => "expired",
            Self::InsufficientFunds => "insufficient_funds",
            Self::Ended => "ended",
        })
    }
}

/// Settles each session's channel exactly once and reclaims what is left
/// in its wallet.
///
/// Every entry point first takes the session out of the registry; only the
/// caller that wins that removal schedules settlement. Settlement and
/// withdrawal run on the [`TaskSupervisor`], never on the caller's path.
pub struct SettlementCoordinator {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn SessionStore>,
    access: Arc<dyn AccessController>,
    withdrawer: Arc<Withdrawer>,
    supervisor: TaskSupervisor,
    config: SettlementConfig,
}

impl SettlementCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn SessionStore>,
        access: Arc<dyn AccessController>,
        withdrawer: Arc<Withdrawer>,
        supervisor: TaskSupervisor,
        config: SettlementConfig,
    ) -> Self {
        Self {
            registry,
            store,
            access,
            withdrawer,
            supervisor,
            config,
        }
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// Explicit end.
    ///
    /// Returns `Ok(false)` when the session already left the registry, which
    /// means another trigger got there first.
    pub async fn end_session(self: &Arc<Self>, id: &SessionId) -> Result<bool, SessionError> {
        let session = match self.registry.end(id).await {
            Ok(session) => session,
            Err(SessionError::NotFound(_)) => {
                tracing::debug!(session_id = %id, "Session already settling");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        self.schedule_settlement(session, SettlementTrigger::Ended);
        Ok(true)
    }

    /// Dispatch settlement of a session already removed from the registry.
    ///
    /// Persists `settling` before returning and does not await, so it is
    /// safe to call while holding the registry lock.
    pub fn schedule_settlement(self: &Arc<Self>, session: Session, trigger: SettlementTrigger) {
        tracing::info!(
            session_id = %session.id,
            channel = %session.channel.short(),
            trigger = %trigger,
            total_paid = %session.total_paid,
            "Scheduling settlement"
        );
        if let Err(e) = self
            .store
            .update_session_status(&session.id, SessionStatus::Settling)
        {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to persist settling status");
        }
        let this = self.clone();
        let timeout = self.config.settle_timeout() + SETTLEMENT_TASK_MARGIN;
        self.supervisor.spawn("settlement", timeout, async move {
            this.settle(session, trigger).await;
        });
    }

    async fn settle(self: Arc<Self>, session: Session, trigger: SettlementTrigger) {
        let id = session.id;

        // A failed settle does not stop the session from reaching `settled`
        // or the wallet from being swept.
        match tokio::time::timeout(
            self.config.settle_timeout(),
            session.client.settle(&session.channel),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::info!(session_id = %id, channel = %session.channel.short(), %trigger, "Channel settled")
            }
            Ok(Err(e)) => {
                tracing::error!(session_id = %id, error = %e, "Channel settlement failed")
            }
            Err(_) => tracing::error!(
                session_id = %id,
                timeout_secs = self.config.settle_timeout().as_secs(),
                "Channel settlement timed out"
            ),
        }

        if let Err(e) = self.store.settle_session(&id, session.total_paid, Utc::now()) {
            tracing::error!(session_id = %id, error = %e, "Failed to persist settled status");
        }

        if !session.device_id.is_empty() {
            if let Err(e) = self.access.deauthorize(&session.device_id).await {
                tracing::warn!(session_id = %id, device = %session.device_id, error = %e, "Access revocation failed");
            }
        }

        self.schedule_withdrawal(session.wallet_id, id);
    }

    fn schedule_withdrawal(self: &Arc<Self>, wallet_id: WalletId, session_id: SessionId) {
        let this = self.clone();
        self.supervisor
            .spawn("withdrawal", self.config.withdraw_timeout(), async move {
                match this.withdraw_with_retry(&wallet_id).await {
                    Ok(hash) => tracing::info!(
                        session_id = %session_id,
                        wallet_id = %wallet_id,
                        tx_hash = %hash,
                        "Wallet funds returned"
                    ),
                    Err(e) => tracing::error!(
                        session_id = %session_id,
                        wallet_id = %wallet_id,
                        error = %e,
                        "Withdrawal failed; funds remain reachable through manual withdraw"
                    ),
                }
            });
    }

    /// Withdraw with a wait before every attempt, giving the settlement
    /// transaction time to confirm. Gives up after the last configured wait.
    pub async fn withdraw_with_retry(&self, wallet_id: &WalletId) -> Result<H256, SessionError> {
        let waits = self.config.withdraw_retry_waits();
        let attempts = waits.len();
        let mut last_error = None;
        for (attempt, wait) in waits.into_iter().enumerate() {
            tokio::time::sleep(wait).await;
            match self.withdraw_wallet(wallet_id, None).await {
                Ok(hash) => return Ok(hash),
                Err(e @ (SessionError::AlreadyWithdrawn(_) | SessionError::WalletNotFound(_))) => {
                    return Err(e)
                }
                Err(e) => {
                    tracing::warn!(
                        wallet_id = %wallet_id,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "Withdrawal attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| SessionError::InvalidInput("no withdrawal attempts configured".into())))
    }

    /// Manual withdrawal for a session's wallet, to `to` or to the funder.
    ///
    /// Refused while the session is still live and once the wallet has been
    /// withdrawn.
    pub async fn manual_withdraw(
        &self,
        session_id: &SessionId,
        to: Option<&str>,
    ) -> Result<H256, SessionError> {
        let record = self
            .store
            .get_session(session_id)?
            .ok_or(SessionError::NotFound(*session_id))?;
        if self.registry.get(session_id).await.is_some() {
            return Err(SessionError::NotActive {
                id: *session_id,
                status: "live; end it before withdrawing".into(),
            });
        }
        tracing::info!(session_id = %session_id, wallet_id = %record.wallet_id, "Manual withdrawal requested");
        self.withdraw_wallet(&record.wallet_id, to).await
    }

    /// One withdrawal attempt: sweep the wallet to `to`, the stored sender,
    /// or a freshly detected sender, in that order.
    pub async fn withdraw_wallet(
        &self,
        wallet_id: &WalletId,
        to: Option<&str>,
    ) -> Result<H256, SessionError> {
        let wallet = self
            .store
            .get_wallet(wallet_id)?
            .ok_or_else(|| SessionError::WalletNotFound(wallet_id.to_string()))?;
        if wallet.status == WalletStatus::Withdrawn {
            return Err(SessionError::AlreadyWithdrawn(*wallet_id));
        }

        let key = GuestKey::from_hex(&wallet.secret_key_hex)?;
        let from = Address::parse(&wallet.address)?;
        let destination = match (to, wallet.sender_address.as_deref()) {
            (Some(to), _) => Address::parse(to)?,
            (None, Some(sender)) => Address::parse(sender)?,
            (None, None) => {
                let sender = self.withdrawer.detect_sender_address(&from).await?;
                let encoded = sender.encode()?;
                if let Err(e) = self.store.update_wallet_sender(wallet_id, &encoded) {
                    tracing::warn!(wallet_id = %wallet_id, error = %e, "Failed to store sender address");
                }
                sender
            }
        };

        let hash = self.withdrawer.withdraw_all(&key, &from, &destination).await?;
        self.store
            .modify_wallet(wallet_id, &mut |w| {
                w.status = WalletStatus::Withdrawn;
                w.balance = tollgate_core::Amount::ZERO;
            })?;
        tracing::info!(wallet_id = %wallet_id, to = %destination, tx_hash = %hash, "Wallet withdrawn");
        Ok(hash)
    }
}
