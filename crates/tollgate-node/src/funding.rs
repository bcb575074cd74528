//! Funding detector: turns wallets that received funds into sessions.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tollgate_core::{Amount, SessionId};
use tollgate_ledger::{Address, LedgerClient};
use tollgate_session::{GuestWallet, SessionError, SessionOpener, SessionStore, TaskSupervisor};

/// Extra time an open task gets beyond the channel open timeout, for cell
/// preparation and the catch-up payment.
const OPEN_TASK_MARGIN: Duration = Duration::from_secs(300);

/// Polls wallets still in `created` status and hands every funded one to
/// the [`SessionOpener`].
pub struct FundingDetector {
    store: Arc<dyn SessionStore>,
    ledger: Arc<dyn LedgerClient>,
    opener: Arc<SessionOpener>,
    supervisor: TaskSupervisor,
    interval: Duration,
    open_timeout: Duration,
}

impl FundingDetector {
    pub fn new(
        store: Arc<dyn SessionStore>,
        ledger: Arc<dyn LedgerClient>,
        opener: Arc<SessionOpener>,
        supervisor: TaskSupervisor,
        interval: Duration,
        open_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            opener,
            supervisor,
            interval,
            open_timeout,
        }
    }

    /// Scan every `interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Funding detector started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        tracing::warn!(error = %e, "Funding scan failed");
                    }
                }
            }
        }
        tracing::info!("Funding detector stopped");
    }

    /// One pass over the pending wallets. Returns how many were found funded.
    pub async fn scan(&self) -> Result<usize, SessionError> {
        let mut funded = 0;
        for wallet in self.store.list_pending_wallets()? {
            match self.check(&wallet).await {
                Ok(true) => funded += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(wallet_id = %wallet.id, error = %e, "Funding check failed")
                }
            }
        }
        Ok(funded)
    }

    async fn check(&self, wallet: &GuestWallet) -> Result<bool, SessionError> {
        let address = Address::parse(&wallet.address)?;
        let balance = Amount::from(self.ledger.get_cells_capacity(address.script()).await?);
        if balance < wallet.funding_threshold {
            tracing::trace!(wallet_id = %wallet.id, balance = %balance, "Wallet not yet funded");
            return Ok(false);
        }

        let record = self.opener.register_funding(wallet, balance).await?;
        self.dispatch_open(record.id);
        Ok(true)
    }

    /// Open the channel for a pending session as a supervised background task.
    pub fn dispatch_open(&self, session_id: SessionId) {
        let opener = self.opener.clone();
        self.supervisor
            .spawn("channel-open", self.open_timeout + OPEN_TASK_MARGIN, async move {
                if let Err(e) = opener.open(&session_id).await {
                    tracing::error!(session_id = %session_id, error = %e, "Session open failed");
                }
            });
    }
}
