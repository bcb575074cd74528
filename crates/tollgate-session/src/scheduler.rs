use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tollgate_core::{SessionEvent, SessionStatus};

use crate::coordinator::{SettlementCoordinator, SettlementTrigger};
use crate::rates::PricingHandle;
use crate::registry::SessionRegistry;
use crate::store::SessionStore;

/// Outcome of one scheduler pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions debited.
    pub paid: usize,
    /// Sessions whose payment failed; retried next tick.
    pub failed: usize,
    /// Sessions removed and handed to settlement.
    pub settled: usize,
}

/// Debits every active session once per tick.
pub struct MicropaymentScheduler {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn SessionStore>,
    coordinator: Arc<SettlementCoordinator>,
    pricing: PricingHandle,
    interval: Duration,
}

impl MicropaymentScheduler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn SessionStore>,
        coordinator: Arc<SettlementCoordinator>,
        pricing: impl Into<PricingHandle>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            coordinator,
            pricing: pricing.into(),
            interval,
        }
    }

    /// Tick every `interval` until `cancel` fires. The first tick comes one
    /// interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            rate = %self.pricing.current().rate_per_tick(),
            "Micropayment scheduler started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report != TickReport::default() {
                        tracing::debug!(
                            paid = report.paid,
                            failed = report.failed,
                            settled = report.settled,
                            "Scheduler tick"
                        );
                    }
                }
            }
        }
        tracing::info!("Micropayment scheduler stopped");
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One pass over the registry as of `now`.
    ///
    /// The registry lock is held for the whole pass, pay calls included, so
    /// removal, the persisted `settling` status and settlement scheduling are
    /// one atomic step with respect to explicit end requests. The rate is
    /// read once per pass.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let rate = self.pricing.current().rate_per_tick();
        let mut report = TickReport::default();
        let mut state = self.registry.lock().await;

        for id in state.ids() {
            let Some(session) = state.get(&id) else {
                continue;
            };
            if session.status != SessionStatus::Active {
                continue;
            }

            let trigger = if now > session.expires_at() {
                Some(SettlementTrigger::Expired)
            } else if session.remaining() < rate {
                Some(SettlementTrigger::InsufficientFunds)
            } else {
                None
            };
            if let Some(trigger) = trigger {
                match state.finish(&id, SessionEvent::Expired, now) {
                    Ok(session) => {
                        self.coordinator.schedule_settlement(session, trigger);
                        report.settled += 1;
                    }
                    Err(e) => {
                        tracing::error!(session_id = %id, error = %e, "Failed to finish session");
                    }
                }
                continue;
            }

            let client = session.client.clone();
            let channel = session.channel;
            if let Err(e) = client.pay(&channel, rate).await {
                tracing::warn!(session_id = %id, error = %e, "Micropayment failed; retrying next tick");
                report.failed += 1;
                continue;
            }

            let Some(session) = state.get_mut(&id) else {
                continue;
            };
            match session.total_paid.checked_add(rate) {
                Ok(total) => session.total_paid = total,
                Err(e) => {
                    tracing::error!(session_id = %id, error = %e, "Paid amount overflow");
                    continue;
                }
            }
            if let Err(e) = self.store.update_session_balance(&id, session.total_paid) {
                tracing::warn!(session_id = %id, error = %e, "Failed to persist session balance");
            }
            tracing::debug!(
                session_id = %id,
                amount = %rate,
                total_paid = %session.total_paid,
                remaining = %session.remaining(),
                "Micropayment sent"
            );
            report.paid += 1;
        }
        report
    }
}
