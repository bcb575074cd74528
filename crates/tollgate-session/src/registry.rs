use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};

use tollgate_core::{
    Amount, ChannelId, SessionEvent, SessionId, SessionStateMachine, SessionStatus, WalletId,
};
use tollgate_ledger::Address;

use crate::error::SessionError;
use crate::traits::ChannelClient;

/// In-memory state of one session.
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub wallet_id: WalletId,
    pub channel: ChannelId,
    /// Client that signs this session's channel operations.
    pub client: Arc<dyn ChannelClient>,
    pub guest_address: Address,
    pub host_address: Address,
    pub device_id: String,
    pub funding_amount: Amount,
    pub total_paid: Amount,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Paid access time, summed over activation and every extension.
    pub duration: TimeDelta,
    pub access_token: Option<String>,
    pub status: SessionStatus,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// `start + duration`; the creation time stands in for the start before activation.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at) + self.duration
    }

    /// Active status and not yet past expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && now < self.expires_at()
    }

    /// Funding not yet paid to the host.
    pub fn remaining(&self) -> Amount {
        self.funding_amount.saturating_sub(self.total_paid)
    }

    fn apply(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        self.status = SessionStateMachine::transition(self.status, event)?;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("wallet_id", &self.wallet_id)
            .field("channel", &self.channel.short())
            .field("device_id", &self.device_id)
            .field("funding_amount", &self.funding_amount)
            .field("total_paid", &self.total_paid)
            .field("status", &self.status)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

/// Everything needed to register a session whose channel is open.
pub struct NewSession {
    pub id: SessionId,
    pub wallet_id: WalletId,
    pub channel: ChannelId,
    pub client: Arc<dyn ChannelClient>,
    pub guest_address: Address,
    pub host_address: Address,
    pub device_id: String,
    pub funding_amount: Amount,
    pub created_at: DateTime<Utc>,
}

impl NewSession {
    pub fn new(
        channel: ChannelId,
        client: Arc<dyn ChannelClient>,
        guest_address: Address,
        host_address: Address,
        funding_amount: Amount,
    ) -> Self {
        Self {
            id: SessionId::new(),
            wallet_id: WalletId::new(),
            channel,
            client,
            guest_address,
            host_address,
            device_id: String::new(),
            funding_amount,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    pub fn with_wallet(mut self, wallet_id: WalletId) -> Self {
        self.wallet_id = wallet_id;
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

#[derive(Default)]
pub(crate) struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    by_channel: HashMap<ChannelId, SessionId>,
}

impl RegistryState {
    pub(crate) fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub(crate) fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub(crate) fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        self.by_channel.remove(&session.channel);
        Some(session)
    }

    /// Apply a terminal `event` to an `active` session, stamp its end time
    /// and take it out of the map so it can be settled.
    ///
    /// `NotFound` once it is gone; a second caller racing the first always
    /// lands here.
    pub(crate) fn finish(
        &mut self,
        id: &SessionId,
        event: SessionEvent,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or(SessionError::NotFound(*id))?;
        if session.status != SessionStatus::Active {
            return Err(SessionError::NotActive {
                id: *id,
                status: session.status.to_string(),
            });
        }
        session.apply(event)?;
        session.ended_at = Some(now);
        self.remove(id).ok_or(SessionError::NotFound(*id))
    }
}

/// Concurrency-safe map of sessions, indexed by id and by channel.
///
/// Every mutation happens under one write lock, so each operation is
/// atomic with respect to the others and to a scheduler pass.
#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().await
    }

    /// Register a session in `pending` status.
    pub async fn create(&self, new: NewSession) -> Result<Session, SessionError> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&new.id) {
            return Err(SessionError::AlreadyExists(new.id));
        }
        let session = Session {
            id: new.id,
            wallet_id: new.wallet_id,
            channel: new.channel,
            client: new.client,
            guest_address: new.guest_address,
            host_address: new.host_address,
            device_id: new.device_id,
            funding_amount: new.funding_amount,
            total_paid: Amount::ZERO,
            created_at: new.created_at,
            started_at: None,
            duration: TimeDelta::zero(),
            access_token: None,
            status: SessionStatus::Pending,
            ended_at: None,
        };
        state.by_channel.insert(session.channel, session.id);
        state.sessions.insert(session.id, session.clone());
        tracing::debug!(session_id = %session.id, channel = %session.channel.short(), "Session registered");
        Ok(session)
    }

    /// Start debiting: status `active`, start time now, `paid` already received.
    pub async fn activate(
        &self,
        id: &SessionId,
        duration: TimeDelta,
        access_token: Option<String>,
        paid: Amount,
    ) -> Result<Session, SessionError> {
        self.activate_at(id, Utc::now(), duration, access_token, paid)
            .await
    }

    /// [`activate`](Self::activate) with an explicit start time.
    pub async fn activate_at(
        &self,
        id: &SessionId,
        started_at: DateTime<Utc>,
        duration: TimeDelta,
        access_token: Option<String>,
        paid: Amount,
    ) -> Result<Session, SessionError> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or(SessionError::NotFound(*id))?;
        if paid > session.funding_amount {
            return Err(SessionError::FundingExceeded {
                requested: paid,
                remaining: session.funding_amount,
            });
        }
        session.apply(SessionEvent::Activated)?;
        session.started_at = Some(started_at);
        session.duration = duration.max(TimeDelta::zero());
        session.total_paid = paid;
        session.access_token = access_token;
        tracing::info!(
            session_id = %id,
            duration_minutes = session.duration.num_minutes(),
            paid = %paid,
            "Session activated"
        );
        Ok(session.clone())
    }

    /// Add paid time and the payment that bought it.
    pub async fn extend(
        &self,
        id: &SessionId,
        extra: TimeDelta,
        paid: Amount,
    ) -> Result<Session, SessionError> {
        let mut state = self.state.write().await;
        extend_locked(&mut state, id, extra, paid)
    }

    /// Paid time ran out: status `expired`, removed from the map.
    pub async fn mark_expired(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.state
            .write()
            .await
            .finish(id, SessionEvent::Expired, Utc::now())
    }

    /// Explicit end: status `ended`, removed from the map.
    ///
    /// Shares [`RegistryState::finish`] with [`mark_expired`](Self::mark_expired)
    /// and the scheduler's locked pass; of two racing callers exactly one
    /// gets the session and the other gets `NotFound`.
    pub async fn end(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.state
            .write()
            .await
            .finish(id, SessionEvent::Ended, Utc::now())
    }

    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        self.state.read().await.sessions.get(id).cloned()
    }

    pub async fn get_by_channel(&self, channel: &ChannelId) -> Option<Session> {
        let state = self.state.read().await;
        let id = state.by_channel.get(channel)?;
        state.sessions.get(id).cloned()
    }

    /// Sessions that are active at this instant.
    pub async fn list_active(&self) -> Vec<Session> {
        let now = Utc::now();
        let state = self.state.read().await;
        let mut active: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.is_active(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active
    }

    pub async fn delete(&self, id: &SessionId) -> Option<Session> {
        self.state.write().await.remove(id)
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}

pub(crate) fn extend_locked(
    state: &mut RegistryState,
    id: &SessionId,
    extra: TimeDelta,
    paid: Amount,
) -> Result<Session, SessionError> {
    let session = state
        .get_mut(id)
        .filter(|s| s.status == SessionStatus::Active)
        .ok_or(SessionError::NotFound(*id))?;
    let total = session.total_paid.checked_add(paid)?;
    if total > session.funding_amount {
        return Err(SessionError::FundingExceeded {
            requested: paid,
            remaining: session.remaining(),
        });
    }
    session.total_paid = total;
    session.duration += extra.max(TimeDelta::zero());
    tracing::info!(
        session_id = %id,
        extra_minutes = extra.num_minutes(),
        total_paid = %total,
        expires_at = %session.expires_at(),
        "Session extended"
    );
    Ok(session.clone())
}
