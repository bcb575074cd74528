use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tollgate_core::{Amount, ChannelId, SessionId, SessionStatus, WalletId, WalletStatus};

use crate::error::StoreError;

/// Persisted mirror of a session, used for listings and restart recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub wallet_id: WalletId,
    pub channel_id: Option<ChannelId>,
    pub guest_address: String,
    pub host_address: String,
    pub device_id: String,
    /// Amount the guest locked into the channel.
    pub funding_amount: Amount,
    /// Funding not yet paid to the host.
    pub remaining: Amount,
    /// Cumulative amount paid to the host.
    pub spent: Amount,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Status as shown to users: an `active` session past its expiry reads as `expired`.
    pub fn display_status(&self, now: DateTime<Utc>) -> SessionStatus {
        if self.status == SessionStatus::Active && now > self.expires_at {
            SessionStatus::Expired
        } else {
            self.status
        }
    }

    /// Time left until expiry, zero once expired or no longer active.
    pub fn remaining_time(&self, now: DateTime<Utc>) -> TimeDelta {
        if self.status != SessionStatus::Active {
            return TimeDelta::zero();
        }
        (self.expires_at - now).max(TimeDelta::zero())
    }
}

/// A custodial guest wallet. Never deleted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestWallet {
    pub id: WalletId,
    pub address: String,
    /// Hex-encoded secp256k1 secret key, held for the session's lifetime.
    pub secret_key_hex: String,
    pub funding_threshold: Amount,
    /// Last observed on-chain balance.
    pub balance: Amount,
    /// Address that funded the wallet, once detected.
    pub sender_address: Option<String>,
    pub session_id: Option<SessionId>,
    pub device_id: String,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for GuestWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestWallet")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("secret_key_hex", &"<redacted>")
            .field("funding_threshold", &self.funding_threshold)
            .field("balance", &self.balance)
            .field("sender_address", &self.sender_address)
            .field("session_id", &self.session_id)
            .field("device_id", &self.device_id)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .field("funded_at", &self.funded_at)
            .finish()
    }
}

/// Narrow CRUD interface over the persistent store.
///
/// Implementors provide keyed insert/get/modify/list for the two record
/// kinds; every domain operation is built on those. Each call is an
/// independent atomic write.
pub trait SessionStore: Send + Sync {
    fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError>;
    fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;
    /// Apply `f` to the stored session atomically and return the updated record.
    fn modify_session(
        &self,
        id: &SessionId,
        f: &mut dyn FnMut(&mut SessionRecord),
    ) -> Result<SessionRecord, StoreError>;
    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    fn insert_wallet(&self, wallet: GuestWallet) -> Result<(), StoreError>;
    fn get_wallet(&self, id: &WalletId) -> Result<Option<GuestWallet>, StoreError>;
    fn modify_wallet(
        &self,
        id: &WalletId,
        f: &mut dyn FnMut(&mut GuestWallet),
    ) -> Result<GuestWallet, StoreError>;
    fn list_wallets(&self) -> Result<Vec<GuestWallet>, StoreError>;

    /// Hourly price in whole CKB set at runtime, if any.
    fn get_rate_per_hour(&self) -> Result<Option<u64>, StoreError>;
    fn set_rate_per_hour(&self, ckb: u64) -> Result<(), StoreError>;

    // ---- Sessions ----

    fn create_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        if self.get_session(&record.id)?.is_some() {
            return Err(StoreError::AlreadyExists(record.id.to_string()));
        }
        self.insert_session(record)
    }

    fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<SessionRecord, StoreError> {
        self.modify_session(id, &mut |r| r.status = status)
    }

    /// Record cumulative `spent`; `remaining` is derived from the funding amount.
    fn update_session_balance(
        &self,
        id: &SessionId,
        spent: Amount,
    ) -> Result<SessionRecord, StoreError> {
        self.modify_session(id, &mut |r| {
            r.spent = spent;
            r.remaining = r.funding_amount.saturating_sub(spent);
        })
    }

    fn update_session_channel(
        &self,
        id: &SessionId,
        channel: ChannelId,
        status: SessionStatus,
    ) -> Result<SessionRecord, StoreError> {
        self.modify_session(id, &mut |r| {
            r.channel_id = Some(channel);
            r.status = status;
        })
    }

    /// Push the expiry forward and record the new cumulative spend.
    fn extend_session(
        &self,
        id: &SessionId,
        extra: TimeDelta,
        spent: Amount,
    ) -> Result<SessionRecord, StoreError> {
        self.modify_session(id, &mut |r| {
            r.expires_at += extra.max(TimeDelta::zero());
            r.spent = spent;
            r.remaining = r.funding_amount.saturating_sub(spent);
        })
    }

    /// Terminal write after settlement: status `settled`, final spend, end time.
    fn settle_session(
        &self,
        id: &SessionId,
        spent: Amount,
        ended_at: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        self.modify_session(id, &mut |r| {
            r.status = SessionStatus::Settled;
            r.spent = spent;
            r.remaining = r.funding_amount.saturating_sub(spent);
            r.ended_at = Some(ended_at);
        })
    }

    fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    // ---- Wallets ----

    fn create_wallet(&self, wallet: GuestWallet) -> Result<(), StoreError> {
        if self.get_wallet(&wallet.id)?.is_some() {
            return Err(StoreError::AlreadyExists(wallet.id.to_string()));
        }
        self.insert_wallet(wallet)
    }

    fn get_wallet_by_session(
        &self,
        session: &SessionId,
    ) -> Result<Option<GuestWallet>, StoreError> {
        Ok(self
            .list_wallets()?
            .into_iter()
            .find(|w| w.session_id.as_ref() == Some(session)))
    }

    /// Record the funding observation and link the wallet to its session.
    fn update_wallet_funded(
        &self,
        id: &WalletId,
        balance: Amount,
        session: SessionId,
        funded_at: DateTime<Utc>,
    ) -> Result<GuestWallet, StoreError> {
        self.modify_wallet(id, &mut |w| {
            w.status = WalletStatus::Funded;
            w.balance = balance;
            w.session_id = Some(session);
            w.funded_at = Some(funded_at);
        })
    }

    fn update_wallet_status(
        &self,
        id: &WalletId,
        status: WalletStatus,
    ) -> Result<GuestWallet, StoreError> {
        self.modify_wallet(id, &mut |w| w.status = status)
    }

    fn update_wallet_balance(
        &self,
        id: &WalletId,
        balance: Amount,
    ) -> Result<GuestWallet, StoreError> {
        self.modify_wallet(id, &mut |w| w.balance = balance)
    }

    fn update_wallet_sender(
        &self,
        id: &WalletId,
        sender: &str,
    ) -> Result<GuestWallet, StoreError> {
        self.modify_wallet(id, &mut |w| w.sender_address = Some(sender.to_string()))
    }

    /// Wallets still waiting for funds.
    fn list_pending_wallets(&self) -> Result<Vec<GuestWallet>, StoreError> {
        Ok(self
            .list_wallets()?
            .into_iter()
            .filter(|w| w.status == WalletStatus::Created)
            .collect())
    }
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionId, SessionRecord>,
    wallets: DashMap<WalletId, GuestWallet>,
    /// Zero when unset.
    rate_per_hour: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.sessions.insert(record.id, record);
        Ok(())
    }

    fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.get(id).map(|r| r.clone()))
    }

    fn modify_session(
        &self,
        id: &SessionId,
        f: &mut dyn FnMut(&mut SessionRecord),
    ) -> Result<SessionRecord, StoreError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(entry.value_mut());
        Ok(entry.clone())
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut all: Vec<SessionRecord> = self.sessions.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    fn insert_wallet(&self, wallet: GuestWallet) -> Result<(), StoreError> {
        self.wallets.insert(wallet.id, wallet);
        Ok(())
    }

    fn get_wallet(&self, id: &WalletId) -> Result<Option<GuestWallet>, StoreError> {
        Ok(self.wallets.get(id).map(|w| w.clone()))
    }

    fn modify_wallet(
        &self,
        id: &WalletId,
        f: &mut dyn FnMut(&mut GuestWallet),
    ) -> Result<GuestWallet, StoreError> {
        let mut entry = self
            .wallets
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(entry.value_mut());
        Ok(entry.clone())
    }

    fn list_wallets(&self) -> Result<Vec<GuestWallet>, StoreError> {
        let mut all: Vec<GuestWallet> = self.wallets.iter().map(|w| w.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn get_rate_per_hour(&self) -> Result<Option<u64>, StoreError> {
        Ok(Some(self.rate_per_hour.load(Ordering::Acquire)).filter(|r| *r > 0))
    }

    fn set_rate_per_hour(&self, ckb: u64) -> Result<(), StoreError> {
        self.rate_per_hour.store(ckb, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_record(funding_ckb: u128) -> SessionRecord {
        let now = Utc::now();
        let funding = Amount::from_ckb(funding_ckb).unwrap();
        SessionRecord {
            id: SessionId::new(),
            wallet_id: WalletId::new(),
            channel_id: None,
            guest_address: "ckt1guest".into(),
            host_address: "ckt1host".into(),
            device_id: "aa:bb:cc:dd:ee:ff".into(),
            funding_amount: funding,
            remaining: funding,
            spent: Amount::ZERO,
            status: SessionStatus::Pending,
            created_at: now,
            expires_at: now + TimeDelta::minutes(60),
            ended_at: None,
        }
    }

    pub(crate) fn sample_wallet() -> GuestWallet {
        GuestWallet {
            id: WalletId::new(),
            address: "ckt1wallet".into(),
            secret_key_hex: "11".repeat(32),
            funding_threshold: Amount::from_ckb(150).unwrap(),
            balance: Amount::ZERO,
            sender_address: None,
            session_id: None,
            device_id: "aa:bb:cc:dd:ee:ff".into(),
            status: WalletStatus::Created,
            created_at: Utc::now(),
            funded_at: None,
        }
    }

    #[test]
    fn test_create_and_get_session() {
        let store = MemoryStore::new();
        let record = sample_record(500);
        store.create_session(record.clone()).unwrap();
        assert_eq!(store.get_session(&record.id).unwrap(), Some(record.clone()));

        let err = store.create_session(record).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn test_rate_setting() {
        let store = MemoryStore::new();
        assert_eq!(store.get_rate_per_hour().unwrap(), None);
        store.set_rate_per_hour(60).unwrap();
        assert_eq!(store.get_rate_per_hour().unwrap(), Some(60));
    }

    #[test]
    fn test_update_missing_session() {
        let store = MemoryStore::new();
        let err = store
            .update_session_status(&SessionId::new(), SessionStatus::Active)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_balance_derives_remaining() {
        let store = MemoryStore::new();
        let record = sample_record(500);
        store.create_session(record.clone()).unwrap();

        let updated = store
            .update_session_balance(&record.id, Amount(833_333_333))
            .unwrap();
        assert_eq!(updated.spent, Amount(833_333_333));
        assert_eq!(updated.remaining, Amount(50_000_000_000 - 833_333_333));
    }

    #[test]
    fn test_extend_moves_expiry_forward() {
        let store = MemoryStore::new();
        let record = sample_record(500);
        store.create_session(record.clone()).unwrap();

        let updated = store
            .extend_session(&record.id, TimeDelta::minutes(10), Amount(1))
            .unwrap();
        assert_eq!(updated.expires_at, record.expires_at + TimeDelta::minutes(10));

        let unchanged = store
            .extend_session(&record.id, TimeDelta::minutes(-5), Amount(1))
            .unwrap();
        assert_eq!(unchanged.expires_at, updated.expires_at);
    }

    #[test]
    fn test_settle_session() {
        let store = MemoryStore::new();
        let record = sample_record(500);
        store.create_session(record.clone()).unwrap();

        let ended = Utc::now();
        let settled = store
            .settle_session(&record.id, Amount(2 * 833_333_333), ended)
            .unwrap();
        assert_eq!(settled.status, SessionStatus::Settled);
        assert_eq!(settled.ended_at, Some(ended));
        assert_eq!(settled.spent, Amount(2 * 833_333_333));
        assert_eq!(
            store.list_sessions_by_status(SessionStatus::Settled).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_display_status() {
        let mut record = sample_record(500);
        record.status = SessionStatus::Active;
        let now = record.expires_at - TimeDelta::minutes(5);
        assert_eq!(record.display_status(now), SessionStatus::Active);
        assert_eq!(record.remaining_time(now), TimeDelta::minutes(5));

        let later = record.expires_at + TimeDelta::seconds(1);
        assert_eq!(record.display_status(later), SessionStatus::Expired);
        assert_eq!(record.remaining_time(later), TimeDelta::zero());
    }

    #[test]
    fn test_wallet_lifecycle() {
        let store = MemoryStore::new();
        let wallet = sample_wallet();
        store.create_wallet(wallet.clone()).unwrap();
        assert_eq!(store.list_pending_wallets().unwrap().len(), 1);

        let session = SessionId::new();
        let funded = store
            .update_wallet_funded(&wallet.id, Amount::from_ckb(200).unwrap(), session, Utc::now())
            .unwrap();
        assert_eq!(funded.status, WalletStatus::Funded);
        assert!(store.list_pending_wallets().unwrap().is_empty());
        assert_eq!(
            store.get_wallet_by_session(&session).unwrap().map(|w| w.id),
            Some(wallet.id)
        );

        store.update_wallet_sender(&wallet.id, "ckt1sender").unwrap();
        let withdrawn = store
            .update_wallet_status(&wallet.id, WalletStatus::Withdrawn)
            .unwrap();
        assert_eq!(withdrawn.sender_address.as_deref(), Some("ckt1sender"));
        assert_eq!(withdrawn.status, WalletStatus::Withdrawn);
    }

    #[test]
    fn test_wallet_debug_redacts_key() {
        let wallet = sample_wallet();
        let printed = format!("{:?}", wallet);
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains(&wallet.secret_key_hex));
    }
}
