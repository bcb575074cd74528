use chrono::{TimeDelta, Utc};
use std::sync::Arc;

use tollgate_core::config::{CellConfig, SettlementConfig};
use tollgate_core::{Amount, Pricing, SessionId, SessionStatus, WalletId, WalletStatus};
use tollgate_ledger::address::sighash_lock;
use tollgate_ledger::{Address, GuestKey, MemoryLedger, Network, Script, Withdrawer};

use crate::adapters::{AcceptAllHandler, LocalChannelHub, RecordingAccessController};
use crate::coordinator::SettlementCoordinator;
use crate::registry::{NewSession, Session, SessionRegistry};
use crate::store::{GuestWallet, MemoryStore, SessionRecord, SessionStore};
use crate::supervisor::TaskSupervisor;
use crate::traits::ChannelNetwork;

pub(crate) const CKB: u64 = 100_000_000;

/// A wired session layer over an in-memory ledger with on-chain channels.
pub(crate) struct Fixture {
    pub ledger: Arc<MemoryLedger>,
    pub hub: LocalChannelHub,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<SessionRegistry>,
    pub access: Arc<RecordingAccessController>,
    pub supervisor: TaskSupervisor,
    pub coordinator: Arc<SettlementCoordinator>,
    pub pricing: Pricing,
    pub funder: Script,
}

impl Fixture {
    pub fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let host = GuestKey::generate().address(Network::Testnet);
        let hub = LocalChannelHub::new(ledger.clone(), host)
            .with_on_chain_settlement(CellConfig::default());
        hub.register_handler(Arc::new(AcceptAllHandler::new()));

        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let access = Arc::new(RecordingAccessController::new());
        let supervisor = TaskSupervisor::new(8);
        let withdrawer = Arc::new(Withdrawer::new(
            ledger.clone(),
            Network::Testnet,
            CellConfig::default(),
        ));
        let coordinator = Arc::new(SettlementCoordinator::new(
            registry.clone(),
            store.clone(),
            access.clone(),
            withdrawer,
            supervisor.clone(),
            SettlementConfig::default(),
        ));

        Self {
            ledger,
            hub,
            store,
            registry,
            access,
            supervisor,
            coordinator,
            pricing: Pricing::from_hourly_ckb(500).unwrap(),
            funder: sighash_lock([0x42; 20]),
        }
    }

    pub fn funder_address(&self) -> String {
        Address::new(Network::Testnet, self.funder.clone())
            .encode()
            .unwrap()
    }

    /// A stored wallet in `created` status, not yet funded.
    pub fn new_wallet(&self) -> (GuestWallet, GuestKey) {
        let key = GuestKey::generate();
        let wallet = GuestWallet {
            id: WalletId::new(),
            address: key.address(Network::Testnet).encode().unwrap(),
            secret_key_hex: key.to_hex().to_string(),
            funding_threshold: Amount::from_ckb(150).unwrap(),
            balance: Amount::ZERO,
            sender_address: None,
            session_id: None,
            device_id: format!("dev-{}", WalletId::new()),
            status: WalletStatus::Created,
            created_at: Utc::now(),
            funded_at: None,
        };
        self.store.create_wallet(wallet.clone()).unwrap();
        (wallet, key)
    }

    /// A wallet holding one `ckb`-sized cell sent by the funder, with the
    /// sender already recorded.
    pub async fn funded_wallet(&self, ckb: u64) -> (GuestWallet, GuestKey) {
        let (wallet, key) = self.new_wallet();
        self.ledger
            .fund(&self.funder, key.address(Network::Testnet).script(), ckb * CKB);
        let sender = self.funder_address();
        let wallet = self
            .store
            .modify_wallet(&wallet.id, &mut |w| {
                w.status = WalletStatus::Funded;
                w.balance = Amount::from(ckb * CKB);
                w.sender_address = Some(sender.clone());
            })
            .unwrap();
        (wallet, key)
    }

    /// An open channel of `funding_ckb` and an active registered session
    /// lasting `duration`, persisted like the opener would.
    pub async fn active_session(&self, funding_ckb: u64, duration: TimeDelta) -> Session {
        let (wallet, key) = self.funded_wallet(funding_ckb + 70).await;
        let funding = Amount::from(funding_ckb * CKB);
        let client = self.hub.connect(&key).unwrap();
        let channel = client
            .open(self.hub.host_address(), funding, Amount::from_ckb(100).unwrap())
            .await
            .unwrap();

        let now = Utc::now();
        let id = SessionId::new();
        self.store
            .create_session(SessionRecord {
                id,
                wallet_id: wallet.id,
                channel_id: Some(channel),
                guest_address: wallet.address.clone(),
                host_address: self.hub.host_address().encode().unwrap(),
                device_id: wallet.device_id.clone(),
                funding_amount: funding,
                remaining: funding,
                spent: Amount::ZERO,
                status: SessionStatus::Active,
                created_at: now,
                expires_at: now + duration,
                ended_at: None,
            })
            .unwrap();
        self.store
            .modify_wallet(&wallet.id, &mut |w| {
                w.status = WalletStatus::ChannelOpen;
                w.session_id = Some(id);
            })
            .unwrap();

        let new = NewSession::new(
            channel,
            client,
            key.address(Network::Testnet),
            self.hub.host_address().clone(),
            funding,
        )
        .with_id(id)
        .with_wallet(wallet.id)
        .with_device(wallet.device_id.clone())
        .with_created_at(now);
        self.registry.create(new).await.unwrap();
        self.registry
            .activate_at(&id, now, duration, None, Amount::ZERO)
            .await
            .unwrap()
    }
}
