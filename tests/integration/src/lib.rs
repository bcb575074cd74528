//! Shared wiring for the cross-crate scenarios in `tests/`.
//!
//! [`Harness`] assembles the session layer over an in-memory ledger with
//! on-chain channel settlement, the way the node does for its `memory`
//! backend, but with a recording access controller and direct handles on
//! every component.

use std::sync::Arc;
use std::time::Duration;

use tollgate_core::config::{CellConfig, ChannelConfig, SettlementConfig};
use tollgate_core::{Amount, Pricing};
use tollgate_ledger::address::sighash_lock;
use tollgate_ledger::{
    Address, CellCapacityManager, GuestKey, MemoryLedger, Network, Script, Withdrawer,
};
use tollgate_node::FundingDetector;
use tollgate_session::adapters::{AcceptAllHandler, LocalChannelHub, RecordingAccessController};
use tollgate_session::{
    ChannelNetwork, MemoryStore, MicropaymentScheduler, PricingHandle, SessionOpener,
    SessionRegistry, SessionService, SessionStore, SettlementCoordinator, TaskSupervisor,
};

/// Base units per whole CKB.
pub const CKB: u64 = 100_000_000;
/// Split, lock, settle and withdrawal fee.
pub const FEE: u64 = 100_000;
/// Per-minute debit at 500 CKB/hour.
pub const RATE: u128 = 833_333_333;

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub hub: LocalChannelHub,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<SessionRegistry>,
    pub access: Arc<RecordingAccessController>,
    pub supervisor: TaskSupervisor,
    pub coordinator: Arc<SettlementCoordinator>,
    pub scheduler: MicropaymentScheduler,
    pub opener: Arc<SessionOpener>,
    pub service: SessionService,
    pub detector: FundingDetector,
    pub pricing: Pricing,
    /// Shared by the scheduler, opener and service.
    pub rates: PricingHandle,
    /// Lock of the party that funds guest wallets.
    pub funder: Script,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn SessionStore>) -> Self {
        Self::build(store, SettlementConfig::default())
    }

    pub fn build(store: Arc<dyn SessionStore>, settlement: SettlementConfig) -> Self {
        let network = Network::Testnet;
        let cells = CellConfig::default();
        let channel = ChannelConfig::default();
        let rates = PricingHandle::from_hourly_ckb(500).expect("valid price");
        let pricing = rates.current();

        let ledger = Arc::new(MemoryLedger::new());
        let host = GuestKey::generate().address(network);
        let hub = LocalChannelHub::new(ledger.clone(), host).with_on_chain_settlement(cells.clone());
        hub.register_handler(Arc::new(AcceptAllHandler::new()));

        let registry = Arc::new(SessionRegistry::new());
        let access = Arc::new(RecordingAccessController::new());
        let supervisor = TaskSupervisor::new(settlement.max_background_tasks);
        let withdrawer = Arc::new(Withdrawer::new(ledger.clone(), network, cells.clone()));
        let coordinator = Arc::new(SettlementCoordinator::new(
            registry.clone(),
            store.clone(),
            access.clone(),
            withdrawer.clone(),
            supervisor.clone(),
            settlement,
        ));
        let scheduler = MicropaymentScheduler::new(
            registry.clone(),
            store.clone(),
            coordinator.clone(),
            rates.clone(),
            Duration::from_secs(60),
        );
        let opener = Arc::new(SessionOpener::new(
            store.clone(),
            registry.clone(),
            Arc::new(hub.clone()),
            Arc::new(CellCapacityManager::new(ledger.clone(), network, cells)),
            withdrawer,
            access.clone(),
            rates.clone(),
            channel.clone(),
        ));
        let service = SessionService::new(
            store.clone(),
            registry.clone(),
            coordinator.clone(),
            rates.clone(),
            network,
            channel.funding_threshold().expect("valid threshold"),
        );
        let detector = FundingDetector::new(
            store.clone(),
            ledger.clone(),
            opener.clone(),
            supervisor.clone(),
            Duration::from_secs(5),
            channel.open_timeout(),
        );

        Self {
            ledger,
            hub,
            store,
            registry,
            access,
            supervisor,
            coordinator,
            scheduler,
            opener,
            service,
            detector,
            pricing,
            rates,
            funder: sighash_lock([0x42; 20]),
        }
    }

    /// Send `ckb` whole CKB from the funder to `address`.
    pub fn fund(&self, address: &str, ckb: u64) {
        let address = Address::parse(address).expect("valid address");
        self.ledger.fund(&self.funder, address.script(), ckb * CKB);
    }

    /// Total bare capacity held by the funder.
    pub fn funder_balance(&self) -> u64 {
        self.ledger.bare_capacities(&self.funder).iter().sum()
    }

    /// Total bare capacity held by `address`.
    pub fn balance_of(&self, address: &Address) -> u64 {
        self.ledger.bare_capacities(address.script()).iter().sum()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// `ckb` whole CKB as an [`Amount`].
pub fn ckb(ckb: u64) -> Amount {
    Amount::from(ckb * CKB)
}
