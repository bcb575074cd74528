//! The Tollgate node orchestrator.
//!
//! Wires the ledger client, the persistent store and the session layer
//! together, then runs the micropayment scheduler, the funding detector and
//! the HTTP API as background tasks until shutdown.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tollgate_core::SessionStatus;
use tollgate_ledger::{
    Address, CellCapacityManager, CkbRpcClient, GuestKey, LedgerClient, MemoryLedger, Withdrawer,
};
use tollgate_session::adapters::{AcceptAllHandler, LocalChannelHub, NoopAccessController};
use tollgate_session::{
    ChannelNetwork, MicropaymentScheduler, PricingHandle, SessionOpener, SessionRegistry,
    SessionService, SessionStore, SettlementCoordinator, TaskSupervisor,
};

use crate::config::{LedgerBackend, TollgateConfig};
use crate::funding::FundingDetector;
use crate::state::NodeState;
use crate::storage::RocksStore;

/// The Tollgate host node.
pub struct TollgateNode {
    config: TollgateConfig,
    host: Address,
    ledger: Arc<dyn LedgerClient>,
    /// Set when the node runs against the in-process ledger.
    memory_ledger: Option<Arc<MemoryLedger>>,
    store: Arc<dyn SessionStore>,
    registry: Arc<SessionRegistry>,
    supervisor: TaskSupervisor,
    scheduler: Arc<MicropaymentScheduler>,
    service: Arc<SessionService>,
    funding: Arc<FundingDetector>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    api_addr: Option<SocketAddr>,
}

impl TollgateNode {
    /// Create a node persisting to RocksDB under the configured data dir.
    pub fn new(config: TollgateConfig) -> Result<Self> {
        let store = RocksStore::open(&config.storage.data_dir)?;
        tracing::info!(path = %config.storage.data_dir.display(), "storage initialized");
        Self::with_store(config, Arc::new(store))
    }

    /// Create a node over an existing store.
    pub fn with_store(config: TollgateConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let network = config.network.network;
        // A price set at runtime outlives the configured one.
        let pricing = match store.get_rate_per_hour()? {
            Some(per_hour) => {
                tracing::info!(rate_per_hour = per_hour, "using persisted price");
                PricingHandle::from_hourly_ckb(per_hour)?
            }
            None => PricingHandle::from_hourly_ckb(config.pricing.rate_per_hour_ckb)?,
        };

        let (ledger, memory_ledger): (Arc<dyn LedgerClient>, Option<Arc<MemoryLedger>>) =
            match config.ledger.backend {
                LedgerBackend::Rpc => {
                    let client: Arc<dyn LedgerClient> = Arc::new(CkbRpcClient::new(
                        config.ledger.rpc_url.as_str(),
                        config.ledger.request_timeout(),
                    )?);
                    tracing::info!(url = %config.ledger.rpc_url, "using JSON-RPC ledger");
                    (client, None)
                }
                LedgerBackend::Memory => {
                    tracing::warn!("using in-memory ledger; nothing is persisted on-chain");
                    let ledger = Arc::new(MemoryLedger::new());
                    let client: Arc<dyn LedgerClient> = ledger.clone();
                    (client, Some(ledger))
                }
            };

        let host_key = match config.host.secret_key_hex.as_deref() {
            Some(hex) => GuestKey::from_hex(hex)?,
            None => {
                tracing::info!("generating ephemeral host key");
                GuestKey::generate()
            }
        };
        let host = host_key.address(network);

        let mut hub = LocalChannelHub::new(ledger.clone(), host.clone());
        if memory_ledger.is_some() {
            hub = hub.with_on_chain_settlement(config.cells.clone());
        }
        hub.register_handler(Arc::new(AcceptAllHandler::new()));
        let channels: Arc<dyn ChannelNetwork> = Arc::new(hub);

        let access = Arc::new(NoopAccessController);
        let registry = Arc::new(SessionRegistry::new());
        let supervisor = TaskSupervisor::new(config.settlement.max_background_tasks);
        let withdrawer = Arc::new(Withdrawer::new(
            ledger.clone(),
            network,
            config.cells.clone(),
        ));
        let cells = Arc::new(CellCapacityManager::new(
            ledger.clone(),
            network,
            config.cells.clone(),
        ));

        let coordinator = Arc::new(SettlementCoordinator::new(
            registry.clone(),
            store.clone(),
            access.clone(),
            withdrawer.clone(),
            supervisor.clone(),
            config.settlement.clone(),
        ));
        let scheduler = Arc::new(MicropaymentScheduler::new(
            registry.clone(),
            store.clone(),
            coordinator.clone(),
            pricing.clone(),
            config.scheduler.tick_interval(),
        ));
        let opener = Arc::new(SessionOpener::new(
            store.clone(),
            registry.clone(),
            channels,
            cells,
            withdrawer,
            access,
            pricing.clone(),
            config.channel.clone(),
        ));
        let service = Arc::new(SessionService::new(
            store.clone(),
            registry.clone(),
            coordinator,
            pricing.clone(),
            network,
            config.channel.funding_threshold()?,
        ));
        let funding = Arc::new(FundingDetector::new(
            store.clone(),
            ledger.clone(),
            opener,
            supervisor.clone(),
            config.funding.poll_interval(),
            config.channel.open_timeout(),
        ));

        tracing::info!(host = %host, ?network, rate = %pricing.current().rate_per_tick(), "Tollgate node created");

        Ok(Self {
            config,
            host,
            ledger,
            memory_ledger,
            store,
            registry,
            supervisor,
            scheduler,
            service,
            funding,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            api_addr: None,
        })
    }

    /// Recover persisted state, then start the scheduler, the funding
    /// detector and the HTTP API.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting Tollgate node");
        self.recover()?;

        let scheduler = self.scheduler.clone();
        let cancel = self.cancel.clone();
        self.tasks
            .push(tokio::spawn(async move { scheduler.run(cancel).await }));

        let funding = self.funding.clone();
        let cancel = self.cancel.clone();
        self.tasks
            .push(tokio::spawn(async move { funding.run(cancel).await }));

        let listen_addr: SocketAddr = self.config.api_addr().parse()?;
        let listener = tokio::net::TcpListener::bind(listen_addr).await?;
        self.api_addr = Some(listener.local_addr()?);
        let state = Arc::new(NodeState::new(
            self.service.clone(),
            self.registry.clone(),
            self.host.encode()?,
            self.config.channel.setup_reserve_ckb,
        ));
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = crate::api::serve(listener, state, cancel).await {
                tracing::error!(error = %e, "HTTP API server error");
            }
        }));

        Ok(())
    }

    /// Wait until shutdown is requested.
    pub async fn run(&self) {
        self.cancel.cancelled().await;
    }

    /// Stop the background loops and give in-flight settlements and
    /// withdrawals the configured grace period.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down Tollgate node");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }

        let grace = self.config.settlement.shutdown_grace();
        if !self.supervisor.drain(grace).await {
            tracing::warn!(
                pending = self.supervisor.len(),
                "background tasks still running at shutdown"
            );
        }
        tracing::info!("Tollgate node shut down");
        Ok(())
    }

    /// Handle for requesting shutdown from elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Address the API is bound to, once started.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    pub fn host_address(&self) -> &Address {
        &self.host
    }

    pub fn service(&self) -> &Arc<SessionService> {
        &self.service
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    pub fn memory_ledger(&self) -> Option<&Arc<MemoryLedger>> {
        self.memory_ledger.as_ref()
    }

    pub fn funding_detector(&self) -> &Arc<FundingDetector> {
        &self.funding
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// Reconcile persisted sessions with an empty registry.
    ///
    /// Pending sessions never reached the channel and are opened again.
    /// Sessions that had a channel cannot be resumed because channel state
    /// lives in-process; they stay queryable and their wallets remain
    /// reachable through manual withdrawal.
    fn recover(&self) -> Result<()> {
        let mut reopened = 0;
        let mut orphaned = 0;
        for record in self.store.list_sessions()? {
            match record.status {
                SessionStatus::Pending => {
                    self.funding.dispatch_open(record.id);
                    reopened += 1;
                }
                SessionStatus::ChannelOpening | SessionStatus::Active | SessionStatus::Settling => {
                    tracing::warn!(
                        session_id = %record.id,
                        wallet_id = %record.wallet_id,
                        status = %record.status,
                        "Session cannot be resumed after restart; withdraw its wallet manually"
                    );
                    orphaned += 1;
                }
                _ => {}
            }
        }
        if reopened + orphaned > 0 {
            tracing::info!(reopened, orphaned, "Recovered persisted sessions");
        }
        Ok(())
    }
}
