use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tollgate_core::config::CellConfig;
use tollgate_core::{Amount, ChannelId};
use tollgate_ledger::cells::wait_for_commit;
use tollgate_ledger::hash::{blake2b_256, Hasher};
use tollgate_ledger::rpc::collect_cells;
use tollgate_ledger::signer::sign_sighash_all;
use tollgate_ledger::types::CellInput;
use tollgate_ledger::{
    Address, CellOutput, GuestKey, LedgerClient, LedgerError, LiveCell, OutPoint, Script, ScriptHashType,
    Transaction,
};

use crate::error::SessionError;
use crate::traits::{
    ChannelClient, ChannelEventHandler, ChannelNetwork, ChannelProposal, ChannelUpdate,
};

/// Lock script guarding a locally opened channel's funding cell.
pub fn channel_lock(channel: &ChannelId) -> Script {
    Script {
        code_hash: blake2b_256(b"tollgate/local-channel"),
        hash_type: ScriptHashType::Type,
        args: channel.0.to_vec(),
    }
}

#[derive(Debug, Clone)]
struct LocalChannel {
    guest: Address,
    host: Address,
    guest_balance: Amount,
    host_balance: Amount,
    host_funding: Amount,
    version: u64,
    open: bool,
    /// Funding cell and its capacity when the channel is backed on-chain.
    cell: Option<(OutPoint, u64)>,
}

impl LocalChannel {
    /// What the guest has paid the host so far.
    fn paid(&self) -> Amount {
        self.host_balance.saturating_sub(self.host_funding)
    }
}

struct HubInner {
    ledger: Arc<dyn LedgerClient>,
    host: Address,
    cells: CellConfig,
    on_chain: bool,
    channels: DashMap<ChannelId, LocalChannel>,
    handler: RwLock<Option<Arc<dyn ChannelEventHandler>>>,
    settles: AtomicUsize,
    fail_opens: AtomicU32,
    fail_pays: AtomicU32,
    fail_settles: AtomicU32,
    fail_connects: AtomicU32,
    fail_balances: AtomicU32,
}

impl HubInner {
    fn handler(&self) -> Option<Arc<dyn ChannelEventHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-process channel network.
///
/// Both parties live in the same process and the hub keeps the channel
/// states itself. Off-chain updates go through the registered
/// [`ChannelEventHandler`] exactly as a remote peer's would. With on-chain
/// settlement enabled, opening locks the guest's funding into a channel cell
/// on the ledger and settling pays the host's share and the guest's
/// remainder out of it; host funding is tracked off-chain only.
#[derive(Clone)]
pub struct LocalChannelHub {
    inner: Arc<HubInner>,
}

impl LocalChannelHub {
    pub fn new(ledger: Arc<dyn LedgerClient>, host: Address) -> Self {
        Self {
            inner: Arc::new(HubInner {
                ledger,
                host,
                cells: CellConfig::default(),
                on_chain: false,
                channels: DashMap::new(),
                handler: RwLock::new(None),
                settles: AtomicUsize::new(0),
                fail_opens: AtomicU32::new(0),
                fail_pays: AtomicU32::new(0),
                fail_settles: AtomicU32::new(0),
                fail_connects: AtomicU32::new(0),
                fail_balances: AtomicU32::new(0),
            }),
        }
    }

    /// Lock guest funding on the ledger at open and pay it out at settle.
    ///
    /// Must be called before the hub is shared.
    pub fn with_on_chain_settlement(self, cells: CellConfig) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.on_chain = true;
                inner.cells = cells;
                inner
            }
            Err(shared) => {
                tracing::warn!("Channel hub already shared; on-chain settlement not enabled");
                return Self { inner: shared };
            }
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Number of channels settled or force-closed so far.
    pub fn settle_count(&self) -> usize {
        self.inner.settles.load(Ordering::SeqCst)
    }

    /// Current `(guest, host)` balances of `channel`.
    pub fn channel_balances(&self, channel: &ChannelId) -> Option<(Amount, Amount)> {
        self.inner
            .channels
            .get(channel)
            .map(|c| (c.guest_balance, c.host_balance))
    }

    pub fn is_open(&self, channel: &ChannelId) -> bool {
        self.inner.channels.get(channel).is_some_and(|c| c.open)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.inner.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_pays(&self, n: u32) {
        self.inner.fail_pays.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_settles(&self, n: u32) {
        self.inner.fail_settles.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Balance queries fail with a transient ledger error.
    pub fn fail_next_balances(&self, n: u32) {
        self.inner.fail_balances.store(n, Ordering::SeqCst);
    }
}

impl ChannelNetwork for LocalChannelHub {
    fn connect(&self, key: &GuestKey) -> Result<Arc<dyn ChannelClient>, SessionError> {
        if HubInner::take_failure(&self.inner.fail_connects) {
            return Err(SessionError::Channel("node connection refused".into()));
        }
        let address = key.address(self.inner.host.network());
        Ok(Arc::new(LocalChannelClient {
            hub: self.inner.clone(),
            key: key.clone(),
            address,
        }))
    }

    fn register_handler(&self, handler: Arc<dyn ChannelEventHandler>) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn host_address(&self) -> &Address {
        &self.inner.host
    }
}

/// One guest wallet's client on a [`LocalChannelHub`].
pub struct LocalChannelClient {
    hub: Arc<HubInner>,
    key: GuestKey,
    address: Address,
}

impl LocalChannelClient {
    fn new_channel_id(&self) -> ChannelId {
        let nonce = uuid::Uuid::now_v7();
        let digest = Hasher::new()
            .update(&self.address.script().args)
            .update(nonce.as_bytes())
            .finalize();
        ChannelId(digest.0)
    }

    /// Lock `funding` from the guest's bare cells into a channel cell.
    async fn lock_funding(
        &self,
        channel: &ChannelId,
        funding: u64,
    ) -> Result<(OutPoint, u64), SessionError> {
        let ledger = self.hub.ledger.as_ref();
        let fee = self.hub.cells.fee_shannons;
        let min = self.hub.cells.min_cell_capacity_shannons;
        let required = funding
            .checked_add(fee)
            .ok_or_else(|| SessionError::InvalidInput("funding overflows".into()))?;

        let mut cells: Vec<LiveCell> = collect_cells(ledger, self.address.script(), true)
            .await?
            .into_iter()
            .filter(LiveCell::is_bare)
            .collect();
        cells.sort_by(|a, b| b.capacity().cmp(&a.capacity()));

        let mut inputs = Vec::new();
        let mut total: u64 = 0;
        for cell in &cells {
            if total >= required {
                break;
            }
            total = total.saturating_add(cell.capacity());
            inputs.push(CellInput::new(cell.out_point));
        }
        if total < required {
            return Err(SessionError::InsufficientFundingForChannel {
                available: Amount::from(total),
                required: Amount::from(required),
            });
        }

        // Change too small for its own cell stays in the channel cell.
        let change = total - required;
        let (locked, change_output) = if change >= min {
            (funding, Some(change))
        } else {
            (funding + change, None)
        };

        let mut outputs = vec![CellOutput::bare(locked, channel_lock(channel))];
        if let Some(change) = change_output {
            outputs.push(CellOutput::bare(change, self.address.script().clone()));
        }
        let mut tx = Transaction {
            version: 0,
            cell_deps: vec![self.address.network().secp256k1_dep_group()],
            header_deps: vec![],
            inputs,
            outputs_data: vec![vec![]; outputs.len()],
            outputs,
            witnesses: vec![],
        };
        sign_sighash_all(&mut tx, self.key.secret_key())?;
        let hash = ledger.send_transaction(&tx).await?;
        wait_for_commit(
            ledger,
            &hash,
            self.hub.cells.confirmation_interval(),
            self.hub.cells.confirmation_timeout(),
        )
        .await?;
        tracing::info!(channel = %channel.short(), tx_hash = %hash, locked, "Channel funding locked");
        Ok((OutPoint { tx_hash: hash, index: 0 }, locked))
    }

    /// Pay out a channel cell: the host's share and the guest's remainder.
    async fn release_funding(
        &self,
        channel: &ChannelId,
        state: &LocalChannel,
        cell: OutPoint,
        capacity: u64,
    ) -> Result<(), SessionError> {
        let ledger = self.hub.ledger.as_ref();
        let fee = self.hub.cells.fee_shannons;
        let paid = u64::try_from(state.paid().shannons()).unwrap_or(u64::MAX).min(capacity);
        let guest_share = capacity.saturating_sub(paid).saturating_sub(fee);

        let mut outputs = Vec::new();
        if guest_share > 0 {
            outputs.push(CellOutput::bare(guest_share, state.guest.script().clone()));
        }
        if paid > 0 {
            outputs.push(CellOutput::bare(paid, state.host.script().clone()));
        }
        let tx = Transaction {
            version: 0,
            cell_deps: vec![],
            header_deps: vec![],
            inputs: vec![CellInput::new(cell)],
            outputs_data: vec![vec![]; outputs.len()],
            outputs,
            witnesses: vec![vec![]],
        };
        let hash = ledger.send_transaction(&tx).await?;
        wait_for_commit(
            ledger,
            &hash,
            self.hub.cells.confirmation_interval(),
            self.hub.cells.confirmation_timeout(),
        )
        .await?;
        tracing::info!(
            channel = %channel.short(),
            tx_hash = %hash,
            guest_share,
            host_share = paid,
            "Channel funding released"
        );
        Ok(())
    }

    async fn close(&self, channel: &ChannelId, dispute: bool) -> Result<(), SessionError> {
        if HubInner::take_failure(&self.hub.fail_settles) {
            return Err(SessionError::Channel("peer did not countersign".into()));
        }

        let state = {
            let mut entry = self
                .hub
                .channels
                .get_mut(channel)
                .ok_or(SessionError::ChannelClosed(*channel))?;
            if !entry.open {
                return Err(SessionError::ChannelClosed(*channel));
            }
            entry.open = false;
            entry.clone()
        };

        if let Some((cell, capacity)) = state.cell {
            if let Err(e) = self.release_funding(channel, &state, cell, capacity).await {
                if let Some(mut entry) = self.hub.channels.get_mut(channel) {
                    entry.open = true;
                }
                return Err(e);
            }
        }

        self.hub.settles.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            channel = %channel.short(),
            dispute,
            version = state.version,
            guest_balance = %state.guest_balance,
            host_balance = %state.host_balance,
            "Channel closed"
        );
        Ok(())
    }
}

#[async_trait]
impl ChannelClient for LocalChannelClient {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn open(
        &self,
        peer: &Address,
        self_funding: Amount,
        peer_funding: Amount,
    ) -> Result<ChannelId, SessionError> {
        if HubInner::take_failure(&self.hub.fail_opens) {
            return Err(SessionError::Channel("channel proposal timed out".into()));
        }
        if peer != &self.hub.host {
            return Err(SessionError::Channel(format!("unknown peer {peer}")));
        }

        let proposal = ChannelProposal {
            proposer: self.address.clone(),
            proposer_funding: self_funding,
            host_funding: peer_funding,
        };
        let accepted = self
            .hub
            .handler()
            .is_some_and(|h| h.on_proposal(&proposal));
        if !accepted {
            return Err(SessionError::Channel("channel proposal rejected".into()));
        }

        let channel = self.new_channel_id();
        let cell = if self.hub.on_chain {
            let funding = u64::try_from(self_funding.shannons())
                .map_err(|_| SessionError::InvalidInput(format!("funding {self_funding} too large")))?;
            Some(self.lock_funding(&channel, funding).await?)
        } else {
            None
        };

        self.hub.channels.insert(
            channel,
            LocalChannel {
                guest: self.address.clone(),
                host: peer.clone(),
                guest_balance: self_funding,
                host_balance: peer_funding,
                host_funding: peer_funding,
                version: 0,
                open: true,
                cell,
            },
        );
        tracing::info!(
            channel = %channel.short(),
            guest = %self.address,
            funding = %self_funding,
            host_funding = %peer_funding,
            "Channel opened"
        );
        Ok(channel)
    }

    async fn pay(&self, channel: &ChannelId, amount: Amount) -> Result<(), SessionError> {
        if HubInner::take_failure(&self.hub.fail_pays) {
            return Err(SessionError::Channel("peer unreachable".into()));
        }

        let handler = self.hub.handler();
        let mut entry = self
            .hub
            .channels
            .get_mut(channel)
            .ok_or(SessionError::ChannelClosed(*channel))?;
        if !entry.open {
            return Err(SessionError::ChannelClosed(*channel));
        }
        if entry.guest != self.address {
            return Err(SessionError::Channel("only the guest pays on this channel".into()));
        }
        if entry.guest_balance < amount {
            return Err(SessionError::FundingExceeded {
                requested: amount,
                remaining: entry.guest_balance,
            });
        }

        let update = ChannelUpdate {
            channel: *channel,
            version: entry.version + 1,
            guest_balance: entry.guest_balance.checked_sub(amount)?,
            host_balance: entry.host_balance.checked_add(amount)?,
        };
        if !handler.is_some_and(|h| h.on_update(&update)) {
            return Err(SessionError::Channel("channel update rejected".into()));
        }
        entry.guest_balance = update.guest_balance;
        entry.host_balance = update.host_balance;
        entry.version = update.version;
        tracing::debug!(channel = %channel.short(), amount = %amount, version = update.version, "Channel payment");
        Ok(())
    }

    async fn settle(&self, channel: &ChannelId) -> Result<(), SessionError> {
        self.close(channel, false).await
    }

    async fn force_close(&self, channel: &ChannelId) -> Result<(), SessionError> {
        self.close(channel, true).await
    }

    async fn balance(&self, address: &Address) -> Result<Amount, SessionError> {
        if HubInner::take_failure(&self.hub.fail_balances) {
            return Err(LedgerError::Rpc("indexer unavailable".into()).into());
        }
        let capacity = self.hub.ledger.get_cells_capacity(address.script()).await?;
        Ok(Amount::from(capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::handler::AcceptAllHandler;
    use tollgate_ledger::{MemoryLedger, Network};

    const CKB: u64 = 100_000_000;
    const FEE: u64 = 100_000;

    struct RejectAll;

    impl ChannelEventHandler for RejectAll {
        fn on_proposal(&self, _proposal: &ChannelProposal) -> bool {
            false
        }

        fn on_update(&self, _update: &ChannelUpdate) -> bool {
            false
        }
    }

    fn ckb(n: u128) -> Amount {
        Amount::from_ckb(n).unwrap()
    }

    fn hub(on_chain: bool) -> (Arc<MemoryLedger>, LocalChannelHub) {
        let ledger = Arc::new(MemoryLedger::new());
        let host = GuestKey::generate().address(Network::Testnet);
        let mut hub = LocalChannelHub::new(ledger.clone(), host);
        if on_chain {
            hub = hub.with_on_chain_settlement(CellConfig::default());
        }
        hub.register_handler(Arc::new(AcceptAllHandler::new()));
        (ledger, hub)
    }

    #[tokio::test]
    async fn test_open_pay_settle_off_chain() {
        let (_ledger, hub) = hub(false);
        let client = hub.connect(&GuestKey::generate()).unwrap();

        let channel = client
            .open(hub.host_address(), ckb(100), ckb(100))
            .await
            .unwrap();
        client.pay(&channel, ckb(10)).await.unwrap();
        client.pay(&channel, ckb(5)).await.unwrap();
        assert_eq!(hub.channel_balances(&channel), Some((ckb(85), ckb(115))));

        client.settle(&channel).await.unwrap();
        assert_eq!(hub.settle_count(), 1);
        assert!(!hub.is_open(&channel));

        let err = client.settle(&channel).await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelClosed(_)));
        assert_eq!(hub.settle_count(), 1);
    }

    #[tokio::test]
    async fn test_pay_beyond_balance() {
        let (_ledger, hub) = hub(false);
        let client = hub.connect(&GuestKey::generate()).unwrap();
        let channel = client
            .open(hub.host_address(), ckb(10), ckb(100))
            .await
            .unwrap();

        let err = client.pay(&channel, ckb(11)).await.unwrap_err();
        assert!(matches!(err, SessionError::FundingExceeded { .. }));
        assert_eq!(hub.channel_balances(&channel), Some((ckb(10), ckb(100))));
    }

    #[tokio::test]
    async fn test_without_handler_proposals_are_rejected() {
        let ledger = Arc::new(MemoryLedger::new());
        let hub = LocalChannelHub::new(ledger, GuestKey::generate().address(Network::Testnet));
        let client = hub.connect(&GuestKey::generate()).unwrap();
        let err = client
            .open(hub.host_address(), ckb(100), ckb(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Channel(_)));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_balances() {
        let (_ledger, hub) = hub(false);
        let client = hub.connect(&GuestKey::generate()).unwrap();
        let channel = client
            .open(hub.host_address(), ckb(100), ckb(100))
            .await
            .unwrap();

        hub.register_handler(Arc::new(RejectAll));
        assert!(client.pay(&channel, ckb(1)).await.is_err());
        assert_eq!(hub.channel_balances(&channel), Some((ckb(100), ckb(100))));
    }

    #[tokio::test]
    async fn test_open_with_unknown_peer() {
        let (_ledger, hub) = hub(false);
        let client = hub.connect(&GuestKey::generate()).unwrap();
        let stranger = GuestKey::generate().address(Network::Testnet);
        assert!(client.open(&stranger, ckb(100), ckb(100)).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (_ledger, hub) = hub(false);
        let client = hub.connect(&GuestKey::generate()).unwrap();

        hub.fail_next_opens(1);
        assert!(client.open(hub.host_address(), ckb(100), ckb(100)).await.is_err());
        let channel = client
            .open(hub.host_address(), ckb(100), ckb(100))
            .await
            .unwrap();

        hub.fail_next_pays(1);
        assert!(client.pay(&channel, ckb(1)).await.is_err());
        client.pay(&channel, ckb(1)).await.unwrap();

        hub.fail_next_settles(1);
        assert!(client.settle(&channel).await.is_err());
        assert!(hub.is_open(&channel));
        client.settle(&channel).await.unwrap();

        hub.fail_next_balances(1);
        let err = client.balance(hub.host_address()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(client.balance(hub.host_address()).await.is_ok());

        hub.fail_next_connects(1);
        assert!(hub.connect(&GuestKey::generate()).is_err());
        assert!(hub.connect(&GuestKey::generate()).is_ok());
    }

    #[tokio::test]
    async fn test_on_chain_round_trip() {
        let (ledger, hub) = hub(true);
        let key = GuestKey::generate();
        let guest = key.address(Network::Testnet);
        for _ in 0..4 {
            ledger.mint(guest.script(), 100 * CKB);
        }
        let client = hub.connect(&key).unwrap();
        assert_eq!(client.balance(&guest).await.unwrap(), ckb(400));

        let channel = client
            .open(hub.host_address(), ckb(130), ckb(100))
            .await
            .unwrap();
        // Two 100-unit cells in: 130 locked, the rest back as change.
        assert_eq!(ledger.bare_capacities(&channel_lock(&channel)), vec![130 * CKB]);
        assert_eq!(
            ledger.bare_capacities(guest.script()).iter().sum::<u64>(),
            270 * CKB - FEE
        );

        client.pay(&channel, ckb(20)).await.unwrap();
        client.settle(&channel).await.unwrap();

        assert!(ledger.bare_capacities(&channel_lock(&channel)).is_empty());
        assert_eq!(
            ledger.bare_capacities(hub.host_address().script()),
            vec![20 * CKB]
        );
        assert_eq!(
            ledger.bare_capacities(guest.script()).iter().sum::<u64>(),
            380 * CKB - 2 * FEE
        );
    }

    #[tokio::test]
    async fn test_small_change_stays_in_channel() {
        let (ledger, hub) = hub(true);
        let key = GuestKey::generate();
        let guest = key.address(Network::Testnet);
        ledger.mint(guest.script(), 200 * CKB);
        let client = hub.connect(&key).unwrap();

        let channel = client
            .open(hub.host_address(), ckb(150), ckb(100))
            .await
            .unwrap();
        assert_eq!(
            ledger.bare_capacities(&channel_lock(&channel)),
            vec![200 * CKB - FEE]
        );
        assert!(ledger.bare_capacities(guest.script()).is_empty());
    }

    #[tokio::test]
    async fn test_on_chain_open_needs_capacity() {
        let (ledger, hub) = hub(true);
        let key = GuestKey::generate();
        ledger.mint(key.address(Network::Testnet).script(), 100 * CKB);
        let client = hub.connect(&key).unwrap();

        let err = client
            .open(hub.host_address(), ckb(100), ckb(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InsufficientFundingForChannel { .. }));
        assert_eq!(ledger.submitted_count(), 0);
    }
}
