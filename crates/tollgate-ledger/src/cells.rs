use std::sync::Arc;

use tollgate_core::config::CellConfig;

use crate::address::{Address, Network};
use crate::error::LedgerError;
use crate::keys::GuestKey;
use crate::rpc::{collect_cells, LedgerClient};
use crate::signer::sign_sighash_all;
use crate::types::{CellInput, CellOutput, LiveCell, Transaction, TxStatus, H256};

/// Split `capacity` into two outputs after paying `fee`.
///
/// The halves are equal (the second takes the odd shannon); if the even
/// split falls under `min`, the first half is raised to `min`. Returns
/// `None` when the cell cannot yield two outputs of at least `min`.
pub fn split_capacities(capacity: u64, min: u64, fee: u64) -> Option<(u64, u64)> {
    let required = min.checked_mul(2)?.checked_add(fee)?;
    if capacity < required {
        return None;
    }
    let available = capacity - fee;
    let mut first = available / 2;
    let mut second = available - first;
    if first < min {
        first = min;
        second = available - first;
    }
    Some((first, second))
}

/// Keeps enough independently spendable bare cells at an address.
///
/// Channel operations consume one cell for the channel token and need
/// others for balancing, so a freshly funded wallet holding a single large
/// cell must be split first.
pub struct CellCapacityManager {
    client: Arc<dyn LedgerClient>,
    network: Network,
    config: CellConfig,
}

impl CellCapacityManager {
    pub fn new(client: Arc<dyn LedgerClient>, network: Network, config: CellConfig) -> Self {
        Self {
            client,
            network,
            config,
        }
    }

    /// Smallest cell that can be split: `2 × MIN_CELL_CAPACITY + FEE`.
    pub fn min_split_capacity(&self) -> u64 {
        self.config
            .min_cell_capacity_shannons
            .saturating_mul(2)
            .saturating_add(self.config.fee_shannons)
    }

    /// Fee paid by each split transaction.
    pub fn fee_shannons(&self) -> u64 {
        self.config.fee_shannons
    }

    /// All bare cells at `address`, oldest first.
    pub async fn bare_cells(&self, address: &Address) -> Result<Vec<LiveCell>, LedgerError> {
        let cells = collect_cells(self.client.as_ref(), address.script(), true).await?;
        Ok(cells.into_iter().filter(LiveCell::is_bare).collect())
    }

    pub async fn count_bare_cells(&self, address: &Address) -> Result<usize, LedgerError> {
        Ok(self.bare_cells(address).await?.len())
    }

    /// Split cells until `address` holds at least `min_count` bare cells.
    ///
    /// Progress is re-derived from the ledger on every round, so calling
    /// this again after a crash or on an already-prepared wallet is safe.
    /// Returns the number of split transactions committed.
    pub async fn ensure_minimum_cells(
        &self,
        key: &GuestKey,
        address: &Address,
        min_count: usize,
    ) -> Result<usize, LedgerError> {
        let mut splits = 0;
        loop {
            let cells = self.bare_cells(address).await?;
            if cells.len() >= min_count {
                if splits > 0 {
                    tracing::info!(
                        address = %address,
                        cells = cells.len(),
                        splits,
                        "Wallet cells prepared"
                    );
                }
                return Ok(splits);
            }

            let required = self.min_split_capacity();
            let candidate = cells
                .iter()
                .filter(|c| c.capacity() >= required)
                .max_by_key(|c| c.capacity())
                .ok_or(LedgerError::InsufficientCapacityForSplit { required })?;

            tracing::info!(
                address = %address,
                current = cells.len(),
                target = min_count,
                capacity = candidate.capacity(),
                "Splitting cell"
            );
            let hash = self.split_cell(key, candidate).await?;
            self.wait_for_confirmation(&hash).await?;
            splits += 1;
        }
    }

    /// Unsigned one-input, two-output split of `cell`, both outputs under the
    /// cell's own lock.
    pub fn build_split(&self, cell: &LiveCell) -> Result<Transaction, LedgerError> {
        let (first, second) = split_capacities(
            cell.capacity(),
            self.config.min_cell_capacity_shannons,
            self.config.fee_shannons,
        )
        .ok_or(LedgerError::InsufficientCapacityForSplit {
            required: self.min_split_capacity(),
        })?;

        let lock = cell.output.lock.clone();
        Ok(Transaction {
            version: 0,
            cell_deps: vec![self.network.secp256k1_dep_group()],
            header_deps: vec![],
            inputs: vec![CellInput::new(cell.out_point)],
            outputs: vec![
                CellOutput::bare(first, lock.clone()),
                CellOutput::bare(second, lock),
            ],
            outputs_data: vec![vec![], vec![]],
            witnesses: vec![],
        })
    }

    /// Build, sign and submit a split of `cell`.
    pub async fn split_cell(&self, key: &GuestKey, cell: &LiveCell) -> Result<H256, LedgerError> {
        let mut tx = self.build_split(cell)?;
        sign_sighash_all(&mut tx, key.secret_key())?;
        let hash = self.client.send_transaction(&tx).await?;
        tracing::info!(
            tx_hash = %hash,
            outputs = ?tx.outputs.iter().map(|o| o.capacity).collect::<Vec<_>>(),
            "Split transaction submitted"
        );
        Ok(hash)
    }

    /// Poll until `hash` is committed, rejected, or the confirmation timeout passes.
    pub async fn wait_for_confirmation(&self, hash: &H256) -> Result<(), LedgerError> {
        wait_for_commit(
            self.client.as_ref(),
            hash,
            self.config.confirmation_interval(),
            self.config.confirmation_timeout(),
        )
        .await
    }
}

/// Poll `get_transaction` every `interval` until committed or rejected.
/// Transport errors while polling are logged and polling continues.
pub async fn wait_for_commit(
    client: &dyn LedgerClient,
    hash: &H256,
    interval: std::time::Duration,
    timeout: std::time::Duration,
) -> Result<(), LedgerError> {
    let poll = async {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match client.get_transaction(hash).await {
                Ok(Some(tx)) => match tx.status {
                    TxStatus::Committed => return Ok(()),
                    TxStatus::Rejected(reason) => {
                        return Err(LedgerError::TransactionRejected {
                            hash: *hash,
                            reason,
                        })
                    }
                    TxStatus::Pending | TxStatus::Proposed | TxStatus::Unknown => {}
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tx_hash = %hash, error = %e, "Confirmation poll failed");
                }
            }
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| LedgerError::ConfirmationTimeout(*hash))?
}
