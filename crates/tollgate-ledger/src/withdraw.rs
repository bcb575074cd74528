use std::sync::Arc;

use tollgate_core::config::CellConfig;

use crate::address::{Address, Network};
use crate::error::LedgerError;
use crate::keys::GuestKey;
use crate::rpc::{collect_cells, LedgerClient};
use crate::signer::sign_sighash_all;
use crate::types::{CellInput, CellOutput, LiveCell, Transaction, H256};

/// How many of the wallet's most recent transactions are searched for a sender.
pub const SENDER_SEARCH_LIMIT: u32 = 10;

/// Sweeps a guest wallet's remaining bare capacity back to its funder.
pub struct Withdrawer {
    client: Arc<dyn LedgerClient>,
    network: Network,
    config: CellConfig,
}

impl Withdrawer {
    pub fn new(client: Arc<dyn LedgerClient>, network: Network, config: CellConfig) -> Self {
        Self {
            client,
            network,
            config,
        }
    }

    /// Find the address that funded `wallet`.
    ///
    /// Walks the wallet's most recent transactions, newest first, and
    /// resolves the lock of each one's first input. The first lock that is
    /// not the wallet's own is the sender. Lookups that fail for a single
    /// transaction are skipped.
    pub async fn detect_sender_address(&self, wallet: &Address) -> Result<Address, LedgerError> {
        let own_lock = wallet.script();
        let records = self
            .client
            .get_transactions(own_lock, SENDER_SEARCH_LIMIT)
            .await?;

        for record in records {
            let tx = match self.client.get_transaction(&record.tx_hash).await {
                Ok(Some(tx)) => tx.transaction,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(tx_hash = %record.tx_hash, error = %e, "Skipping transaction");
                    continue;
                }
            };
            let Some(first_input) = tx.inputs.first() else {
                continue;
            };
            let previous = first_input.previous_output;
            let parent = match self.client.get_transaction(&previous.tx_hash).await {
                Ok(Some(parent)) => parent.transaction,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(tx_hash = %previous.tx_hash, error = %e, "Skipping input");
                    continue;
                }
            };
            let Some(spent) = parent.outputs.get(previous.index as usize) else {
                continue;
            };
            if &spent.lock == own_lock {
                continue;
            }

            let sender = Address::new(self.network, spent.lock.clone());
            tracing::info!(sender = %sender, tx_hash = %record.tx_hash, "Found sender address");
            return Ok(sender);
        }

        Err(LedgerError::NoSenderDetected)
    }

    /// Send every bare cell at `from` to `to` in a single output, minus the fee.
    ///
    /// Nothing is submitted when the total does not exceed
    /// `FEE + MIN_CELL_CAPACITY`.
    pub async fn withdraw_all(
        &self,
        key: &GuestKey,
        from: &Address,
        to: &Address,
    ) -> Result<H256, LedgerError> {
        let cells: Vec<LiveCell> = collect_cells(self.client.as_ref(), from.script(), true)
            .await?
            .into_iter()
            .filter(LiveCell::is_bare)
            .collect();

        let mut tx = self.build_withdrawal(&cells, to)?;
        tracing::info!(
            to = %to,
            inputs = tx.inputs.len(),
            output_capacity = tx.total_output_capacity() as u64,
            fee = self.config.fee_shannons,
            "Withdrawing wallet balance"
        );

        sign_sighash_all(&mut tx, key.secret_key())?;
        let hash = self.client.send_transaction(&tx).await?;
        tracing::info!(tx_hash = %hash, "Withdrawal transaction submitted");
        Ok(hash)
    }

    /// Unsigned sweep of `cells` into one output locked to `to`.
    pub fn build_withdrawal(
        &self,
        cells: &[LiveCell],
        to: &Address,
    ) -> Result<Transaction, LedgerError> {
        let total: u128 = cells.iter().map(|c| c.capacity() as u128).sum();
        let floor = self.config.fee_shannons as u128 + self.config.min_cell_capacity_shannons as u128;
        if total <= floor {
            return Err(LedgerError::InsufficientBalance { available: total });
        }
        let output = u64::try_from(total - self.config.fee_shannons as u128)
            .map_err(|_| LedgerError::CapacityOverflow)?;

        Ok(Transaction {
            version: 0,
            cell_deps: vec![self.network.secp256k1_dep_group()],
            header_deps: vec![],
            inputs: cells.iter().map(|c| CellInput::new(c.out_point)).collect(),
            outputs: vec![CellOutput::bare(output, to.script().clone())],
            outputs_data: vec![vec![]],
            witnesses: vec![Vec::new(); cells.len()],
        })
    }
}
