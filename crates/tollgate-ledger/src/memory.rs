use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::address::SECP256K1_BLAKE160_CODE_HASH;
use crate::error::LedgerError;
use crate::rpc::LedgerClient;
use crate::signer::recover_signer;
use crate::types::{
    CellInput, CellOutput, CellPage, LiveCell, OutPoint, Script, Transaction, TransactionWithStatus,
    TxRecord, TxStatus, H256,
};

struct Entry {
    transaction: Transaction,
    status: TxStatus,
    block_number: u64,
    touched: Vec<Script>,
}

#[derive(Default)]
struct Inner {
    /// Live cells keyed by creation sequence, so pages come out oldest first.
    live: BTreeMap<u64, LiveCell>,
    by_out_point: HashMap<OutPoint, u64>,
    transactions: HashMap<H256, Entry>,
    /// Committed and pending transactions in submission order.
    history: Vec<H256>,
    next_seq: u64,
    tip: u64,
    submitted: Vec<H256>,
    hold_pending: bool,
    reject_next: Option<String>,
    failing_calls: u32,
}

/// In-memory ledger.
///
/// Applies submitted transactions to its own cell set after checking inputs,
/// capacity and sighash signatures. Useful for testing and for running a
/// node without a ledger connection.
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a cell out of nothing.
    pub fn mint(&self, lock: &Script, capacity: u64) -> OutPoint {
        let mut state = self.state();
        // The sequence number keeps otherwise identical mints apart.
        let tx = Transaction {
            version: 0,
            cell_deps: vec![],
            header_deps: vec![H256(seq_bytes(state.next_seq))],
            inputs: vec![],
            outputs: vec![CellOutput::bare(capacity, lock.clone())],
            outputs_data: vec![vec![]],
            witnesses: vec![],
        };
        let hash = tx.hash();
        state.commit(hash, tx, vec![]);
        OutPoint {
            tx_hash: hash,
            index: 0,
        }
    }

    /// Send `capacity` from `sender` to `recipient` in one transaction whose
    /// first input belongs to `sender`, the way a wallet funding looks on-chain.
    pub fn fund(&self, sender: &Script, recipient: &Script, capacity: u64) -> OutPoint {
        let source = self.mint(sender, capacity);
        let mut state = self.state();
        let seq = state.next_seq;
        let tx = Transaction {
            version: 0,
            cell_deps: vec![],
            header_deps: vec![H256(seq_bytes(seq))],
            inputs: vec![CellInput::new(source)],
            outputs: vec![CellOutput::bare(capacity, recipient.clone())],
            outputs_data: vec![vec![]],
            witnesses: vec![],
        };
        let hash = tx.hash();
        let spent = state.spend_inputs(&tx);
        state.commit(hash, tx, spent);
        OutPoint {
            tx_hash: hash,
            index: 0,
        }
    }

    /// Keep submitted transactions pending until [`commit_pending`](Self::commit_pending).
    pub fn hold_pending(&self, hold: bool) {
        self.state().hold_pending = hold;
    }

    /// Commit every pending transaction whose inputs are still live.
    pub fn commit_pending(&self) {
        let mut state = self.state();
        let pending: Vec<H256> = state
            .history
            .iter()
            .filter(|h| {
                state
                    .transactions
                    .get(*h)
                    .is_some_and(|e| e.status == TxStatus::Pending)
            })
            .copied()
            .collect();
        for hash in pending {
            let Some(entry) = state.transactions.remove(&hash) else {
                continue;
            };
            if let Err(e) = state.check_inputs(&entry.transaction) {
                tracing::debug!(tx_hash = %hash, error = %e, "Dropping pending transaction");
                state.transactions.insert(
                    hash,
                    Entry {
                        status: TxStatus::Rejected(e.to_string()),
                        ..entry
                    },
                );
                continue;
            }
            let spent = state.spend_inputs(&entry.transaction);
            state.apply(hash, entry.transaction, spent, false);
        }
    }

    /// Mark the next submitted transaction as rejected by the pool.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.state().reject_next = Some(reason.into());
    }

    /// Make the next `n` RPC calls fail with a transport error.
    pub fn fail_next_calls(&self, n: u32) {
        self.state().failing_calls = n;
    }

    /// Transactions accepted through `send_transaction`, in order.
    pub fn submitted(&self) -> Vec<Transaction> {
        let state = self.state();
        state
            .submitted
            .iter()
            .filter_map(|h| state.transactions.get(h).map(|e| e.transaction.clone()))
            .collect()
    }

    pub fn submitted_count(&self) -> usize {
        self.state().submitted.len()
    }

    /// Capacities of the bare live cells of `lock`, oldest first.
    pub fn bare_capacities(&self, lock: &Script) -> Vec<u64> {
        self.state()
            .live
            .values()
            .filter(|c| &c.output.lock == lock && c.is_bare())
            .map(LiveCell::capacity)
            .collect()
    }

    fn take_failure(&self) -> Result<(), LedgerError> {
        let mut state = self.state();
        if state.failing_calls > 0 {
            state.failing_calls -= 1;
            return Err(LedgerError::Rpc("connection refused".into()));
        }
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn seq_bytes(seq: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&seq.to_le_bytes());
    out
}

impl Inner {
    fn check_inputs(&self, tx: &Transaction) -> Result<u128, LedgerError> {
        let mut total: u128 = 0;
        for input in &tx.inputs {
            let seq = self
                .by_out_point
                .get(&input.previous_output)
                .ok_or_else(|| {
                    LedgerError::Rpc(format!(
                        "input {}:{} is dead or unknown",
                        input.previous_output.tx_hash, input.previous_output.index
                    ))
                })?;
            if let Some(cell) = self.live.get(seq) {
                total += cell.capacity() as u128;
            }
        }
        Ok(total)
    }

    fn input_locks(&self, tx: &Transaction) -> Vec<Script> {
        tx.inputs
            .iter()
            .filter_map(|i| self.by_out_point.get(&i.previous_output))
            .filter_map(|seq| self.live.get(seq))
            .map(|c| c.output.lock.clone())
            .collect()
    }

    fn verify(&self, tx: &Transaction) -> Result<(), LedgerError> {
        if tx.inputs.is_empty() {
            return Err(LedgerError::Rpc("transaction has no inputs".into()));
        }
        if tx.outputs.len() != tx.outputs_data.len() {
            return Err(LedgerError::Rpc("outputs and outputs_data differ in length".into()));
        }
        let input_total = self.check_inputs(tx)?;
        if tx.total_output_capacity() > input_total {
            return Err(LedgerError::Rpc(format!(
                "outputs {} exceed inputs {}",
                tx.total_output_capacity(),
                input_total
            )));
        }

        let mut locks = self.input_locks(tx);
        locks.dedup();
        if locks.len() != 1 {
            return Err(LedgerError::Rpc("inputs must share one lock".into()));
        }
        let lock = &locks[0];
        if lock.code_hash == SECP256K1_BLAKE160_CODE_HASH {
            let signer = recover_signer(tx).map_err(|e| LedgerError::Rpc(e.to_string()))?;
            if signer.as_slice() != lock.args.as_slice() {
                return Err(LedgerError::Rpc("signature does not match input lock".into()));
            }
        }
        Ok(())
    }

    /// Remove the inputs from the live set, returning their locks.
    fn spend_inputs(&mut self, tx: &Transaction) -> Vec<Script> {
        let mut locks = Vec::new();
        for input in &tx.inputs {
            if let Some(seq) = self.by_out_point.remove(&input.previous_output) {
                if let Some(cell) = self.live.remove(&seq) {
                    locks.push(cell.output.lock);
                }
            }
        }
        locks
    }

    fn commit(&mut self, hash: H256, tx: Transaction, spent: Vec<Script>) {
        self.apply(hash, tx, spent, true);
    }

    fn apply(&mut self, hash: H256, tx: Transaction, mut touched: Vec<Script>, record: bool) {
        self.tip += 1;
        for (index, output) in tx.outputs.iter().enumerate() {
            let seq = self.next_seq;
            self.next_seq += 1;
            let out_point = OutPoint {
                tx_hash: hash,
                index: index as u32,
            };
            self.by_out_point.insert(out_point, seq);
            self.live.insert(
                seq,
                LiveCell {
                    out_point,
                    output: output.clone(),
                    data: tx.outputs_data.get(index).cloned().unwrap_or_default(),
                },
            );
            touched.push(output.lock.clone());
        }
        if record {
            self.history.push(hash);
        }
        self.transactions.insert(
            hash,
            Entry {
                transaction: tx,
                status: TxStatus::Committed,
                block_number: self.tip,
                touched,
            },
        );
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn get_cells(
        &self,
        lock: &Script,
        bare_only: bool,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<CellPage, LedgerError> {
        self.take_failure()?;
        let start = match cursor {
            Some(c) => c
                .parse::<u64>()
                .map_err(|_| LedgerError::Rpc(format!("bad cursor {c}")))?,
            None => 0,
        };
        let state = self.state();
        let mut cells = Vec::new();
        let mut last = start;
        for (seq, cell) in state.live.range(start..) {
            if cells.len() == limit as usize {
                break;
            }
            last = seq + 1;
            if &cell.output.lock != lock || (bare_only && !cell.is_bare()) {
                continue;
            }
            cells.push(cell.clone());
        }
        Ok(CellPage {
            cells,
            last_cursor: last.to_string(),
        })
    }

    async fn get_cells_capacity(&self, lock: &Script) -> Result<u64, LedgerError> {
        self.take_failure()?;
        let total: u128 = self
            .state()
            .live
            .values()
            .filter(|c| &c.output.lock == lock)
            .map(|c| c.capacity() as u128)
            .sum();
        Ok(u64::try_from(total).unwrap_or(u64::MAX))
    }

    async fn get_transactions(
        &self,
        lock: &Script,
        limit: u32,
    ) -> Result<Vec<TxRecord>, LedgerError> {
        self.take_failure()?;
        let state = self.state();
        Ok(state
            .history
            .iter()
            .rev()
            .filter_map(|h| state.transactions.get(h).map(|e| (h, e)))
            .filter(|(_, e)| e.status == TxStatus::Committed && e.touched.contains(lock))
            .take(limit as usize)
            .map(|(h, e)| TxRecord {
                tx_hash: *h,
                block_number: e.block_number,
            })
            .collect())
    }

    async fn get_transaction(
        &self,
        hash: &H256,
    ) -> Result<Option<TransactionWithStatus>, LedgerError> {
        self.take_failure()?;
        Ok(self
            .state()
            .transactions
            .get(hash)
            .map(|e| TransactionWithStatus {
                transaction: e.transaction.clone(),
                status: e.status.clone(),
            }))
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<H256, LedgerError> {
        self.take_failure()?;
        let mut state = self.state();
        state.verify(tx)?;
        let hash = tx.hash();
        state.submitted.push(hash);

        if let Some(reason) = state.reject_next.take() {
            let touched = state.input_locks(tx);
            state.transactions.insert(
                hash,
                Entry {
                    transaction: tx.clone(),
                    status: TxStatus::Rejected(reason),
                    block_number: 0,
                    touched,
                },
            );
            return Ok(hash);
        }

        if state.hold_pending {
            let touched = state.input_locks(tx);
            state.history.push(hash);
            state.transactions.insert(
                hash,
                Entry {
                    transaction: tx.clone(),
                    status: TxStatus::Pending,
                    block_number: 0,
                    touched,
                },
            );
            return Ok(hash);
        }

        let spent = state.spend_inputs(tx);
        state.commit(hash, tx.clone(), spent);
        tracing::debug!(tx_hash = %hash, "Memory ledger committed transaction");
        Ok(hash)
    }
}
