pub mod json;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::LedgerError;
use crate::types::{CellPage, LiveCell, Script, Transaction, TransactionWithStatus, TxRecord, H256};
use json::{
    hex_u64, parse_u64, JsonCapacity, JsonCell, JsonPage, JsonScript, JsonTransaction,
    JsonTxRecord, JsonTxWithStatus, Request, Response,
};

/// Ledger node + indexer interface.
///
/// The on-chain workers only need these five calls. Implementations must be
/// safe to share between tasks.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// One page of live cells locked by `lock`, oldest first. With
    /// `bare_only`, cells carrying a type script are excluded.
    async fn get_cells(
        &self,
        lock: &Script,
        bare_only: bool,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<CellPage, LedgerError>;

    /// Total capacity of all live cells locked by `lock`.
    async fn get_cells_capacity(&self, lock: &Script) -> Result<u64, LedgerError>;

    /// Most recent transactions touching `lock`, newest first, deduplicated.
    async fn get_transactions(&self, lock: &Script, limit: u32)
        -> Result<Vec<TxRecord>, LedgerError>;

    /// Look up a transaction; `None` when the node does not know it.
    async fn get_transaction(
        &self,
        hash: &H256,
    ) -> Result<Option<TransactionWithStatus>, LedgerError>;

    /// Submit a signed transaction, returning its hash.
    async fn send_transaction(&self, tx: &Transaction) -> Result<H256, LedgerError>;
}

/// Page size used when a caller needs every cell of a lock.
pub const CELL_PAGE_SIZE: u32 = 100;

/// Collect every live cell of `lock`, following the indexer cursor.
pub async fn collect_cells(
    client: &dyn LedgerClient,
    lock: &Script,
    bare_only: bool,
) -> Result<Vec<LiveCell>, LedgerError> {
    let mut cells = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = client
            .get_cells(lock, bare_only, CELL_PAGE_SIZE, cursor.as_deref())
            .await?;
        let exhausted = page.cells.len() < CELL_PAGE_SIZE as usize || page.last_cursor.is_empty();
        cells.extend(page.cells);
        if exhausted {
            return Ok(cells);
        }
        cursor = Some(page.last_cursor);
    }
}

/// JSON-RPC client for a ledger node with the indexer module enabled.
pub struct CkbRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl CkbRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, LedgerError> {
        let request = Request {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            jsonrpc: "2.0",
            method,
            params,
        };
        tracing::trace!(method, id = request.id, "ledger RPC call");

        let resp = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: Response<T> = resp.json().await?;
        if let Some(err) = body.error {
            return Err(LedgerError::Rpc(format!(
                "{method}: {} (code {})",
                err.message, err.code
            )));
        }
        Ok(body.result)
    }

    fn search_key(lock: &Script, bare_only: bool) -> serde_json::Value {
        let mut key = json!({
            "script": JsonScript::from(lock),
            "script_type": "lock",
            "script_search_mode": "exact",
            "with_data": true,
        });
        if bare_only {
            // Type script length in [0, 1): no type script at all.
            key["filter"] = json!({ "script_len_range": ["0x0", "0x1"] });
        }
        key
    }
}

#[async_trait]
impl LedgerClient for CkbRpcClient {
    async fn get_cells(
        &self,
        lock: &Script,
        bare_only: bool,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<CellPage, LedgerError> {
        let params = json!([
            Self::search_key(lock, bare_only),
            "asc",
            hex_u64(limit as u64),
            cursor
        ]);
        let page: JsonPage<JsonCell> = self
            .call("get_cells", params)
            .await?
            .ok_or_else(|| LedgerError::Decode("get_cells returned null".into()))?;
        let cells = page
            .objects
            .into_iter()
            .map(LiveCell::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CellPage {
            cells,
            last_cursor: page.last_cursor,
        })
    }

    async fn get_cells_capacity(&self, lock: &Script) -> Result<u64, LedgerError> {
        let params = json!([Self::search_key(lock, false)]);
        let capacity: Option<JsonCapacity> = self.call("get_cells_capacity", params).await?;
        match capacity {
            Some(c) => parse_u64(&c.capacity),
            None => Ok(0),
        }
    }

    async fn get_transactions(
        &self,
        lock: &Script,
        limit: u32,
    ) -> Result<Vec<TxRecord>, LedgerError> {
        let params = json!([
            Self::search_key(lock, false),
            "desc",
            hex_u64(limit as u64),
            null
        ]);
        let page: JsonPage<JsonTxRecord> = self
            .call("get_transactions", params)
            .await?
            .ok_or_else(|| LedgerError::Decode("get_transactions returned null".into()))?;

        // A transaction that both spends and creates cells of `lock` is listed twice.
        let mut records: Vec<TxRecord> = Vec::with_capacity(page.objects.len());
        for obj in page.objects {
            let tx_hash: H256 = obj.tx_hash.parse()?;
            if records.iter().any(|r| r.tx_hash == tx_hash) {
                continue;
            }
            records.push(TxRecord {
                tx_hash,
                block_number: parse_u64(&obj.block_number)?,
            });
        }
        Ok(records)
    }

    async fn get_transaction(
        &self,
        hash: &H256,
    ) -> Result<Option<TransactionWithStatus>, LedgerError> {
        let result: Option<JsonTxWithStatus> =
            self.call("get_transaction", json!([hash.to_string()])).await?;
        let Some(result) = result else {
            return Ok(None);
        };
        let Some(tx) = result.transaction else {
            return Ok(None);
        };
        Ok(Some(TransactionWithStatus {
            transaction: tx.try_into()?,
            status: result.tx_status.into(),
        }))
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<H256, LedgerError> {
        let params = json!([JsonTransaction::from(tx), "passthrough"]);
        let hash: String = self
            .call("send_transaction", params)
            .await?
            .ok_or_else(|| LedgerError::Decode("send_transaction returned null".into()))?;
        hash.parse()
    }
}
