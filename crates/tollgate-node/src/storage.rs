//! RocksDB storage backend for the Tollgate node.

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use tollgate_core::{SessionId, WalletId};
use tollgate_session::{GuestWallet, SessionRecord, SessionStore, StoreError};

/// Column family names for different data types.
const CF_SESSIONS: &str = "sessions";
const CF_WALLETS: &str = "wallets";
const CF_SETTINGS: &str = "settings";

const KEY_RATE_PER_HOUR: &str = "rate_per_hour";

/// RocksDB-backed [`SessionStore`]. Records are JSON values keyed by id.
pub struct RocksStore {
    db: DB,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path with column families.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_SESSIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_WALLETS, Options::default()),
            ColumnFamilyDescriptor::new(CF_SETTINGS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> Result<(), StoreError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Backend(format!("column family '{}' not found", cf_name)))?;
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db
            .put_cf(&cf, key.as_bytes(), bytes)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> Result<Option<T>, StoreError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Backend(format!("column family '{}' not found", cf_name)))?;
        let Some(bytes) = self
            .db
            .get_cf(&cf, key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn list<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>, StoreError> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Backend(format!("column family '{}' not found", cf_name)))?;
        self.db
            .iterator_cf(&cf, IteratorMode::Start)
            .map(|item| {
                let (_, bytes) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    fn modify<T: Serialize + DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &str,
        f: &mut dyn FnMut(&mut T),
    ) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut value: T = self
            .get(cf_name, key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        f(&mut value);
        self.put(cf_name, key, &value)?;
        Ok(value)
    }
}

impl SessionStore for RocksStore {
    fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.put(CF_SESSIONS, &record.id.to_string(), &record)
    }

    fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.get(CF_SESSIONS, &id.to_string())
    }

    fn modify_session(
        &self,
        id: &SessionId,
        f: &mut dyn FnMut(&mut SessionRecord),
    ) -> Result<SessionRecord, StoreError> {
        self.modify(CF_SESSIONS, &id.to_string(), f)
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.list(CF_SESSIONS)
    }

    fn insert_wallet(&self, wallet: GuestWallet) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.put(CF_WALLETS, &wallet.id.to_string(), &wallet)
    }

    fn get_wallet(&self, id: &WalletId) -> Result<Option<GuestWallet>, StoreError> {
        self.get(CF_WALLETS, &id.to_string())
    }

    fn modify_wallet(
        &self,
        id: &WalletId,
        f: &mut dyn FnMut(&mut GuestWallet),
    ) -> Result<GuestWallet, StoreError> {
        self.modify(CF_WALLETS, &id.to_string(), f)
    }

    fn list_wallets(&self) -> Result<Vec<GuestWallet>, StoreError> {
        self.list(CF_WALLETS)
    }

    fn get_rate_per_hour(&self) -> Result<Option<u64>, StoreError> {
        self.get(CF_SETTINGS, KEY_RATE_PER_HOUR)
    }

    fn set_rate_per_hour(&self, ckb: u64) -> Result<(), StoreError> {
        self.put(CF_SETTINGS, KEY_RATE_PER_HOUR, &ckb)
    }
}
