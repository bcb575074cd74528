//! Integration test: session state on the RocksDB store across restarts.

use std::path::PathBuf;
use std::sync::Arc;

use tollgate_core::{SessionStatus, WalletStatus};
use tollgate_integration_tests::{ckb, Harness};
use tollgate_node::config::LedgerBackend;
use tollgate_node::{RocksStore, TollgateConfig, TollgateNode};
use tollgate_session::SessionStore;

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tollgate-it-{}", uuid::Uuid::now_v7()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test(start_paused = true)]
async fn test_settled_session_survives_reopen() {
    let dir = temp_dir();
    let (session_id, wallet_id) = {
        let store = Arc::new(RocksStore::open(&dir).unwrap());
        let h = Harness::with_store(store);
        let wallet = h.service.create_wallet("dev-rocks").unwrap();
        h.fund(&wallet.address, 562);
        h.detector.scan().await.unwrap();
        h.supervisor.wait_idle().await;

        let id = h.service.list_sessions().unwrap()[0].id;
        h.scheduler.tick().await;
        h.service.end(&id).await.unwrap();
        h.supervisor.wait_idle().await;
        (id, wallet.id)
    };

    let store = RocksStore::open(&dir).unwrap();
    let record = store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Settled);
    assert!(record.ended_at.is_some());
    assert!(record.channel_id.is_some());
    let wallet = store.get_wallet(&wallet_id).unwrap().unwrap();
    assert_eq!(wallet.status, WalletStatus::Withdrawn);
    assert_eq!(wallet.session_id, Some(session_id));
    assert!(wallet.sender_address.is_some());

    drop(store);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_restart_reopens_pending_session() {
    let dir = temp_dir();
    let session_id = {
        let store = Arc::new(RocksStore::open(&dir).unwrap());
        let h = Harness::with_store(store.clone());
        let view = h.service.create_wallet("dev-restart").unwrap();
        let wallet = store.get_wallet(&view.id).unwrap().unwrap();
        // Funding seen, but the node stopped before the channel open ran.
        let record = h.opener.register_funding(&wallet, ckb(562)).await.unwrap();
        assert_eq!(record.status, SessionStatus::Pending);
        record.id
    };

    // The restarted node runs against a fresh in-memory ledger that no
    // longer holds the wallet's cells, so the reopened attempt fails at
    // cell preparation.
    let mut config = TollgateConfig::default();
    config.ledger.backend = LedgerBackend::Memory;
    config.api.port = 0;
    config.storage.data_dir = dir.clone();
    let mut node = TollgateNode::new(config).unwrap();
    node.start().await.unwrap();
    node.supervisor().wait_idle().await;

    let record = node.store().get_session(&session_id).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::CellPreparationFailed);
    assert_eq!(node.registry().count().await, 0);

    node.shutdown().await.unwrap();
    drop(node);
    std::fs::remove_dir_all(&dir).ok();
}
