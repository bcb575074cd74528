//! Integration test: the HTTP API of a running node on the in-memory ledger.

use serde_json::{json, Value};
use std::sync::Arc;

use tollgate_core::SessionId;
use tollgate_integration_tests::CKB;
use tollgate_ledger::address::sighash_lock;
use tollgate_ledger::Address;
use tollgate_node::config::LedgerBackend;
use tollgate_node::{TollgateConfig, TollgateNode};
use tollgate_session::{MemoryStore, SessionStore};

async fn start_node() -> (TollgateNode, String) {
    let mut config = TollgateConfig::default();
    config.ledger.backend = LedgerBackend::Memory;
    config.api.listen_addr = "127.0.0.1".into();
    config.api.port = 0;
    config.settlement.withdraw_retry_waits_secs = vec![0];

    let mut node = TollgateNode::with_store(config, Arc::new(MemoryStore::new())).unwrap();
    node.start().await.unwrap();
    let base = format!("http://{}", node.api_addr().unwrap());
    (node, base)
}

#[tokio::test]
async fn test_health() {
    let (mut node, base) = start_node().await;

    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);
    assert_eq!(body["host_address"], node.host_address().encode().unwrap());

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wallet_to_settled_session_over_http() {
    let (mut node, base) = start_node().await;
    let client = reqwest::Client::new();

    // Generate a guest wallet.
    let resp = client
        .post(format!("{base}/api/v1/wallets"))
        .json(&json!({ "device_id": "aa:bb:cc:dd" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let wallet: Value = resp.json().await.unwrap();
    assert_eq!(wallet["status"], "created");
    assert!(wallet.get("secret_key_hex").is_none());
    let wallet_id = wallet["id"].as_str().unwrap().to_string();
    let address = Address::parse(wallet["address"].as_str().unwrap()).unwrap();

    // Fund it and let the detector pick it up.
    let ledger = node.memory_ledger().unwrap().clone();
    ledger.fund(&sighash_lock([0x07; 20]), address.script(), 562 * CKB);
    assert_eq!(node.funding_detector().scan().await.unwrap(), 1);
    node.supervisor().wait_idle().await;

    let wallet: Value = client
        .get(format!("{base}/api/v1/wallets/{wallet_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(wallet["status"], "channel_open");

    let listing: Value = client
        .get(format!("{base}/api/v1/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["count"], 1);
    let session = &listing["sessions"][0];
    assert_eq!(session["status"], "active");
    assert_eq!(session["device_id"], "aa:bb:cc:dd");
    let session_id = session["id"].as_str().unwrap().to_string();
    let spent_before = session["spent"].as_u64().unwrap();

    // Extend by 25 CKB.
    let resp = client
        .post(format!("{base}/api/v1/sessions/{session_id}/extend"))
        .json(&json!({ "amount_ckb": 25 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let extended: Value = resp.json().await.unwrap();
    assert_eq!(
        extended["spent"].as_u64().unwrap(),
        spent_before + 25 * CKB
    );

    // More than the channel holds is refused.
    let resp = client
        .post(format!("{base}/api/v1/sessions/{session_id}/extend"))
        .json(&json!({ "amount_ckb": 10_000 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // End it and wait for settlement and the refund.
    let resp = client
        .post(format!("{base}/api/v1/sessions/{session_id}/end"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ended: Value = resp.json().await.unwrap();
    assert_eq!(ended["status"], "settling");
    node.supervisor().wait_idle().await;

    let settled: Value = client
        .get(format!("{base}/api/v1/sessions/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(settled["status"], "settled");
    assert!(settled["ended_at"].is_string());

    // The wallet was already emptied by the automatic refund.
    let resp = client
        .post(format!("{base}/api/v1/sessions/{session_id}/withdraw"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Ending twice is harmless.
    let resp = client
        .post(format!("{base}/api/v1/sessions/{session_id}/end"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_settings() {
    let (mut node, base) = start_node().await;
    let client = reqwest::Client::new();

    let settings: Value = client
        .get(format!("{base}/api/v1/settings"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(settings["rate_per_hour"], 500);
    assert_eq!(settings["channel_setup_ckb"], 62);
    assert_eq!(settings["minimum_ckb"], 562);

    let resp = client
        .put(format!("{base}/api/v1/settings"))
        .json(&json!({ "rate_per_hour": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .put(format!("{base}/api/v1/settings"))
        .json(&json!({ "rate_per_hour": 60 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let settings: Value = resp.json().await.unwrap();
    assert_eq!(settings["rate_per_hour"], 60);
    assert_eq!(settings["minimum_ckb"], 122);
    assert_eq!(node.store().get_rate_per_hour().unwrap(), Some(60));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lookup_errors() {
    let (mut node, base) = start_node().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/api/v1/sessions/{}", SessionId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let resp = client
        .get(format!("{base}/api/v1/sessions/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{base}/api/v1/wallets/{}", uuid::Uuid::now_v7()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{base}/api/v1/sessions/{}/end", SessionId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    node.shutdown().await.unwrap();
}
