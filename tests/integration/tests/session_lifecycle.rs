//! Integration test: a guest session from wallet generation to refund.
//!
//! Funding detection, cell preparation, channel open, per-minute debits,
//! settlement and withdrawal, all against the in-memory ledger.

use chrono::TimeDelta;
use std::time::Duration;

use tollgate_core::{Amount, SessionStatus, WalletStatus};
use tollgate_integration_tests::{ckb, Harness, CKB, FEE, RATE};
use tollgate_ledger::{GuestKey, Network};
use tollgate_session::{ChannelNetwork, SessionError};

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_fund_open_debit_end_refund() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("aa:bb:cc:dd").unwrap();
    assert_eq!(wallet.status, WalletStatus::Created);

    // Below the threshold nothing happens.
    assert_eq!(h.detector.scan().await.unwrap(), 0);

    h.fund(&wallet.address, 562);
    assert_eq!(h.detector.scan().await.unwrap(), 1);
    h.supervisor.wait_idle().await;

    let sessions = h.service.list_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    let view = &sessions[0];
    assert_eq!(view.status, SessionStatus::Active);
    // Three splits to reach four cells, then the setup reserve.
    let funding = Amount::from(562 * CKB - 3 * FEE - 62 * CKB);
    assert_eq!(view.funding_amount, funding);
    assert_eq!(view.spent, Amount(RATE));
    assert!(view.channel_id.is_some());
    assert_eq!(h.access.authorizations("aa:bb:cc:dd"), 1);

    let wallet = h.service.get_wallet(&wallet.id).unwrap();
    assert_eq!(wallet.status, WalletStatus::ChannelOpen);
    assert_eq!(wallet.session_id, Some(view.id));

    // Three minutes of debits.
    for _ in 0..3 {
        assert_eq!(h.scheduler.tick().await.paid, 1);
    }
    let live = h.registry.get(&view.id).await.unwrap();
    assert_eq!(live.total_paid, Amount(4 * RATE));

    let ended = h.service.end(&view.id).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Settling);
    assert!(h.registry.get(&view.id).await.is_none());

    h.supervisor.wait_idle().await;

    let record = h.service.get_session(&view.id).unwrap();
    assert_eq!(record.status, SessionStatus::Settled);
    assert_eq!(record.spent, Amount(4 * RATE));
    assert_eq!(h.access.deauthorizations("aa:bb:cc:dd"), 1);
    assert_eq!(h.hub.settle_count(), 1);

    // The host holds what was paid; the funder gets the rest back minus
    // one fee per transaction: three splits, lock, settle, withdraw.
    let paid = 4 * RATE as u64;
    assert_eq!(h.balance_of(h.hub.host_address()), paid);
    assert_eq!(h.funder_balance(), 562 * CKB - 6 * FEE - paid);

    let wallet = h.service.get_wallet(&wallet.id).unwrap();
    assert_eq!(wallet.status, WalletStatus::Withdrawn);
    assert_eq!(wallet.balance, Amount::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_session_runs_out_of_funds() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("dev-low").unwrap();
    // 250 CKB leaves 250 - 3 fees - 62 = ~188 CKB of channel funding.
    h.fund(&wallet.address, 250);
    h.detector.scan().await.unwrap();
    h.supervisor.wait_idle().await;

    let id = h.service.list_sessions().unwrap()[0].id;
    let funding = h.registry.get(&id).await.unwrap().funding_amount;
    let ticks = (funding.shannons() / RATE) as usize;

    let mut paid = 1; // catch-up
    let mut settled = 0;
    for _ in 0..ticks + 2 {
        let report = h.scheduler.tick().await;
        paid += report.paid;
        settled += report.settled;
        if let Some(live) = h.registry.get(&id).await {
            assert!(live.total_paid <= live.funding_amount);
        }
    }
    assert_eq!(settled, 1);
    assert_eq!(paid, ticks);

    h.supervisor.wait_idle().await;
    let record = h.store.get_session(&id).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Settled);
    assert_eq!(record.spent, Amount(ticks as u128 * RATE));
    assert!(record.spent <= record.funding_amount);
    assert_eq!(h.hub.settle_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_session_expires() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("dev-exp").unwrap();
    h.fund(&wallet.address, 562);
    h.detector.scan().await.unwrap();
    h.supervisor.wait_idle().await;

    let id = h.service.list_sessions().unwrap()[0].id;
    let session = h.registry.get(&id).await.unwrap();
    let report = h
        .scheduler
        .tick_at(session.expires_at() + TimeDelta::seconds(1))
        .await;
    assert_eq!(report.settled, 1);

    h.supervisor.wait_idle().await;
    assert_eq!(
        h.store.get_session(&id).unwrap().unwrap().status,
        SessionStatus::Settled
    );
    assert_eq!(h.access.deauthorizations("dev-exp"), 1);
}

// =========================================================================
// Extend
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_extend_then_end_sums_every_payment() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("dev-ext").unwrap();
    h.fund(&wallet.address, 562);
    h.detector.scan().await.unwrap();
    h.supervisor.wait_idle().await;
    let id = h.service.list_sessions().unwrap()[0].id;
    let before = h.registry.get(&id).await.unwrap().expires_at();

    h.scheduler.tick().await;
    let view = h.service.extend(&id, ckb(25)).await.unwrap();
    // 25 CKB buys three whole minutes at 8.33 CKB each.
    assert_eq!(view.expires_at - before, TimeDelta::minutes(3));
    h.scheduler.tick().await;

    h.service.end(&id).await.unwrap();
    h.supervisor.wait_idle().await;
    let record = h.service.get_session(&id).unwrap();
    assert_eq!(record.status, SessionStatus::Settled);
    assert_eq!(record.spent, Amount(3 * RATE + ckb(25).shannons()));
}

// =========================================================================
// Failure paths
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_channel_open_failure_revokes_access() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("dev-fail").unwrap();
    h.fund(&wallet.address, 562);
    h.hub.fail_next_opens(1);
    h.detector.scan().await.unwrap();
    h.supervisor.wait_idle().await;

    let view = &h.service.list_sessions().unwrap()[0];
    assert_eq!(view.status, SessionStatus::ChannelFailed);
    assert_eq!(
        h.service.get_wallet(&wallet.id).unwrap().status,
        WalletStatus::ChannelFailed
    );
    assert_eq!(h.access.authorizations("dev-fail"), 1);
    assert_eq!(h.access.deauthorizations("dev-fail"), 1);
    assert_eq!(h.registry.count().await, 0);

    // The funds are still recoverable by hand.
    h.service.withdraw(&view.id, None).await.unwrap();
    assert_eq!(h.funder_balance(), 562 * CKB - 4 * FEE);
}

#[tokio::test(start_paused = true)]
async fn test_unsplittable_wallet_fails_cell_preparation() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("dev-small").unwrap();
    h.fund(&wallet.address, 150);
    h.detector.scan().await.unwrap();
    h.supervisor.wait_idle().await;

    let view = &h.service.list_sessions().unwrap()[0];
    assert_eq!(view.status, SessionStatus::CellPreparationFailed);
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_settlement_failure_still_refunds() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("dev-settle").unwrap();
    h.fund(&wallet.address, 562);
    h.detector.scan().await.unwrap();
    h.supervisor.wait_idle().await;
    let id = h.service.list_sessions().unwrap()[0].id;

    h.hub.fail_next_settles(1);
    h.service.end(&id).await.unwrap();
    h.supervisor.wait_idle().await;

    assert_eq!(
        h.store.get_session(&id).unwrap().unwrap().status,
        SessionStatus::Settled
    );
    // The channel cell stayed locked; only the change cell came back.
    assert_eq!(
        h.service.get_wallet(&wallet.id).unwrap().status,
        WalletStatus::Withdrawn
    );
    assert!(h.funder_balance() > 0);
}

#[tokio::test(start_paused = true)]
async fn test_withdraw_retries_until_cells_are_spendable() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("dev-retry").unwrap();
    h.fund(&wallet.address, 562);
    h.detector.scan().await.unwrap();
    h.supervisor.wait_idle().await;
    let id = h.service.list_sessions().unwrap()[0].id;

    // First two withdrawal attempts hit a transport failure.
    h.service.end(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.ledger.fail_next_calls(2);
    h.supervisor.wait_idle().await;

    assert_eq!(
        h.service.get_wallet(&wallet.id).unwrap().status,
        WalletStatus::Withdrawn
    );
}

#[tokio::test]
async fn test_manual_withdraw_to_explicit_address() {
    let h = Harness::new();
    let wallet = h.service.create_wallet("dev-manual").unwrap();
    h.fund(&wallet.address, 150);
    h.detector.scan().await.unwrap();
    h.supervisor.wait_idle().await;
    let id = h.service.list_sessions().unwrap()[0].id;

    let target = GuestKey::generate().address(Network::Testnet);
    h.service
        .withdraw(&id, Some(&target.encode().unwrap()))
        .await
        .unwrap();
    assert_eq!(h.balance_of(&target), 150 * CKB - 2 * FEE);

    let err = h.service.withdraw(&id, None).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyWithdrawn(_)));
}
