//! Position-scan scenarios: creation, APY-shift thresholds, closures and
//! failure isolation.

mod common;

use common::*;
use lendwatch::chains::Chain;
use lendwatch::database;

async fn seed_user_with_wallet(h: &TestHarness, channel: &str, suffix: u8) -> i64 {
    let user = database::upsert_user(&h.db, channel).await.unwrap();
    database::set_user_wallet(&h.db, channel, &wallet_string(suffix))
        .await
        .unwrap();
    user
}

#[tokio::test]
async fn first_observation_creates_position_without_events() {
    let h = build_harness().await;
    seed_user_with_wallet(&h, "chat-p0", 1).await;

    h.source
        .set_pools(Chain::Ethereum, vec![pool(addr(0xA1), Chain::Ethereum, "USDC", 6.0)]);
    h.engine.run_discovery_once().await.unwrap();

    h.reader
        .set_balance(Chain::Ethereum, addr(0xA1), wallet(1), 1_000_000);
    let report = h.engine.run_position_scan_once().await.unwrap();

    assert_eq!(report.positions_updated, 1);
    assert_eq!(report.apy_events, 0);
    assert!(h.gateway.sent().is_empty());

    let positions = database::load_active_positions(&h.db).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].initial_supply_apy, 6.0);
    assert_eq!(positions[0].current_supply_apy, 6.0);
}

#[tokio::test]
async fn s2_apy_dip_emits_one_minor_event() {
    let h = build_harness().await;
    seed_user_with_wallet(&h, "chat-s2", 2).await;

    h.source
        .set_pools(Chain::Ethereum, vec![pool(addr(0xA2), Chain::Ethereum, "USDC", 6.0)]);
    h.engine.run_discovery_once().await.unwrap();
    h.reader
        .set_balance(Chain::Ethereum, addr(0xA2), wallet(2), 1_000_000);
    h.engine.run_position_scan_once().await.unwrap();
    assert!(h.gateway.sent().is_empty());

    // Cache APY drifts to 5.3 in the next discovery pass.
    h.source
        .set_pools(Chain::Ethereum, vec![pool(addr(0xA2), Chain::Ethereum, "USDC", 5.3)]);
    h.engine.run_discovery_once().await.unwrap();
    let report = h.engine.run_position_scan_once().await.unwrap();

    assert_eq!(report.apy_events, 1);
    let sent = h.gateway.sent_to("chat-s2");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("6.00%"));
    assert!(sent[0].text.contains("5.30%"));
    assert!(!sent[0].text.contains("Major"));

    let positions = database::load_active_positions(&h.db).await.unwrap();
    assert_eq!(positions[0].current_supply_apy, 5.3);
    assert_eq!(positions[0].initial_supply_apy, 6.0);
}

#[tokio::test]
async fn apy_threshold_edges_and_major_flag() {
    let h = build_harness().await;
    seed_user_with_wallet(&h, "chat-thr", 3).await;

    let pools = |a: f64, b: f64, c: f64| {
        vec![
            pool(addr(0xB1), Chain::Ethereum, "USDC", a),
            pool(addr(0xB2), Chain::Ethereum, "USDT", b),
            pool(addr(0xB3), Chain::Ethereum, "DAI", c),
        ]
    };
    h.source.set_pools(Chain::Ethereum, pools(6.0, 6.0, 6.0));
    h.engine.run_discovery_once().await.unwrap();
    for pool_addr in [addr(0xB1), addr(0xB2), addr(0xB3)] {
        h.reader
            .set_balance(Chain::Ethereum, pool_addr, wallet(3), 1_000_000);
    }
    h.engine.run_position_scan_once().await.unwrap();

    // Exactly the minor threshold fires; strictly below does not; the major
    // flag flips exactly at the major threshold.
    h.source.set_pools(Chain::Ethereum, pools(5.5, 5.51, 4.0));
    h.engine.run_discovery_once().await.unwrap();
    let report = h.engine.run_position_scan_once().await.unwrap();

    assert_eq!(report.apy_events, 2);
    let sent = h.gateway.sent_to("chat-thr");
    assert_eq!(sent.len(), 2);
    let major: Vec<_> = sent.iter().filter(|m| m.text.contains("Major")).collect();
    assert_eq!(major.len(), 1);
    assert!(major[0].text.contains("DAI"));
}

#[tokio::test]
async fn s3_zero_balance_closes_position_terminally() {
    let h = build_harness().await;
    let user = seed_user_with_wallet(&h, "chat-s3", 4).await;

    h.source
        .set_pools(Chain::Arbitrum, vec![pool(addr(0xC1), Chain::Arbitrum, "USDT", 7.0)]);
    h.engine.run_discovery_once().await.unwrap();
    h.reader
        .set_balance(Chain::Arbitrum, addr(0xC1), wallet(4), 10_000_000);
    h.engine.run_position_scan_once().await.unwrap();
    assert_eq!(database::load_active_positions(&h.db).await.unwrap().len(), 1);

    // Withdrawn.
    h.reader.set_balance(Chain::Arbitrum, addr(0xC1), wallet(4), 0);
    let report = h.engine.run_position_scan_once().await.unwrap();
    assert_eq!(report.positions_closed, 1);

    let sent = h.gateway.sent_to("chat-s3");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("Position closed"));
    assert!(database::load_active_positions(&h.db).await.unwrap().is_empty());

    // Later ticks stay quiet, even if the pool's APY keeps moving.
    h.source
        .set_pools(Chain::Arbitrum, vec![pool(addr(0xC1), Chain::Arbitrum, "USDT", 2.0)]);
    h.engine.run_discovery_once().await.unwrap();
    h.engine.run_position_scan_once().await.unwrap();
    h.engine.run_position_scan_once().await.unwrap();
    assert_eq!(h.gateway.sent_to("chat-s3").len(), 1);

    let ledger = database::load_notifications_for_user(&h.db, user).await.unwrap();
    assert_eq!(
        ledger.iter().filter(|n| n.kind == "position_closed").count(),
        1
    );
}

#[tokio::test]
async fn closure_wins_over_apy_change_in_the_same_tick() {
    let h = build_harness().await;
    seed_user_with_wallet(&h, "chat-race", 5).await;

    h.source
        .set_pools(Chain::Optimism, vec![pool(addr(0xD1), Chain::Optimism, "DAI", 6.0)]);
    h.engine.run_discovery_once().await.unwrap();
    h.reader
        .set_balance(Chain::Optimism, addr(0xD1), wallet(5), 1_000_000);
    h.engine.run_position_scan_once().await.unwrap();

    // APY collapses and the balance empties before the next scan.
    h.source
        .set_pools(Chain::Optimism, vec![pool(addr(0xD1), Chain::Optimism, "DAI", 1.0)]);
    h.engine.run_discovery_once().await.unwrap();
    h.reader.set_balance(Chain::Optimism, addr(0xD1), wallet(5), 0);
    let report = h.engine.run_position_scan_once().await.unwrap();

    assert_eq!(report.positions_closed, 1);
    assert_eq!(report.apy_events, 0);
    let sent = h.gateway.sent_to("chat-race");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("Position closed"));
}

#[tokio::test]
async fn failed_balance_reads_never_close_positions() {
    let h = build_harness().await;
    seed_user_with_wallet(&h, "chat-fail", 6).await;

    h.source
        .set_pools(Chain::Sonic, vec![pool(addr(0xE1), Chain::Sonic, "USDC.e", 9.0)]);
    h.engine.run_discovery_once().await.unwrap();
    h.reader
        .set_balance(Chain::Sonic, addr(0xE1), wallet(6), 5_000_000);
    h.engine.run_position_scan_once().await.unwrap();

    h.reader.set_read_failure(Chain::Sonic, addr(0xE1), wallet(6));
    let report = h.engine.run_position_scan_once().await.unwrap();
    assert_eq!(report.positions_closed, 0);
    assert_eq!(report.reads_failed, 1);
    assert_eq!(database::load_active_positions(&h.db).await.unwrap().len(), 1);
    assert!(h.gateway.sent().is_empty());

    // Reads recover with the balance intact: still no spurious events.
    h.reader.clear_read_failure(Chain::Sonic, addr(0xE1), wallet(6));
    let report = h.engine.run_position_scan_once().await.unwrap();
    assert_eq!(report.positions_closed, 0);
    assert!(h.gateway.sent().is_empty());
}

#[tokio::test]
async fn delisted_pool_closes_the_position() {
    let h = build_harness().await;
    seed_user_with_wallet(&h, "chat-delist", 7).await;

    h.source
        .set_pools(Chain::Ethereum, vec![pool(addr(0xF1), Chain::Ethereum, "USDC", 6.0)]);
    h.engine.run_discovery_once().await.unwrap();
    h.reader
        .set_balance(Chain::Ethereum, addr(0xF1), wallet(7), 2_000_000);
    h.engine.run_position_scan_once().await.unwrap();

    // Protocol delists the pool while another chain keeps the tick non-empty.
    h.source.set_pools(Chain::Ethereum, vec![]);
    h.source
        .set_pools(Chain::Arbitrum, vec![pool(addr(0xF2), Chain::Arbitrum, "USDT", 5.0)]);
    h.engine.run_discovery_once().await.unwrap();

    let report = h.engine.run_position_scan_once().await.unwrap();
    assert_eq!(report.positions_closed, 1);
    let sent = h.gateway.sent_to("chat-delist");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("Position closed"));
}
