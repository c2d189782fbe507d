//! End-to-end worker and allocator scenarios over a scripted data feed and
//! a deterministic paper execution client.

mod common;

use std::sync::Arc;

use botfarm::engine::{DecisionKind, StrategyManager, Worker};
use botfarm::exec::Side;
use botfarm::store::TradeFilter;

use common::{
    always_long, decision_log, flat_bar, maker_exec, taker_exec, temp_store, ScriptedProvider,
};

fn resume_trading(store: &botfarm::store::Store) {
    store.set_setting("trading_paused", &false).unwrap();
}

#[tokio::test]
async fn stepping_twice_on_one_bar_trades_once() {
    let (_dir, store) = temp_store();
    resume_trading(&store);
    let provider = Arc::new(ScriptedProvider::new(vec![flat_bar(100, 50.0)]));
    let decisions = decision_log();
    let mut worker = Worker::new(
        "w",
        "BTC_USDT",
        "1m",
        always_long(),
        1000.0,
        provider,
        maker_exec("w", &store),
        store.clone(),
        decisions.clone(),
    );
    store.upsert_bot(&worker.snapshot("test")).unwrap();

    worker.step().await.unwrap();
    worker.step().await.unwrap();

    assert_eq!(worker.trades, 1, "second call on the same bar is a no-op");
    assert_eq!(worker.last_bar_ts, Some(100));

    let trades = store.list_trades(&TradeFilter::default()).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].side, "buy");
    // Limit improvement: buy placed 5 bps under the 50.0 mark.
    assert!((trades[0].price - 49.975).abs() < 1e-9);
    // Fee headroom shaves the 20-unit target only slightly.
    assert!(trades[0].qty > 19.9 && trades[0].qty <= 20.0);
    assert!(worker.pos_qty > 19.9);
    assert!(worker.cash >= 0.0);
}

#[tokio::test]
async fn cooldown_blocks_the_trade_but_marks_equity() {
    let (_dir, store) = temp_store();
    resume_trading(&store);
    // low == close so the 1-bar breakout goes short on this bar.
    let mut bar = flat_bar(200, 50.0);
    bar.high = 51.0;
    let provider = Arc::new(ScriptedProvider::new(vec![bar]));
    let decisions = decision_log();
    let mut worker = Worker::new(
        "w",
        "BTC_USDT",
        "1m",
        always_long(),
        1000.0,
        provider,
        maker_exec("w", &store),
        store.clone(),
        decisions.clone(),
    );
    store.upsert_bot(&worker.snapshot("test")).unwrap();
    worker.cash = 0.0;
    worker.pos_qty = 20.0;
    worker.last_trade_ts = Some(chrono::Utc::now().timestamp() - 60);

    worker.step().await.unwrap();

    assert_eq!(worker.trades, 0, "cooldown suppressed the order");
    assert!((worker.equity - (worker.cash + worker.pos_qty * 50.0)).abs() < 1e-9);
    let kinds: Vec<DecisionKind> = decisions.snapshot().iter().map(|d| d.kind).collect();
    assert!(kinds.contains(&DecisionKind::SkipCooldown));
    assert!(!kinds.contains(&DecisionKind::TradeExecuted));
}

#[tokio::test]
async fn buys_are_clipped_to_cash_even_after_fees() {
    let (_dir, store) = temp_store();
    resume_trading(&store);
    let provider = Arc::new(ScriptedProvider::new(vec![flat_bar(300, 50.0)]));
    let mut worker = Worker::new(
        "w",
        "BTC_USDT",
        "1m",
        always_long(),
        100.0,
        provider,
        // Worst case: every fill is a taker fill with a 0.1% fee.
        taker_exec("w", &store),
        store.clone(),
        decision_log(),
    );
    store.upsert_bot(&worker.snapshot("test")).unwrap();

    worker.step().await.unwrap();

    assert_eq!(worker.trades, 1);
    assert!(worker.pos_qty <= 2.0, "desired 2 units, clipped: {}", worker.pos_qty);
    assert!(worker.pos_qty > 1.9);
    assert!(worker.cash >= 0.0, "no leverage after fees: {}", worker.cash);
    assert!((worker.equity - (worker.cash + worker.pos_qty * 50.0)).abs() < 1e-9);
}

#[tokio::test]
async fn paused_trading_skips_orders() {
    let (_dir, store) = temp_store();
    // trading_paused defaults to true; leave it.
    let provider = Arc::new(ScriptedProvider::new(vec![flat_bar(400, 50.0)]));
    let decisions = decision_log();
    let mut worker = Worker::new(
        "w",
        "BTC_USDT",
        "1m",
        always_long(),
        1000.0,
        provider,
        maker_exec("w", &store),
        store.clone(),
        decisions.clone(),
    );
    store.upsert_bot(&worker.snapshot("test")).unwrap();

    worker.step().await.unwrap();

    assert_eq!(worker.trades, 0);
    let kinds: Vec<DecisionKind> = decisions.snapshot().iter().map(|d| d.kind).collect();
    assert!(kinds.contains(&DecisionKind::SkipTradingPaused));
}

#[tokio::test]
async fn score_stays_clamped_across_steps() {
    let (_dir, store) = temp_store();
    resume_trading(&store);
    let provider = Arc::new(ScriptedProvider::new(vec![flat_bar(0, 50.0)]));
    let mut worker = Worker::new(
        "w",
        "BTC_USDT",
        "1m",
        always_long(),
        1000.0,
        provider.clone(),
        maker_exec("w", &store),
        store.clone(),
        decision_log(),
    );
    store.upsert_bot(&worker.snapshot("test")).unwrap();

    // Ride a violent rally; per-step EMA updates must stay within bounds.
    for i in 1..=30 {
        provider.set_bars(vec![flat_bar(i * 60, 50.0 * (1.0 + i as f64))]);
        worker.last_trade_ts = None; // cooldown is not what's under test
        worker.step().await.unwrap();
        assert!(worker.score <= 0.2 && worker.score >= -0.2, "score {}", worker.score);
    }
    assert!(worker.score > 0.0);
}

#[tokio::test]
async fn persisted_trade_log_reconstructs_two_long_roundtrips() {
    let (_dir, store) = temp_store();
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let worker = Worker::new(
        "w",
        "BTC_USDT",
        "1m",
        always_long(),
        1000.0,
        provider,
        maker_exec("w", &store),
        store.clone(),
        decision_log(),
    );
    store.upsert_bot(&worker.snapshot("test")).unwrap();

    for (side, qty, price) in [
        (Side::Buy, 1.0, 100.0),
        (Side::Buy, 1.0, 110.0),
        (Side::Sell, 1.0, 130.0),
        (Side::Sell, 1.0, 120.0),
    ] {
        store
            .record_trade("w", "BTC_USDT", side, qty, price, 0.0, true)
            .unwrap();
    }

    let trips = store
        .list_roundtrips(&TradeFilter::default(), 0.0)
        .unwrap();
    assert_eq!(trips.len(), 2);
    assert!(trips.iter().all(|t| t.side == "LONG"));
    let mut pnls: Vec<f64> = trips.iter().map(|t| t.pnl).collect();
    pnls.sort_by(f64::total_cmp);
    assert!((pnls[0] - 10.0).abs() < 1e-9);
    assert!((pnls[1] - 30.0).abs() < 1e-9);
    let total: f64 = pnls.iter().sum();
    assert!((total - 40.0).abs() < 1e-9);
}

#[tokio::test]
async fn allocator_scenario_with_mixed_scores() {
    let (_dir, store) = temp_store();
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let mut workers = Vec::new();
    for (name, equity, score) in [("a", 400.0, 0.10), ("b", 300.0, -0.05), ("c", 300.0, 0.05)] {
        let mut w = Worker::new(
            name,
            "BTC_USDT",
            "1d",
            always_long(),
            1000.0,
            provider.clone(),
            maker_exec(name, &store),
            store.clone(),
            decision_log(),
        );
        w.equity = equity;
        w.score = score;
        workers.push(w);
    }
    let mut manager = StrategyManager::new("mixed", workers);
    manager.min_alloc_frac = 0.05;
    manager.max_alloc_frac = 0.70;
    manager.rebalance_within();

    let allocations: Vec<f64> = manager.workers.iter().map(|w| w.allocation).collect();
    let total: f64 = allocations.iter().sum();
    assert!((total - 1000.0).abs() < 1e-6, "Σ allocation preserved");
    // Shares ≈ {0.633, 0.05, 0.317} once the zero-score worker pins at the
    // floor and the rest renormalize.
    assert!((allocations[0] / total - 0.6333).abs() < 1e-3);
    assert!((allocations[1] / total - 0.05).abs() < 1e-9);
    assert!((allocations[2] / total - 0.3167).abs() < 1e-3);
    for w in &manager.workers {
        let share = w.allocation / total;
        assert!(share >= 0.05 - 1e-9 && share <= 0.70 + 1e-9);
        assert!((w.starting_allocation - 1000.0).abs() < f64::EPSILON);
    }
}

#[tokio::test]
async fn equity_identity_holds_through_fills() {
    let (_dir, store) = temp_store();
    resume_trading(&store);
    let provider = Arc::new(ScriptedProvider::new(vec![flat_bar(0, 40.0)]));
    let mut worker = Worker::new(
        "w",
        "BTC_USDT",
        "1m",
        always_long(),
        1000.0,
        provider.clone(),
        taker_exec("w", &store),
        store.clone(),
        decision_log(),
    );
    store.upsert_bot(&worker.snapshot("test")).unwrap();

    let mut last_price = 40.0;
    for i in 1..=5 {
        last_price = 40.0 + i as f64;
        provider.set_bars(vec![flat_bar(i * 60, last_price)]);
        worker.last_trade_ts = None;
        worker.step().await.unwrap();
        assert!(
            (worker.equity - (worker.cash + worker.pos_qty * last_price)).abs() < 1e-9,
            "equity identity broke at step {i}"
        );
    }
    assert!(worker.cash >= 0.0);
}
