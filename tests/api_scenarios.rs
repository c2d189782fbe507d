//! API-level scenarios driven through the route handlers directly.

mod common;

use axum::extract::{Path, State};
use axum::Json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use botfarm::backtest::BacktestMetrics;
use botfarm::config::AppConfig;
use botfarm::engine::portfolio::build_portfolio;
use botfarm::engine::DecisionLog;
use botfarm::server::{routes, AppState};
use botfarm::strategy::genome::seed_genomes;

use common::{temp_store, ScriptedProvider};

fn test_config() -> Arc<AppConfig> {
    Arc::new(AppConfig {
        db_path: PathBuf::from("unused.db"),
        bind_addr: "127.0.0.1:0".to_string(),
        disable_loop: true,
        disable_optimizer: true,
        disable_evolution: true,
        disable_alerts: true,
        optimizer_interval_hours: 24,
        evolution_interval_hours: 24,
        binance_creds: None,
        auth: None,
    })
}

fn make_state(store: Arc<botfarm::store::Store>) -> AppState {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let decisions = Arc::new(DecisionLog::new());
    let portfolio = build_portfolio(&store, provider.clone(), &decisions, None).unwrap();
    AppState {
        store,
        portfolio: Arc::new(Mutex::new(portfolio)),
        provider,
        decisions,
        config: test_config(),
    }
}

#[tokio::test]
async fn promoting_an_evolved_strategy_saves_a_named_config() {
    let (_dir, store) = temp_store();
    let genome = seed_genomes()[0].to_value();
    let metrics = BacktestMetrics {
        total_trades: 12,
        total_return: 34.5,
        sharpe_ratio: 1.8,
        max_drawdown: 6.0,
        ..BacktestMetrics::default()
    };
    let id = store
        .save_evolved_strategy(&genome, "BTC_USDT", "1d", 123.4, &metrics, 4, 365)
        .unwrap();

    let state = make_state(store.clone());
    let Json(body) = routes::promote_evolved_strategy(State(state), Path(id))
        .await
        .unwrap();

    assert_eq!(body["name"], "Evolved Gen4 • BTC • 1d [Score 123]");
    let saved_id = body["id"].as_i64().unwrap();
    let saved = store.get_saved_backtest(saved_id).unwrap().unwrap();
    assert_eq!(saved.strategy, "GenomeStrategy");
    assert_eq!(saved.params["genome"], genome);
    assert_eq!(saved.symbol, "BTC_USDT");
}

#[tokio::test]
async fn promoting_a_missing_strategy_is_404() {
    let (_dir, store) = temp_store();
    let state = make_state(store);
    let err = routes::promote_evolved_strategy(State(state), Path(999))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn reset_requires_paused_trading() {
    let (_dir, store) = temp_store();
    let state = make_state(store.clone());

    // Resume trading, then reset must be refused.
    store.set_setting("trading_paused", &false).unwrap();
    let err = routes::reset_for_testing(State(state.clone()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("paused"));

    // Pause and retry: the reset clears trades and rebaselines workers.
    store.set_setting("trading_paused", &true).unwrap();
    let Json(body) = routes::reset_for_testing(State(state.clone())).await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["bots_reset"].as_u64().unwrap(), 27);

    let portfolio = state.portfolio.lock().await;
    for manager in &portfolio.managers {
        for w in &manager.workers {
            assert!((w.cash - w.starting_allocation).abs() < 1e-9);
            assert!((w.pos_qty - 0.0).abs() < f64::EPSILON);
            assert_eq!(w.trades, 0);
        }
    }
}

#[tokio::test]
async fn worker_strategy_reassignment_maps_param_index() {
    let (_dir, store) = temp_store();
    let state = make_state(store.clone());

    let Json(body) = routes::set_worker_strategy(
        State(state.clone()),
        Json(routes::WorkerStrategyRequest {
            worker: "mr_btc_usdt_1d_p2".to_string(),
            strategy: "TrendFollow".to_string(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["new_strategy"], "TrendFollow");

    let portfolio = state.portfolio.lock().await;
    let worker = portfolio.find_worker("mr_btc_usdt_1d_p2").unwrap();
    assert_eq!(worker.strategy.kind(), "TrendFollow");
    // Grid entry p2 → {fast: 20, slow: 100}.
    assert_eq!(worker.strategy.params()["fast"], 20);
    assert_eq!(worker.strategy.params()["slow"], 100);
}

#[tokio::test]
async fn reassigning_unknown_worker_is_404() {
    let (_dir, store) = temp_store();
    let state = make_state(store);
    let err = routes::set_worker_strategy(
        State(state),
        Json(routes::WorkerStrategyRequest {
            worker: "ghost".to_string(),
            strategy: "Breakout".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn trading_status_reports_defaults() {
    let (_dir, store) = temp_store();
    let state = make_state(store);
    let Json(body) = routes::trading_status(State(state)).await.unwrap();
    assert_eq!(body["trading_paused"], true, "paused by default for safety");
    assert_eq!(body["trading_timeframe"], "1d");
    assert_eq!(body["num_active_strategies"], 5);
    assert_eq!(body["execution_mode"], "paper");
}

#[tokio::test]
async fn execution_mode_switch_requires_credentials() {
    let (_dir, store) = temp_store();
    let state = make_state(store.clone());
    let err = routes::set_execution_mode(
        State(state.clone()),
        Json(routes::ExecutionModeRequest {
            execution_mode: "binance_testnet".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("BINANCE_TESTNET"));

    let Json(body) = routes::set_execution_mode(
        State(state),
        Json(routes::ExecutionModeRequest {
            execution_mode: "paper".to_string(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(body["execution_mode"], "paper");
    assert_eq!(
        store.get_setting_or("execution_mode", String::new()).unwrap(),
        "paper"
    );
}
