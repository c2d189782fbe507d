use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use botfarm::alerts::PriceAlertMonitor;
use botfarm::config::AppConfig;
use botfarm::data::{cache::CachedProvider, gate::GateProvider, timeframe_seconds, DataProvider};
use botfarm::engine::portfolio::{build_portfolio, ensure_manual_trade_bot, initialize_presets};
use botfarm::engine::{scheduler, DecisionLog};
use botfarm::optimize::evolve::{Evolver, EvolverConfig};
use botfarm::optimize::Optimizer;
use botfarm::server::{router, AppState};
use botfarm::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(AppConfig::from_env());
    let store = Arc::new(Store::open(&config.db_path)?);
    config
        .validate_against_settings(&store)
        .context("startup configuration check")?;
    if config.auth.is_none() {
        tracing::warn!("AUTH_USERNAME/AUTH_PASSWORD_HASH not set, API is unauthenticated");
    }

    initialize_presets(&store)?;
    ensure_manual_trade_bot(&store)?;

    let gate: Arc<dyn DataProvider> = Arc::new(GateProvider::new());
    let provider: Arc<dyn DataProvider> =
        Arc::new(CachedProvider::new(gate.clone(), store.clone(), "gate"));
    let decisions = Arc::new(DecisionLog::new());

    let portfolio = build_portfolio(&store, provider.clone(), &decisions, config.binance_creds.clone())?;
    let tf_seconds = timeframe_seconds(&portfolio.timeframe)
        .with_context(|| format!("unknown trading timeframe '{}'", portfolio.timeframe))?;
    let portfolio = Arc::new(Mutex::new(portfolio));

    let shutdown = CancellationToken::new();

    if config.disable_loop {
        tracing::info!("trading loop disabled by APP_DISABLE_LOOP");
    } else {
        tokio::spawn(scheduler::run_trading_loop(
            portfolio.clone(),
            tf_seconds,
            shutdown.clone(),
        ));
    }

    if config.disable_optimizer {
        tracing::info!("optimizer disabled by APP_DISABLE_OPTIMIZER");
    } else {
        let optimizer = Optimizer::new(store.clone(), provider.clone());
        tokio::spawn(scheduler::run_optimizer_loop(
            optimizer,
            config.optimizer_interval_hours,
            shutdown.clone(),
        ));
    }

    if config.disable_evolution {
        tracing::info!("evolution disabled by APP_DISABLE_EVOLUTION");
    } else {
        let evolver = Evolver::new(store.clone(), provider.clone(), EvolverConfig::default());
        tokio::spawn(scheduler::run_evolver_loop(
            evolver,
            config.evolution_interval_hours,
            shutdown.clone(),
        ));
    }

    if config.disable_alerts {
        tracing::info!("price alerts disabled by APP_DISABLE_ALERTS");
    } else {
        let monitor = PriceAlertMonitor::new(store.clone(), gate.clone());
        tokio::spawn(monitor.run(shutdown.clone()));
    }

    let state = AppState {
        store,
        portfolio,
        provider,
        decisions,
        config: config.clone(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "botfarm listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
