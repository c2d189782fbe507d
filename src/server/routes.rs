//! JSON route handlers.

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{ApiError, AppState};
use crate::backtest::Backtester;
use crate::data::{coingecko::CoinGeckoProvider, known_timeframes, DataProvider};
use crate::engine::portfolio::{param_index_from_name, MANUAL_TRADE_BOT, SYMBOLS};
use crate::exec::{
    BinanceTestnetExec, ExecutionClient, ExecutionMode, PaperExec, Side,
    DEFAULT_LIMIT_TIMEOUT_SECS,
};
use crate::store::TradeFilter;
use crate::strategy::{Family, Strategy};

type ApiResult = Result<Json<Value>, ApiError>;

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

// ── Read views ───────────────────────────────────────────────────────────

pub async fn portfolio(State(state): State<AppState>) -> ApiResult {
    let snapshot = state.portfolio.lock().await.snapshot()?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct TradeQuery {
    pub limit: Option<usize>,
    pub since_id: Option<i64>,
    pub bot: Option<String>,
    pub symbol: Option<String>,
    pub manager: Option<String>,
    pub fee_bps: Option<f64>,
}

impl TradeQuery {
    fn filter(&self, default_limit: usize) -> TradeFilter {
        TradeFilter {
            limit: Some(self.limit.unwrap_or(default_limit)),
            since_id: self.since_id,
            bot: self.bot.clone(),
            symbol: self.symbol.clone(),
            manager: self.manager.clone(),
        }
    }
}

pub async fn trades(State(state): State<AppState>, Query(q): Query<TradeQuery>) -> ApiResult {
    let items = state.store.list_trades(&q.filter(50))?;
    Ok(Json(json!({ "items": items })))
}

pub async fn roundtrips(State(state): State<AppState>, Query(q): Query<TradeQuery>) -> ApiResult {
    let items = state
        .store
        .list_roundtrips(&q.filter(50), q.fee_bps.unwrap_or(0.0))?;
    Ok(Json(json!({ "items": items })))
}

pub async fn positions(State(state): State<AppState>, Query(q): Query<TradeQuery>) -> ApiResult {
    let items = state.store.list_open_positions(&q.filter(usize::MAX >> 1), None)?;
    Ok(Json(json!({ "items": items })))
}

pub async fn prices(State(state): State<AppState>) -> ApiResult {
    let symbols = state.portfolio.lock().await.symbols();
    let mut items = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        match state.provider.last_price(&symbol).await {
            Ok(Some((ts, price))) => items.push(json!({
                "symbol": symbol, "ts": ts, "price": price
            })),
            _ => items.push(json!({
                "symbol": symbol, "ts": Value::Null, "price": Value::Null
            })),
        }
    }
    Ok(Json(json!({ "items": items })))
}

pub async fn fees(State(state): State<AppState>) -> ApiResult {
    let stats = state.store.fee_statistics()?;
    Ok(Json(serde_json::to_value(stats).context("encoding fee stats")?))
}

pub async fn decisions(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({ "items": state.decisions.snapshot() })))
}

pub async fn recent_trades(State(state): State<AppState>) -> ApiResult {
    let trades = state.store.list_trades(&TradeFilter {
        limit: Some(50),
        ..TradeFilter::default()
    })?;
    let items: Vec<Value> = trades
        .iter()
        .map(|t| {
            json!({
                "timestamp": t.ts,
                "symbol": t.symbol,
                "side": t.side,
                "qty": t.qty,
                "price": t.price,
                "fee": t.fee,
                "is_maker": t.is_maker,
            })
        })
        .collect();
    Ok(Json(json!({ "items": items })))
}

// ── Worker strategy management ───────────────────────────────────────────

#[derive(Debug, Deserialize, Validate)]
pub struct WorkerStrategyRequest {
    #[garde(length(min = 1))]
    pub worker: String,
    #[garde(length(min = 1))]
    pub strategy: String,
}

pub async fn set_worker_strategy(
    State(state): State<AppState>,
    Json(req): Json<WorkerStrategyRequest>,
) -> ApiResult {
    req.validate()?;

    let mut portfolio = state.portfolio.lock().await;
    if portfolio.find_worker(&req.worker).is_none() {
        return Err(ApiError::NotFound(format!("worker {} not found", req.worker)));
    }

    let (strategy, label) = resolve_strategy_spec(&state, &req.worker, &req.strategy)?;
    portfolio.set_worker_strategy(&req.worker, strategy, &label)?;
    Ok(Json(json!({
        "success": true,
        "worker": req.worker,
        "new_strategy": label,
    })))
}

/// `MeanReversion|Breakout|TrendFollow`, `saved:<id>`, or `evolved:<id>`
/// → a fresh strategy instance plus its persisted label.
fn resolve_strategy_spec(
    state: &AppState,
    worker_name: &str,
    spec: &str,
) -> Result<(Strategy, String), ApiError> {
    if let Some((prefix, id_str)) = spec.split_once(':') {
        let id: i64 = id_str
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid strategy id '{id_str}'")))?;
        return match prefix {
            "saved" => {
                let row = state
                    .store
                    .get_saved_backtest(id)?
                    .ok_or_else(|| ApiError::NotFound(format!("saved strategy {id} not found")))?;
                let strategy = Strategy::from_params(&row.strategy, &row.params)
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                Ok((strategy, format!("SavedStrategy({id})")))
            }
            "evolved" => {
                let row = state
                    .store
                    .get_evolved_strategy(id)?
                    .ok_or_else(|| ApiError::NotFound(format!("evolved strategy {id} not found")))?;
                let strategy = Strategy::from_params("GenomeStrategy", &row.genome)
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                Ok((strategy, format!("EvolvedStrategy({id})")))
            }
            other => Err(ApiError::BadRequest(format!("unknown strategy prefix '{other}'"))),
        };
    }

    let family = Family::parse(spec)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown strategy '{spec}'")))?;
    let grid = family.grid();
    let idx = param_index_from_name(worker_name).min(grid.len() - 1);
    let strategy = Strategy::from_params(family.as_str(), &grid[idx])
        .map_err(ApiError::Internal)?;
    Ok((strategy, family.as_str().to_string()))
}

pub async fn available_strategies(State(state): State<AppState>) -> ApiResult {
    let mut strategies = vec![
        json!({"id": "MeanReversion", "name": "Mean Reversion", "type": "hardcoded"}),
        json!({"id": "Breakout", "name": "Breakout", "type": "hardcoded"}),
        json!({"id": "TrendFollow", "name": "Trend Follow", "type": "hardcoded"}),
    ];
    for s in state.store.list_saved_backtests()? {
        strategies.push(json!({
            "id": format!("saved:{}", s.id),
            "name": s.name,
            "type": "saved",
        }));
    }
    for e in state.store.list_evolved_strategies(None, Some(0.0), 20)? {
        strategies.push(json!({
            "id": format!("evolved:{}", e.id),
            "name": format!("G{} {} (score: {:.1})", e.generation, e.symbol, e.score),
            "type": "evolved",
        }));
    }
    Ok(Json(json!({ "strategies": strategies })))
}

// ── Settings toggles ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AutoRebalanceRequest {
    #[serde(default)]
    pub enabled: bool,
}

pub async fn get_auto_rebalance(State(state): State<AppState>) -> ApiResult {
    let enabled: bool = state.store.get_setting_or("auto_rebalance_enabled", false)?;
    Ok(Json(json!({ "enabled": enabled })))
}

pub async fn set_auto_rebalance(
    State(state): State<AppState>,
    Json(req): Json<AutoRebalanceRequest>,
) -> ApiResult {
    state.store.set_setting("auto_rebalance_enabled", &req.enabled)?;
    Ok(Json(json!({
        "enabled": req.enabled,
        "message": format!("Auto-rebalance {}", if req.enabled { "enabled" } else { "disabled" }),
    })))
}

pub async fn pause_trading(State(state): State<AppState>) -> ApiResult {
    state.store.set_setting("trading_paused", &true)?;
    tracing::info!("trading paused");
    Ok(Json(json!({
        "success": true,
        "trading_paused": true,
        "message": "Trading paused. No new trades will be executed.",
    })))
}

pub async fn resume_trading(State(state): State<AppState>) -> ApiResult {
    state.store.set_setting("trading_paused", &false)?;
    tracing::info!("trading resumed");
    Ok(Json(json!({
        "success": true,
        "trading_paused": false,
        "message": "Trading resumed.",
    })))
}

pub async fn trading_status(State(state): State<AppState>) -> ApiResult {
    let store = &state.store;
    Ok(Json(json!({
        "trading_paused": store.get_setting_or("trading_paused", true)?,
        "capital_limit_usdt": store.get_setting::<f64>("capital_limit_usdt")?,
        "trading_timeframe": store.get_setting_or("trading_timeframe", "1d".to_string())?,
        "num_active_strategies": store.get_setting_or("num_active_strategies", 5_usize)?,
        "execution_mode": store.get_setting_or("execution_mode", "paper".to_string())?,
    })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CapitalLimitRequest {
    #[garde(range(min = 0.01))]
    pub capital_limit_usdt: f64,
}

pub async fn set_capital_limit(
    State(state): State<AppState>,
    Json(req): Json<CapitalLimitRequest>,
) -> ApiResult {
    req.validate()?;
    state
        .store
        .set_setting("capital_limit_usdt", &req.capital_limit_usdt)?;
    Ok(Json(json!({
        "success": true,
        "capital_limit_usdt": req.capital_limit_usdt,
        "message": format!(
            "Capital limit set to ${:.2} USDT. Restart required to apply.",
            req.capital_limit_usdt
        ),
    })))
}

pub async fn clear_capital_limit(State(state): State<AppState>) -> ApiResult {
    state.store.delete_setting("capital_limit_usdt")?;
    Ok(Json(json!({
        "success": true,
        "capital_limit_usdt": Value::Null,
        "message": "Capital limit removed. Restart required to apply.",
    })))
}

#[derive(Debug, Deserialize)]
pub struct TimeframeRequest {
    pub timeframe: String,
}

pub async fn set_timeframe(
    State(state): State<AppState>,
    Json(req): Json<TimeframeRequest>,
) -> ApiResult {
    if !known_timeframes().contains(&req.timeframe.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "timeframe must be one of: {}",
            known_timeframes().join(", ")
        )));
    }
    state.store.set_setting("trading_timeframe", &req.timeframe)?;
    Ok(Json(json!({
        "success": true,
        "timeframe": req.timeframe,
        "message": format!(
            "Timeframe set to {}. Restart required; make sure strategies were optimized on it.",
            req.timeframe
        ),
    })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct NumStrategiesRequest {
    #[garde(range(min = 1, max = 20))]
    pub num_strategies: usize,
}

pub async fn set_num_strategies(
    State(state): State<AppState>,
    Json(req): Json<NumStrategiesRequest>,
) -> ApiResult {
    req.validate()?;
    state
        .store
        .set_setting("num_active_strategies", &req.num_strategies)?;
    Ok(Json(json!({
        "success": true,
        "num_strategies": req.num_strategies,
        "message": format!(
            "Portfolio will run the top {} evolved strategies. Restart required to apply.",
            req.num_strategies
        ),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExecutionModeRequest {
    pub execution_mode: String,
}

pub async fn set_execution_mode(
    State(state): State<AppState>,
    Json(req): Json<ExecutionModeRequest>,
) -> ApiResult {
    let Some(mode) = ExecutionMode::parse(&req.execution_mode) else {
        return Err(ApiError::BadRequest(
            "execution_mode must be one of: paper, binance_testnet".to_string(),
        ));
    };
    if mode == ExecutionMode::BinanceTestnet && state.config.binance_creds.is_none() {
        return Err(ApiError::BadRequest(
            "binance_testnet requires BINANCE_TESTNET_API_KEY/SECRET".to_string(),
        ));
    }
    state.store.set_setting("execution_mode", &mode.as_str())?;
    Ok(Json(json!({
        "success": true,
        "execution_mode": mode.as_str(),
        "message": format!("Execution mode set to {}. Restart required to apply.", mode.as_str()),
    })))
}

// ── Emergency operations ─────────────────────────────────────────────────

pub async fn liquidate_all(State(state): State<AppState>) -> ApiResult {
    let mut portfolio = state.portfolio.lock().await;
    let closed = portfolio.liquidate_all().await?;
    let total_value: f64 = closed.iter().map(|p| p.value).sum();
    tracing::warn!(positions = closed.len(), total_value, "emergency liquidation complete");
    Ok(Json(json!({
        "success": true,
        "message": format!("Liquidated {} positions. Trading paused.", closed.len()),
        "positions_closed": closed.len(),
        "total_value": total_value,
        "liquidated_positions": closed,
        "trading_paused": true,
    })))
}

pub async fn reset_for_testing(State(state): State<AppState>) -> ApiResult {
    if !state.store.get_setting_or("trading_paused", true)? {
        return Err(ApiError::BadRequest(
            "Trading must be paused before reset. Pause trading or liquidate first.".to_string(),
        ));
    }
    let mut portfolio = state.portfolio.lock().await;
    let (bots_reset, capital_per_bot) = portfolio.reset_for_testing()?;
    Ok(Json(json!({
        "success": true,
        "message": "All trading state has been reset",
        "trades_cleared": true,
        "bots_reset": bots_reset,
        "capital_per_bot": capital_per_bot,
        "total_equity": capital_per_bot * bots_reset as f64,
    })))
}

// ── Manual trading ───────────────────────────────────────────────────────

const MANUAL_TRADE_SYMBOLS: &[&str] = &["BTC_USDT", "ETH_USDT", "SOL_USDT", "USDC_USDT"];

fn default_order_type() -> String {
    "market".to_string()
}

#[derive(Debug, Deserialize, Validate)]
pub struct ManualTradeRequest {
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(length(min = 1))]
    pub side: String,
    #[garde(range(min = 1e-9))]
    pub quantity: f64,
    #[serde(default = "default_order_type")]
    #[garde(skip)]
    pub order_type: String,
    #[garde(inner(range(min = 1e-9)))]
    pub limit_price: Option<f64>,
}

pub async fn manual_trade(
    State(state): State<AppState>,
    Json(req): Json<ManualTradeRequest>,
) -> ApiResult {
    req.validate()?;
    if !MANUAL_TRADE_SYMBOLS.contains(&req.symbol.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "invalid symbol, must be one of: {}",
            MANUAL_TRADE_SYMBOLS.join(", ")
        )));
    }
    let side = Side::parse(&req.side)
        .ok_or_else(|| ApiError::BadRequest("side must be 'buy' or 'sell'".to_string()))?;

    let mode = state.portfolio.lock().await.execution_mode;
    let client: Arc<dyn ExecutionClient> = match mode {
        ExecutionMode::Paper => Arc::new(PaperExec::new(MANUAL_TRADE_BOT, state.store.clone())),
        ExecutionMode::BinanceTestnet => {
            let (key, secret) = state.config.binance_creds.clone().ok_or_else(|| {
                ApiError::BadRequest("binance testnet credentials not configured".to_string())
            })?;
            Arc::new(BinanceTestnetExec::new(
                MANUAL_TRADE_BOT,
                state.store.clone(),
                key,
                secret,
            ))
        }
    };

    let fill = match req.order_type.as_str() {
        "market" => {
            let (_, price) = state
                .provider
                .last_price(&req.symbol)
                .await?
                .ok_or_else(|| ApiError::BadRequest(format!("no market price for {}", req.symbol)))?;
            client
                .market_order(&req.symbol, side, req.quantity, price)
                .await?
        }
        "limit" => {
            let limit_price = req.limit_price.ok_or_else(|| {
                ApiError::BadRequest("limit_price required for limit orders".to_string())
            })?;
            client
                .limit_order(
                    &req.symbol,
                    side,
                    req.quantity,
                    limit_price,
                    DEFAULT_LIMIT_TIMEOUT_SECS,
                )
                .await?
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "invalid order_type '{other}', must be 'market' or 'limit'"
            )));
        }
    };

    Ok(Json(json!({
        "success": true,
        "trade": fill,
        "message": format!("Executed {} {} {}", side, req.quantity, req.symbol),
    })))
}

// ── Backtesting ──────────────────────────────────────────────────────────

fn default_symbol() -> String {
    "BTC_USDT".to_string()
}

fn default_timeframe() -> String {
    "1d".to_string()
}

fn default_days() -> i64 {
    30
}

fn default_capital() -> f64 {
    1000.0
}

fn default_min_notional() -> f64 {
    100.0
}

#[derive(Debug, Deserialize, Validate)]
pub struct BacktestRequest {
    #[garde(length(min = 1))]
    pub strategy: String,
    #[serde(default)]
    #[garde(skip)]
    pub params: Value,
    #[serde(default = "default_symbol")]
    #[garde(length(min = 1))]
    pub symbol: String,
    #[serde(default = "default_timeframe")]
    #[garde(skip)]
    pub timeframe: String,
    #[serde(default = "default_days")]
    #[garde(range(min = 1, max = 3650))]
    pub days: i64,
    #[serde(default = "default_capital")]
    #[garde(range(min = 0.01))]
    pub initial_capital: f64,
    #[serde(default = "default_min_notional")]
    #[garde(range(min = 0.0))]
    pub min_notional: f64,
}

pub async fn run_backtest(
    State(state): State<AppState>,
    Json(req): Json<BacktestRequest>,
) -> ApiResult {
    req.validate()?;
    if known_timeframes().iter().all(|tf| *tf != req.timeframe) {
        return Err(ApiError::BadRequest(format!("unknown timeframe '{}'", req.timeframe)));
    }
    let mut strategy = Strategy::from_params(&req.strategy, &req.params)
        .map_err(|e| ApiError::BadRequest(format!("invalid parameters: {e}")))?;

    let end_ts = chrono::Utc::now().timestamp();
    let start_ts = end_ts - req.days * 86_400;
    let backtester = Backtester::new(req.initial_capital, req.min_notional);
    let run = backtester
        .run(
            &mut strategy,
            state.provider.as_ref(),
            &req.symbol,
            &req.timeframe,
            Some(start_ts),
            Some(end_ts),
        )
        .await
        .context("backtest failed")?;

    Ok(Json(json!({
        "metrics": run.metrics,
        "equity_curve": run.equity_curve,
        "trades": run.trades,
        "config": {
            "strategy": req.strategy,
            "params": req.params,
            "symbol": req.symbol,
            "timeframe": req.timeframe,
            "days": req.days,
            "initial_capital": req.initial_capital,
        },
    })))
}

pub async fn backtest_strategies() -> Json<Value> {
    Json(json!({
        "strategies": [
            {
                "name": "MeanReversion",
                "params": Family::MeanReversion.grid(),
                "description": "Mean reversion against a moving-average band",
            },
            {
                "name": "Breakout",
                "params": Family::Breakout.grid(),
                "description": "Breakout on rolling highs/lows",
            },
            {
                "name": "TrendFollow",
                "params": Family::TrendFollow.grid(),
                "description": "Dual moving-average trend following",
            },
        ],
        "symbols": SYMBOLS,
        "timeframes": known_timeframes(),
    }))
}

fn default_preset_days() -> i64 {
    365
}

#[derive(Debug, Deserialize, Validate)]
pub struct SaveBacktestRequest {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub strategy: String,
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(length(min = 1))]
    pub timeframe: String,
    #[serde(default)]
    #[garde(skip)]
    pub params: Value,
    #[serde(default = "default_capital")]
    #[garde(range(min = 0.01))]
    pub initial_capital: f64,
    #[serde(default = "default_min_notional")]
    #[garde(range(min = 0.0))]
    pub min_notional: f64,
    #[serde(default = "default_preset_days")]
    #[garde(range(min = 1))]
    pub days: i64,
}

pub async fn list_saved_backtests(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({ "saved": state.store.list_saved_backtests()? })))
}

pub async fn save_backtest(
    State(state): State<AppState>,
    Json(req): Json<SaveBacktestRequest>,
) -> ApiResult {
    req.validate()?;
    // Reject configs no strategy constructor would accept later.
    Strategy::from_params(&req.strategy, &req.params)
        .map_err(|e| ApiError::BadRequest(format!("invalid configuration: {e}")))?;
    let id = state.store.save_backtest(
        &req.name,
        &req.strategy,
        &req.symbol,
        &req.timeframe,
        &req.params,
        req.initial_capital,
        req.min_notional,
        req.days,
    )?;
    Ok(Json(json!({ "id": id, "name": req.name })))
}

pub async fn delete_saved_backtest(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult {
    if state.store.delete_saved_backtest(id)? {
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(ApiError::NotFound(format!("saved backtest {id} not found")))
    }
}

// ── Optimizer / evolution results ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub strategy: Option<String>,
    pub symbol: Option<String>,
    pub min_score: Option<f64>,
    pub limit: Option<usize>,
}

pub async fn optimizer_results(
    State(state): State<AppState>,
    Query(q): Query<ResultsQuery>,
) -> ApiResult {
    let results = state.store.list_optimization_results(
        q.strategy.as_deref(),
        q.symbol.as_deref(),
        q.limit.unwrap_or(100),
    )?;
    Ok(Json(json!({ "results": results })))
}

pub async fn promote_optimizer_result(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult {
    let row = state
        .store
        .get_optimization_result(id)?
        .ok_or_else(|| ApiError::NotFound(format!("optimization result {id} not found")))?;
    let name = format!(
        "{} • {} • {} [Opt {:.0}]",
        row.strategy,
        row.symbol.replace("_USDT", ""),
        row.timeframe,
        row.score
    );
    let saved_id = state.store.save_backtest(
        &name,
        &row.strategy,
        &row.symbol,
        &row.timeframe,
        &row.params,
        1000.0,
        100.0,
        row.days,
    )?;
    Ok(Json(json!({ "id": saved_id, "name": name })))
}

pub async fn evolution_results(
    State(state): State<AppState>,
    Query(q): Query<ResultsQuery>,
) -> ApiResult {
    let results = state.store.list_evolved_strategies(
        q.symbol.as_deref(),
        q.min_score,
        q.limit.unwrap_or(100),
    )?;
    Ok(Json(json!({ "results": results })))
}

pub async fn promote_evolved_strategy(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult {
    let row = state
        .store
        .get_evolved_strategy(id)?
        .ok_or_else(|| ApiError::NotFound(format!("evolved strategy {id} not found")))?;
    let name = format!(
        "Evolved Gen{} • {} • {} [Score {:.0}]",
        row.generation,
        row.symbol.replace("_USDT", ""),
        row.timeframe,
        row.score
    );
    let saved_id = state.store.save_backtest(
        &name,
        "GenomeStrategy",
        &row.symbol,
        &row.timeframe,
        &json!({ "genome": row.genome }),
        1000.0,
        100.0,
        row.days,
    )?;
    Ok(Json(json!({ "id": saved_id, "name": name })))
}

// ── Bar cache management ─────────────────────────────────────────────────

pub async fn data_coverage(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({ "items": state.store.coverage_summary()? })))
}

fn default_provider() -> String {
    "gate".to_string()
}

fn default_backfill_bars() -> usize {
    1000
}

#[derive(Debug, Deserialize, Validate)]
pub struct BackfillRequest {
    #[garde(length(min = 1))]
    pub symbols: Vec<String>,
    #[serde(default = "default_provider")]
    #[garde(skip)]
    pub provider: String,
    #[serde(default = "default_timeframe")]
    #[garde(skip)]
    pub timeframe: String,
    #[serde(default = "default_backfill_bars")]
    #[garde(range(min = 1, max = 5000))]
    pub bars: usize,
}

pub async fn data_backfill(
    State(state): State<AppState>,
    Json(req): Json<BackfillRequest>,
) -> ApiResult {
    req.validate()?;
    let mut results = serde_json::Map::new();
    match req.provider.as_str() {
        "gate" => {
            for symbol in &req.symbols {
                let outcome = state
                    .provider
                    .history(symbol, &req.timeframe, req.bars)
                    .await;
                results.insert(
                    symbol.clone(),
                    json!(match outcome {
                        Ok(bars) => format!("cached {} bars", bars.len()),
                        Err(e) => format!("error: {e}"),
                    }),
                );
            }
        }
        "coingecko" => {
            let gecko = CoinGeckoProvider::new();
            for symbol in &req.symbols {
                let outcome = gecko.history(symbol, "1d", req.bars).await;
                let message = match outcome {
                    Ok(bars) if bars.is_empty() => "no data returned".to_string(),
                    Ok(bars) => {
                        state.store.store_bars(symbol, "1d", &bars, "coingecko")?;
                        format!("cached {} daily bars", bars.len())
                    }
                    Err(e) => format!("error: {e}"),
                };
                results.insert(symbol.clone(), json!(message));
            }
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown provider '{other}', use 'gate' or 'coingecko'"
            )));
        }
    }
    Ok(Json(json!({ "results": results })))
}

// ── Price alerts ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub status: Option<String>,
}

pub async fn list_price_alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> ApiResult {
    let alerts = state.store.list_price_alerts(q.status.as_deref())?;
    Ok(Json(json!({
        "success": true,
        "count": alerts.len(),
        "alerts": alerts,
    })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAlertRequest {
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(range(min = 1e-9))]
    pub target_price: f64,
    #[garde(length(min = 1))]
    pub condition: String,
    #[garde(length(min = 3))]
    pub email: String,
}

pub async fn create_price_alert(
    State(state): State<AppState>,
    Json(req): Json<CreateAlertRequest>,
) -> ApiResult {
    req.validate()?;
    if req.condition != "above" && req.condition != "below" {
        return Err(ApiError::BadRequest(
            "condition must be 'above' or 'below'".to_string(),
        ));
    }
    if !req.email.contains('@') || !req.email.contains('.') {
        return Err(ApiError::BadRequest("invalid email address".to_string()));
    }
    let id = state
        .store
        .create_price_alert(&req.symbol, req.target_price, &req.condition, &req.email)?;
    Ok(Json(json!({
        "success": true,
        "alert_id": id,
        "message": format!("Price alert created: {} {} {}", req.symbol, req.condition, req.target_price),
    })))
}

pub async fn delete_price_alert(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if state.store.delete_price_alert(id)? {
        Ok(Json(json!({ "success": true, "message": format!("Alert {id} deleted") })))
    } else {
        Err(ApiError::NotFound(format!("alert {id} not found")))
    }
}

pub async fn cancel_price_alert(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if state.store.update_alert_status(id, "cancelled")? {
        Ok(Json(json!({ "success": true, "message": format!("Alert {id} cancelled") })))
    } else {
        Err(ApiError::NotFound(format!("alert {id} not found")))
    }
}
