//! HTTP surface: JSON API over axum.
//!
//! Every route sits behind HTTP Basic auth for the single configured user
//! (`AUTH_USERNAME` + `AUTH_PASSWORD_HASH`, SHA-256 hex). Handlers only
//! read derived views and mutate settings; the trading loop owns the
//! portfolio between requests.

pub mod routes;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::config::AppConfig;
use crate::data::DataProvider;
use crate::engine::{DecisionLog, Portfolio};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub portfolio: Arc<Mutex<Portfolio>>,
    pub provider: Arc<dyn DataProvider>,
    pub decisions: Arc<DecisionLog>,
    pub config: Arc<AppConfig>,
}

/// API error envelope; every failure renders `{"error": …}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::BadRequest(report.to_string())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/portfolio.json", get(routes::portfolio))
        .route("/trades.json", get(routes::trades))
        .route("/roundtrips.json", get(routes::roundtrips))
        .route("/positions.json", get(routes::positions))
        .route("/prices.json", get(routes::prices))
        .route("/fees.json", get(routes::fees))
        .route("/decisions.json", get(routes::decisions))
        .route("/api/recent-trades", get(routes::recent_trades))
        .route("/api/worker/strategy", post(routes::set_worker_strategy))
        .route("/api/available-strategies", get(routes::available_strategies))
        .route(
            "/api/auto-rebalance",
            get(routes::get_auto_rebalance).post(routes::set_auto_rebalance),
        )
        .route("/api/pause-trading", post(routes::pause_trading))
        .route("/api/resume-trading", post(routes::resume_trading))
        .route("/api/trading-status", get(routes::trading_status))
        .route(
            "/api/set-capital-limit",
            post(routes::set_capital_limit).delete(routes::clear_capital_limit),
        )
        .route("/api/set-timeframe", post(routes::set_timeframe))
        .route("/api/set-num-strategies", post(routes::set_num_strategies))
        .route("/api/set-execution-mode", post(routes::set_execution_mode))
        .route("/api/liquidate-all", post(routes::liquidate_all))
        .route("/api/reset-for-testing", post(routes::reset_for_testing))
        .route("/api/manual-trade", post(routes::manual_trade))
        .route("/backtest", post(routes::run_backtest))
        .route("/backtest/strategies", get(routes::backtest_strategies))
        .route(
            "/backtest/saved",
            get(routes::list_saved_backtests).post(routes::save_backtest),
        )
        .route("/backtest/saved/{id}", delete(routes::delete_saved_backtest))
        .route("/optimizer/results", get(routes::optimizer_results))
        .route("/optimizer/promote/{id}", post(routes::promote_optimizer_result))
        .route("/evolution/results", get(routes::evolution_results))
        .route("/evolution/promote/{id}", post(routes::promote_evolved_strategy))
        .route("/data/coverage", get(routes::data_coverage))
        .route("/data/backfill", post(routes::data_backfill))
        .route(
            "/api/price-alerts",
            get(routes::list_price_alerts).post(routes::create_price_alert),
        )
        .route("/api/price-alerts/{id}", delete(routes::delete_price_alert))
        .route("/api/price-alerts/{id}/cancel", post(routes::cancel_price_alert))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP Basic auth for the single configured user. With no auth configured
/// the API is open (development mode; logged at startup).
async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth) = &state.config.auth else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|creds| {
            let (user, password) = creds.split_once(':')?;
            Some(verify_credentials(auth, user, password))
        })
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"botfarm\"")],
            Json(serde_json::json!({ "error": "authentication required" })),
        )
            .into_response()
    }
}

fn verify_credentials(auth: &crate::config::AuthConfig, user: &str, password: &str) -> bool {
    let digest = hex::encode(Sha256::digest(password.as_bytes()));
    // Compare both fields unconditionally to keep timing uniform.
    let user_ok = constant_time_eq(user.as_bytes(), auth.username.as_bytes());
    let pass_ok = constant_time_eq(digest.as_bytes(), auth.password_hash.as_bytes());
    user_ok && pass_ok
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    fn auth() -> AuthConfig {
        // sha256("hunter2")
        AuthConfig {
            username: "ops".to_string(),
            password_hash: hex::encode(Sha256::digest(b"hunter2")),
        }
    }

    #[test]
    fn correct_credentials_pass() {
        assert!(verify_credentials(&auth(), "ops", "hunter2"));
    }

    #[test]
    fn wrong_password_or_user_fails() {
        assert!(!verify_credentials(&auth(), "ops", "hunter3"));
        assert!(!verify_credentials(&auth(), "root", "hunter2"));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
