//! Environment configuration.
//!
//! | Env Var | Default | Purpose |
//! |---------|---------|---------|
//! | `BOT_DB` | `trading.db` | SQLite database path |
//! | `BIND_ADDR` | `0.0.0.0:8000` | HTTP listen address |
//! | `APP_DISABLE_LOOP` | (unset) | Skip the trading scheduler |
//! | `APP_DISABLE_OPTIMIZER` | (unset) | Skip the grid optimizer loop |
//! | `APP_DISABLE_EVOLUTION` | (unset) | Skip the genetic evolver loop |
//! | `APP_DISABLE_ALERTS` | (unset) | Skip the price-alert monitor |
//! | `OPTIMIZER_INTERVAL_HOURS` | `24` | Optimizer cycle cadence |
//! | `EVOLUTION_INTERVAL_HOURS` | `24` | Evolver cycle cadence |
//! | `BINANCE_TESTNET_API_KEY` / `_SECRET` | (none) | Testnet credentials |
//! | `AUTH_USERNAME` | (none) | API user |
//! | `AUTH_PASSWORD_HASH` | (none) | SHA-256 hex of the API password |
//! | `SECRET_KEY` | (none) | Accepted for parity; unused by Basic auth |

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::exec::ExecutionMode;
use crate::store::Store;

pub const DEFAULT_INTERVAL_HOURS: u64 = 24;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub disable_loop: bool,
    pub disable_optimizer: bool,
    pub disable_evolution: bool,
    pub disable_alerts: bool,
    pub optimizer_interval_hours: u64,
    pub evolution_interval_hours: u64,
    pub binance_creds: Option<(String, String)>,
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    /// SHA-256 hex digest of the password.
    pub password_hash: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0");
        let hours = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_INTERVAL_HOURS)
        };

        let binance_creds = match (
            std::env::var("BINANCE_TESTNET_API_KEY"),
            std::env::var("BINANCE_TESTNET_API_SECRET"),
        ) {
            (Ok(key), Ok(secret)) if !key.is_empty() && !secret.is_empty() => Some((key, secret)),
            _ => None,
        };

        let auth = match (
            std::env::var("AUTH_USERNAME"),
            std::env::var("AUTH_PASSWORD_HASH"),
        ) {
            (Ok(username), Ok(password_hash)) if !username.is_empty() => Some(AuthConfig {
                username,
                password_hash: password_hash.to_lowercase(),
            }),
            _ => None,
        };

        Self {
            db_path: PathBuf::from(
                std::env::var("BOT_DB").unwrap_or_else(|_| "trading.db".to_string()),
            ),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            disable_loop: flag("APP_DISABLE_LOOP"),
            disable_optimizer: flag("APP_DISABLE_OPTIMIZER"),
            disable_evolution: flag("APP_DISABLE_EVOLUTION"),
            disable_alerts: flag("APP_DISABLE_ALERTS"),
            optimizer_interval_hours: hours("OPTIMIZER_INTERVAL_HOURS"),
            evolution_interval_hours: hours("EVOLUTION_INTERVAL_HOURS"),
            binance_creds,
            auth,
        }
    }

    /// Fatal-at-startup check: the configured execution mode must have its
    /// credentials.
    pub fn validate_against_settings(&self, store: &Store) -> Result<()> {
        let mode_name: String =
            store.get_setting_or("execution_mode", ExecutionMode::Paper.as_str().to_string())?;
        let Some(mode) = ExecutionMode::parse(&mode_name) else {
            bail!("unknown execution_mode '{mode_name}' in settings");
        };
        if mode == ExecutionMode::BinanceTestnet && self.binance_creds.is_none() {
            bail!(
                "execution_mode is binance_testnet but BINANCE_TESTNET_API_KEY/SECRET are not set"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;

    fn base_config() -> AppConfig {
        AppConfig {
            db_path: PathBuf::from("trading.db"),
            bind_addr: "127.0.0.1:8000".to_string(),
            disable_loop: false,
            disable_optimizer: false,
            disable_evolution: false,
            disable_alerts: false,
            optimizer_interval_hours: 24,
            evolution_interval_hours: 24,
            binance_creds: None,
            auth: None,
        }
    }

    #[test]
    fn paper_mode_needs_no_credentials() {
        let (_dir, store) = temp_store();
        assert!(base_config().validate_against_settings(&store).is_ok());
    }

    #[test]
    fn testnet_mode_without_credentials_is_fatal() {
        let (_dir, store) = temp_store();
        store
            .set_setting("execution_mode", &"binance_testnet")
            .unwrap();
        assert!(base_config().validate_against_settings(&store).is_err());

        let mut with_creds = base_config();
        with_creds.binance_creds = Some(("k".to_string(), "s".to_string()));
        assert!(with_creds.validate_against_settings(&store).is_ok());
    }

    #[test]
    fn unknown_mode_is_fatal() {
        let (_dir, store) = temp_store();
        store.set_setting("execution_mode", &"live").unwrap();
        assert!(base_config().validate_against_settings(&store).is_err());
    }
}
