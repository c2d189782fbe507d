//! Round-trip reconstruction and derived position views.
//!
//! Round trips and open positions are never stored; they are pure functions
//! of the append-only trade log, rebuilt on demand by FIFO lot matching in
//! trade-id order. Replaying the same log always yields the same output.

use anyhow::Result;
use chrono::TimeZone;
use chrono_tz::Australia::Sydney;
use rusqlite::params_from_iter;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use super::{now_ts, Store, TradeFilter};

const QTY_EPSILON: f64 = 1e-12;

/// Quote assets whose cross pairs carry no directional P&L signal.
const STABLECOINS: &[&str] = &["USDT", "USDC", "BUSD", "DAI", "TUSD", "FDUSD"];

#[derive(Debug, Clone, Serialize)]
pub struct RoundTrip {
    pub bot: String,
    pub manager: Option<String>,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub open_ts: i64,
    pub close_ts: i64,
    pub duration_s: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenPosition {
    pub bot: String,
    pub manager: Option<String>,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub avg_cost: f64,
    pub open_ts: i64,
    pub unrealized: Option<f64>,
}

/// Raw trade tuple in id order, as fed to the reconstructors.
struct LogEntry {
    ts: i64,
    bot: String,
    manager: Option<String>,
    symbol: String,
    is_buy: bool,
    qty: f64,
    price: f64,
}

/// One open FIFO lot: remaining qty at its effective entry price.
struct Lot {
    open_ts: i64,
    is_buy: bool,
    qty: f64,
    price: f64,
    manager: Option<String>,
}

impl Store {
    /// Closed round trips from FIFO lot matching, most recent first. Works
    /// even if a bot never goes net-flat: partial opposite-side matches emit
    /// round trips, and leftover quantity after the queue drains starts a
    /// new lot (position flip). `fee_bps` applies a per-side slippage
    /// adjustment to the matched prices.
    pub fn list_roundtrips(&self, filter: &TradeFilter, fee_bps: f64) -> Result<Vec<RoundTrip>> {
        let entries = self.trade_log(filter)?;
        let mut out = build_roundtrips(entries, fee_bps);
        out.truncate(filter.limit.unwrap_or(100));
        Ok(out)
    }

    /// Net open position with VWAP entry cost per `(bot, symbol)`.
    pub fn list_open_positions(
        &self,
        filter: &TradeFilter,
        mark_prices: Option<&std::collections::HashMap<String, f64>>,
    ) -> Result<Vec<OpenPosition>> {
        let entries = self.trade_log(filter)?;

        struct Acc {
            manager: Option<String>,
            net_qty: f64,
            entry_qty: f64,
            entry_cost: f64,
            open_ts: i64,
        }
        let mut by_key: BTreeMap<(String, String), Acc> = BTreeMap::new();
        for e in entries {
            let acc = by_key
                .entry((e.bot.clone(), e.symbol.clone()))
                .or_insert_with(|| Acc {
                    manager: e.manager.clone(),
                    net_qty: 0.0,
                    entry_qty: 0.0,
                    entry_cost: 0.0,
                    open_ts: e.ts,
                });
            let signed = if e.is_buy { e.qty } else { -e.qty };
            let prev = acc.net_qty;
            acc.net_qty += signed;
            if prev.abs() < QTY_EPSILON {
                acc.open_ts = e.ts;
            }
            let adds_to_position =
                (acc.net_qty >= 0.0 && e.is_buy) || (acc.net_qty < 0.0 && !e.is_buy);
            if adds_to_position {
                acc.entry_qty += e.qty;
                acc.entry_cost += e.qty * e.price;
            } else {
                let reduce = signed.abs().min(acc.entry_qty);
                if reduce > 0.0 && acc.entry_qty > 0.0 {
                    let avg = acc.entry_cost / acc.entry_qty;
                    acc.entry_qty -= reduce;
                    acc.entry_cost -= reduce * avg;
                }
            }
        }

        let mut out = Vec::new();
        for ((bot, symbol), acc) in by_key {
            if acc.net_qty.abs() < QTY_EPSILON {
                continue;
            }
            let long = acc.net_qty > 0.0;
            let qty = acc.net_qty.abs();
            let avg_cost = if acc.entry_qty > 0.0 {
                acc.entry_cost / acc.entry_qty
            } else {
                0.0
            };
            let unrealized = mark_prices.and_then(|m| m.get(&symbol)).map(|mark| {
                if long {
                    (mark - avg_cost) * qty
                } else {
                    (avg_cost - mark) * qty
                }
            });
            out.push(OpenPosition {
                bot,
                manager: acc.manager,
                symbol,
                side: if long { "LONG" } else { "SHORT" }.to_string(),
                qty,
                avg_cost,
                open_ts: acc.open_ts,
                unrealized,
            });
        }
        out.sort_by_key(|p| std::cmp::Reverse(p.open_ts));
        Ok(out)
    }

    /// Sum of closed round-trip P&L across the whole log.
    pub fn realized_pnl(&self, exclude_stablecoin_pairs: bool) -> Result<f64> {
        let entries = self.trade_log(&TradeFilter::default())?;
        let trips = build_roundtrips(entries, 0.0);
        Ok(trips
            .iter()
            .filter(|t| !(exclude_stablecoin_pairs && is_stablecoin_pair(&t.symbol)))
            .map(|t| t.pnl)
            .sum())
    }

    /// Realized P&L restricted to round trips closed during the current
    /// Sydney-timezone day.
    pub fn todays_pnl(&self, exclude_stablecoin_pairs: bool) -> Result<f64> {
        let (day_start, day_end) = sydney_day_bounds(now_ts());
        let entries = self.trade_log(&TradeFilter::default())?;
        let trips = build_roundtrips(entries, 0.0);
        Ok(trips
            .iter()
            .filter(|t| t.close_ts >= day_start && t.close_ts < day_end)
            .filter(|t| !(exclude_stablecoin_pairs && is_stablecoin_pair(&t.symbol)))
            .map(|t| t.pnl)
            .sum())
    }

    /// All trades matching the filter (except limit) in id order.
    fn trade_log(&self, filter: &TradeFilter) -> Result<Vec<LogEntry>> {
        let mut sql = String::from(
            "SELECT t.ts, t.bot_name, b.manager, t.symbol, t.side, t.qty, t.price
             FROM trades t LEFT JOIN bots b ON b.name = t.bot_name
             WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(bot) = &filter.bot {
            sql.push_str(" AND t.bot_name = ?");
            args.push(Box::new(bot.clone()));
        }
        if let Some(symbol) = &filter.symbol {
            sql.push_str(" AND t.symbol = ?");
            args.push(Box::new(symbol.clone()));
        }
        if let Some(manager) = &filter.manager {
            sql.push_str(" AND b.manager = ?");
            args.push(Box::new(manager.clone()));
        }
        sql.push_str(" ORDER BY t.id ASC");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            let side: String = row.get(4)?;
            Ok(LogEntry {
                ts: row.get(0)?,
                bot: row.get(1)?,
                manager: row.get(2)?,
                symbol: row.get(3)?,
                is_buy: side.eq_ignore_ascii_case("buy"),
                qty: row.get(5)?,
                price: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn build_roundtrips(entries: Vec<LogEntry>, fee_bps: f64) -> Vec<RoundTrip> {
    let fee = fee_bps / 10_000.0;
    let mut groups: BTreeMap<(String, String), Vec<LogEntry>> = BTreeMap::new();
    for e in entries {
        groups
            .entry((e.bot.clone(), e.symbol.clone()))
            .or_default()
            .push(e);
    }

    let mut out = Vec::new();
    for ((bot, symbol), trades) in groups {
        let mut lots: VecDeque<Lot> = VecDeque::new();
        for t in trades {
            if t.qty <= 0.0 {
                continue;
            }
            // Fee applied as slippage: buys fill a touch higher, sells lower.
            let px_eff = t.price * if t.is_buy { 1.0 + fee } else { 1.0 - fee };

            if lots.front().is_none_or(|head| head.is_buy == t.is_buy) {
                lots.push_back(Lot {
                    open_ts: t.ts,
                    is_buy: t.is_buy,
                    qty: t.qty,
                    price: px_eff,
                    manager: t.manager.clone(),
                });
                continue;
            }

            let mut remain = t.qty;
            while remain > QTY_EPSILON {
                let Some(head) = lots.front_mut() else { break };
                if head.is_buy == t.is_buy {
                    break;
                }
                let take = head.qty.min(remain);
                head.qty -= take;
                remain -= take;

                let long = head.is_buy;
                let (entry, exit) = (head.price, px_eff);
                let pnl = if long {
                    (exit - entry) * take
                } else {
                    (entry - exit) * take
                };
                let pnl_pct = if entry.abs() > f64::EPSILON {
                    if long {
                        (exit - entry) / entry
                    } else {
                        (entry - exit) / entry
                    }
                } else {
                    0.0
                };
                out.push(RoundTrip {
                    bot: bot.clone(),
                    manager: head.manager.clone(),
                    symbol: symbol.clone(),
                    side: if long { "LONG" } else { "SHORT" }.to_string(),
                    qty: take,
                    entry_price: entry,
                    exit_price: exit,
                    pnl,
                    pnl_pct,
                    open_ts: head.open_ts,
                    close_ts: t.ts,
                    duration_s: t.ts - head.open_ts,
                });

                if lots.front().is_some_and(|h| h.qty <= QTY_EPSILON) {
                    lots.pop_front();
                }
            }

            // Position flip: leftover quantity opens on the other side.
            if remain > QTY_EPSILON {
                lots.push_back(Lot {
                    open_ts: t.ts,
                    is_buy: t.is_buy,
                    qty: remain,
                    price: px_eff,
                    manager: t.manager.clone(),
                });
            }
        }
    }

    out.sort_by(|a, b| {
        b.close_ts
            .cmp(&a.close_ts)
            .then_with(|| a.bot.cmp(&b.bot))
            .then_with(|| a.open_ts.cmp(&b.open_ts))
    });
    out
}

pub fn is_stablecoin_pair(symbol: &str) -> bool {
    let mut parts = symbol.split('_');
    match (parts.next(), parts.next()) {
        (Some(base), Some(quote)) => {
            STABLECOINS.contains(&base) && STABLECOINS.contains(&quote)
        }
        _ => false,
    }
}

/// `[start, end)` of the current trading day in Australia/Sydney, as epoch
/// seconds. DST-safe: the end bound is the next calendar midnight, not
/// start + 24h.
fn sydney_day_bounds(now: i64) -> (i64, i64) {
    let local = Sydney.timestamp_opt(now, 0).single().unwrap_or_else(|| {
        Sydney
            .timestamp_opt(now, 0)
            .earliest()
            .expect("valid timestamp")
    });
    let date = local.date_naive();
    let start = Sydney
        .from_local_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight"))
        .earliest()
        .expect("midnight exists");
    let next = date.succ_opt().expect("next day");
    let end = Sydney
        .from_local_datetime(&next.and_hms_opt(0, 0, 0).expect("midnight"))
        .earliest()
        .expect("midnight exists");
    (start.timestamp(), end.timestamp())
}
