//! The three seeded parametric strategy families and their search grids.
//!
//! Each evaluator owns its rolling buffers and produces a raw signal that
//! must repeat for `confirm_bars` consecutive bars before it is emitted;
//! any disagreement resets the streak.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;

use super::indicators::sma;
use crate::data::Bar;

pub const DEFAULT_CONFIRM_BARS: u32 = 2;

fn default_confirm_bars() -> u32 {
    DEFAULT_CONFIRM_BARS
}

/// N-bar signal confirmation. Emits the raw signal once it has repeated
/// `confirm_bars` times in a row, `0.0` otherwise.
#[derive(Debug, Clone)]
pub struct Confirmation {
    confirm_bars: u32,
    streak: u32,
    current: f64,
}

impl Confirmation {
    pub fn new(confirm_bars: u32) -> Self {
        Self {
            confirm_bars: confirm_bars.max(1),
            streak: 0,
            current: 0.0,
        }
    }

    pub fn gate(&mut self, raw: f64) -> f64 {
        if (raw - self.current).abs() < f64::EPSILON && self.streak > 0 {
            self.streak += 1;
        } else {
            self.streak = 1;
            self.current = raw;
        }
        if self.streak >= self.confirm_bars {
            raw
        } else {
            0.0
        }
    }

    /// Whether the streak has reached the confirmation threshold.
    pub fn confirmed(&self) -> bool {
        self.streak >= self.confirm_bars
    }
}

/// Buffer maintenance shared by the families: append only bars newer than
/// what the evaluator has already seen, so overlapping windows from the
/// scheduler or backtester do not double-count.
fn push_new<T>(seen_ts: &mut i64, bars: &[Bar], buf: &mut VecDeque<T>, cap: usize, f: impl Fn(&Bar) -> T) {
    for b in bars {
        if b.ts <= *seen_ts {
            continue;
        }
        *seen_ts = b.ts;
        if buf.len() == cap {
            buf.pop_front();
        }
        buf.push_back(f(b));
    }
}

// ── Mean reversion ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeanReversionParams {
    pub lookback: usize,
    pub band: f64,
    #[serde(default = "default_confirm_bars")]
    pub confirm_bars: u32,
}

#[derive(Debug)]
pub struct MeanReversion {
    pub params: MeanReversionParams,
    closes: VecDeque<f64>,
    seen_ts: i64,
    confirmation: Confirmation,
}

impl MeanReversion {
    pub fn new(params: MeanReversionParams) -> Self {
        let confirmation = Confirmation::new(params.confirm_bars);
        Self {
            params,
            closes: VecDeque::new(),
            seen_ts: i64::MIN,
            confirmation,
        }
    }

    pub fn on_bar(&mut self, bars: &[Bar]) -> f64 {
        let cap = self.params.lookback.max(50);
        push_new(&mut self.seen_ts, bars, &mut self.closes, cap, |b| b.close);
        if self.closes.len() < self.params.lookback {
            return 0.0;
        }
        let closes: Vec<f64> = self.closes.iter().copied().collect();
        let ma = sma(&closes, self.params.lookback).unwrap_or_default();
        let deviations: Vec<f64> = closes.iter().map(|c| (c - ma).abs()).collect();
        let mut dev = sma(&deviations, self.params.lookback).unwrap_or_default();
        if dev == 0.0 {
            dev = 1.0;
        }
        let last = closes[closes.len() - 1];

        let raw = if last < ma - self.params.band * dev {
            1.0
        } else if last > ma + self.params.band * dev {
            -1.0
        } else {
            0.0
        };
        self.confirmation.gate(raw)
    }
}

// ── Breakout ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakoutParams {
    pub lookback: usize,
    #[serde(default = "default_confirm_bars")]
    pub confirm_bars: u32,
}

#[derive(Debug)]
pub struct Breakout {
    pub params: BreakoutParams,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    seen_ts: i64,
    confirmation: Confirmation,
}

impl Breakout {
    pub fn new(params: BreakoutParams) -> Self {
        let confirmation = Confirmation::new(params.confirm_bars);
        Self {
            params,
            highs: VecDeque::new(),
            lows: VecDeque::new(),
            seen_ts: i64::MIN,
            confirmation,
        }
    }

    pub fn on_bar(&mut self, bars: &[Bar]) -> f64 {
        let cap = self.params.lookback;
        let mut seen = self.seen_ts;
        push_new(&mut seen, bars, &mut self.highs, cap, |b| b.high);
        push_new(&mut self.seen_ts, bars, &mut self.lows, cap, |b| b.low);
        if self.highs.len() < self.params.lookback {
            return 0.0;
        }
        let Some(last) = bars.last().map(|b| b.close) else {
            return 0.0;
        };
        let max_high = self.highs.iter().copied().fold(f64::MIN, f64::max);
        let min_low = self.lows.iter().copied().fold(f64::MAX, f64::min);

        let raw = if last >= max_high {
            1.0
        } else if last <= min_low {
            -1.0
        } else {
            0.0
        };
        self.confirmation.gate(raw)
    }
}

// ── Trend following ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendFollowParams {
    pub fast: usize,
    pub slow: usize,
    #[serde(default = "default_confirm_bars")]
    pub confirm_bars: u32,
}

#[derive(Debug)]
pub struct TrendFollow {
    pub params: TrendFollowParams,
    closes: VecDeque<f64>,
    seen_ts: i64,
    confirmation: Confirmation,
}

impl TrendFollow {
    pub fn new(params: TrendFollowParams) -> Self {
        let confirmation = Confirmation::new(params.confirm_bars);
        Self {
            params,
            closes: VecDeque::new(),
            seen_ts: i64::MIN,
            confirmation,
        }
    }

    pub fn on_bar(&mut self, bars: &[Bar]) -> f64 {
        let cap = self.params.slow.max(200);
        push_new(&mut self.seen_ts, bars, &mut self.closes, cap, |b| b.close);
        if self.closes.len() < self.params.slow {
            return 0.0;
        }
        let closes: Vec<f64> = self.closes.iter().copied().collect();
        let fast = sma(&closes, self.params.fast).unwrap_or_default();
        let slow = sma(&closes, self.params.slow).unwrap_or_default();

        let raw = if fast > slow {
            1.0
        } else if fast < slow {
            -1.0
        } else {
            0.0
        };
        self.confirmation.gate(raw)
    }
}

// ── Search grids ─────────────────────────────────────────────────────────

pub fn mean_reversion_grid() -> Vec<serde_json::Value> {
    vec![
        json!({"lookback": 20, "band": 2.0, "confirm_bars": 2}),
        json!({"lookback": 50, "band": 2.0, "confirm_bars": 2}),
        json!({"lookback": 100, "band": 2.5, "confirm_bars": 2}),
    ]
}

pub fn breakout_grid() -> Vec<serde_json::Value> {
    vec![
        json!({"lookback": 20, "confirm_bars": 2}),
        json!({"lookback": 60, "confirm_bars": 2}),
        json!({"lookback": 120, "confirm_bars": 2}),
    ]
}

pub fn trend_follow_grid() -> Vec<serde_json::Value> {
    vec![
        json!({"fast": 10, "slow": 50, "confirm_bars": 2}),
        json!({"fast": 20, "slow": 100, "confirm_bars": 2}),
        json!({"fast": 50, "slow": 200, "confirm_bars": 2}),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    fn bar_hl(ts: i64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            ts,
            open: close,
            high,
            low,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn confirmation_requires_consecutive_repeats() {
        let mut c = Confirmation::new(2);
        assert_eq!(c.gate(1.0), 0.0);
        assert_eq!(c.gate(1.0), 1.0);
        assert_eq!(c.gate(-1.0), 0.0, "disagreement resets");
        assert_eq!(c.gate(1.0), 0.0);
        assert_eq!(c.gate(1.0), 1.0);
    }

    #[test]
    fn confirmation_of_one_passes_immediately() {
        let mut c = Confirmation::new(1);
        assert_eq!(c.gate(-1.0), -1.0);
    }

    #[test]
    fn mean_reversion_goes_long_below_band() {
        let mut s = MeanReversion::new(MeanReversionParams {
            lookback: 5,
            band: 1.0,
            confirm_bars: 1,
        });
        // Stable closes, then a crash well below the band.
        let mut bars: Vec<Bar> = (0..10).map(|i| bar(i, 100.0)).collect();
        assert_eq!(s.on_bar(&bars), 0.0);
        bars.push(bar(10, 60.0));
        assert_eq!(s.on_bar(&bars), 1.0);
    }

    #[test]
    fn mean_reversion_goes_short_above_band() {
        let mut s = MeanReversion::new(MeanReversionParams {
            lookback: 5,
            band: 1.0,
            confirm_bars: 1,
        });
        let mut bars: Vec<Bar> = (0..10).map(|i| bar(i, 100.0)).collect();
        s.on_bar(&bars);
        bars.push(bar(10, 140.0));
        assert_eq!(s.on_bar(&bars), -1.0);
    }

    #[test]
    fn breakout_fires_on_new_high() {
        let mut s = Breakout::new(BreakoutParams {
            lookback: 3,
            confirm_bars: 1,
        });
        let bars = vec![
            bar_hl(0, 10.0, 9.0, 9.5),
            bar_hl(1, 10.5, 9.5, 10.0),
            bar_hl(2, 11.0, 10.0, 11.0),
        ];
        // Close equals the rolling max high → breakout long.
        assert_eq!(s.on_bar(&bars), 1.0);
    }

    #[test]
    fn trend_follow_tracks_sma_cross() {
        let mut s = TrendFollow::new(TrendFollowParams {
            fast: 2,
            slow: 4,
            confirm_bars: 1,
        });
        let rising: Vec<Bar> = (0..8).map(|i| bar(i, 100.0 + f64::from(i as i32))).collect();
        assert_eq!(s.on_bar(&rising), 1.0);

        let mut s = TrendFollow::new(TrendFollowParams {
            fast: 2,
            slow: 4,
            confirm_bars: 1,
        });
        let falling: Vec<Bar> = (0..8).map(|i| bar(i, 100.0 - f64::from(i as i32))).collect();
        assert_eq!(s.on_bar(&falling), -1.0);
    }

    #[test]
    fn overlapping_windows_do_not_double_count() {
        let mut a = TrendFollow::new(TrendFollowParams {
            fast: 2,
            slow: 4,
            confirm_bars: 1,
        });
        let mut b = TrendFollow::new(TrendFollowParams {
            fast: 2,
            slow: 4,
            confirm_bars: 1,
        });
        let bars: Vec<Bar> = (0..8).map(|i| bar(i, 100.0 + f64::from(i as i32))).collect();
        // a sees the full window twice, b once; same verdict.
        a.on_bar(&bars);
        assert_eq!(a.on_bar(&bars), b.on_bar(&bars));
    }

    #[test]
    fn grids_have_expected_shapes() {
        assert_eq!(mean_reversion_grid().len(), 3);
        assert_eq!(breakout_grid().len(), 3);
        assert_eq!(trend_follow_grid().len(), 3);
        assert_eq!(mean_reversion_grid()[2]["lookback"], 100);
        assert_eq!(trend_follow_grid()[0]["slow"], 50);
    }
}
