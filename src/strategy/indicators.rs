//! Rolling indicator math over bar slices.
//!
//! Every function returns `None` until its warm-up window is filled; genome
//! conditions treat missing values as false, so an undersized buffer can
//! never fire a rule.

use crate::data::Bar;

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values[values.len() - period..].iter().sum::<f64>() / period as f64)
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values, then folded with `k = 2 / (period + 1)`.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = values[..period].iter().sum::<f64>() / period as f64;
    for v in &values[period..] {
        out = (v - out) * k + out;
    }
    Some(out)
}

/// RSI from simple averages of the last `period` gains and losses.
/// 100 when there are no losses in the window.
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let mut gains = Vec::with_capacity(values.len() - 1);
    let mut losses = Vec::with_capacity(values.len() - 1);
    for pair in values.windows(2) {
        let change = pair[1] - pair[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }
    let avg_gain = sma(&gains, period)?;
    let avg_loss = sma(&losses, period)?;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Bollinger bands `(lower, middle, upper)` with population standard
/// deviation over the window.
pub fn bollinger(values: &[f64], period: usize, std_dev: f64) -> Option<(f64, f64, f64)> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / period as f64;
    let std = variance.sqrt();
    Some((middle - std * std_dev, middle, middle + std * std_dev))
}

/// Average true range: mean of the last `period` true ranges.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let mut ranges = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        ranges.push(tr);
    }
    sma(&ranges, period)
}
