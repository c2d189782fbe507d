//! Strategy genomes: declarative rule trees a generic evaluator executes.
//!
//! A genome declares a set of indicators plus entry/exit rules over them.
//! The JSON wire shape is the one stored in `evolved_strategies` and
//! `saved_backtests` (`{"type": "indicator_compare", "left": "RSI", "op":
//! "<", "right": 30}` and friends); decoding goes through the typed AST, so
//! unknown indicator or operator tags are rejected up front rather than
//! silently ignored at evaluation time.

use rand::prelude::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::indicators::{atr, bollinger, ema, rsi, sma};
use super::parametric::Confirmation;
use crate::data::Bar;

/// Bars kept in the evaluator's rolling buffer.
const BUFFER_CAP: usize = 300;
/// Minimum buffered bars before any rule may fire.
const WARMUP_BARS: usize = 50;

// ── AST ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceField {
    Close,
    High,
    Low,
}

fn default_source() -> PriceField {
    PriceField::Close
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IndicatorSpec {
    #[serde(rename = "SMA")]
    Sma {
        period: usize,
        #[serde(default = "default_source")]
        source: PriceField,
    },
    #[serde(rename = "EMA")]
    Ema {
        period: usize,
        #[serde(default = "default_source")]
        source: PriceField,
    },
    #[serde(rename = "RSI")]
    Rsi { period: usize },
    #[serde(rename = "BB")]
    Bollinger { period: usize, std_dev: f64 },
    #[serde(rename = "ATR")]
    Atr { period: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==", alias = "=")]
    Eq,
}

impl CmpOp {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            CmpOp::Lt => left < right,
            CmpOp::Le => left <= right,
            CmpOp::Gt => left > right,
            CmpOp::Ge => left >= right,
            CmpOp::Eq => (left - right).abs() < 1e-9,
        }
    }
}

/// Condition operand: an indicator/price name or a numeric threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Value(f64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Condition {
    #[serde(rename = "indicator_compare")]
    IndicatorCompare {
        left: String,
        op: CmpOp,
        right: Operand,
    },
    #[serde(rename = "price_compare")]
    PriceCompare {
        left: String,
        op: CmpOp,
        right: Operand,
    },
}

impl Condition {
    fn evaluate(&self, values: &HashMap<String, f64>) -> bool {
        let (Condition::IndicatorCompare { left, op, right }
        | Condition::PriceCompare { left, op, right }) = self;
        let Some(left_val) = values.get(left) else {
            return false;
        };
        let right_val = match right {
            Operand::Value(v) => *v,
            Operand::Name(name) => match values.get(name) {
                Some(v) => *v,
                None => return false,
            },
        };
        op.holds(*left_val, right_val)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Rule {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: Logic,
}

impl Rule {
    fn evaluate(&self, values: &HashMap<String, f64>) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        match self.logic {
            Logic::And => self.conditions.iter().all(|c| c.evaluate(values)),
            Logic::Or => self.conditions.iter().any(|c| c.evaluate(values)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    #[serde(default)]
    pub indicators: Vec<IndicatorSpec>,
    #[serde(default)]
    pub entry_long: Rule,
    #[serde(default)]
    pub exit_long: Rule,
    #[serde(default = "default_confirm")]
    pub confirm_bars: u32,
}

fn default_confirm() -> u32 {
    2
}

impl Genome {
    pub fn from_value(value: &serde_json::Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("genome serializes")
    }

    // ── Mutation ─────────────────────────────────────────────────────────

    pub fn mutate(&self, rng: &mut impl Rng) -> Genome {
        let mut child = self.clone();
        match rng.random_range(0..6) {
            0 => child.indicators.push(random_indicator(rng)),
            1 => {
                if child.indicators.len() > 1 {
                    let idx = rng.random_range(0..child.indicators.len());
                    child.indicators.remove(idx);
                }
            }
            2 => {
                if !child.indicators.is_empty() {
                    let idx = rng.random_range(0..child.indicators.len());
                    mutate_indicator(&mut child.indicators[idx], rng);
                }
            }
            3 => {
                // Flip combination logic on the entry rule.
                if rng.random_bool(0.5) {
                    child.entry_long.logic = match child.entry_long.logic {
                        Logic::And => Logic::Or,
                        Logic::Or => Logic::And,
                    };
                }
            }
            4 => {
                for rule in [&mut child.entry_long, &mut child.exit_long] {
                    for condition in &mut rule.conditions {
                        let (Condition::IndicatorCompare { right, .. }
                        | Condition::PriceCompare { right, .. }) = condition;
                        if let Operand::Value(v) = right {
                            *v += rng.random_range(-10.0..10.0);
                        }
                    }
                }
            }
            _ => child.confirm_bars = rng.random_range(1..=5),
        }
        child
    }

    /// Combine indicator sets from two parents; pick each rule set and the
    /// confirmation depth from either.
    pub fn crossover(a: &Genome, b: &Genome, rng: &mut impl Rng) -> Genome {
        let mut pool: Vec<IndicatorSpec> = a
            .indicators
            .iter()
            .chain(b.indicators.iter())
            .cloned()
            .collect();
        let take = pool.len().min(rng.random_range(2..=5));
        let mut indicators = Vec::with_capacity(take);
        for _ in 0..take {
            if pool.is_empty() {
                break;
            }
            let idx = rng.random_range(0..pool.len());
            indicators.push(pool.swap_remove(idx));
        }
        Genome {
            indicators,
            entry_long: if rng.random_bool(0.5) {
                a.entry_long.clone()
            } else {
                b.entry_long.clone()
            },
            exit_long: if rng.random_bool(0.5) {
                a.exit_long.clone()
            } else {
                b.exit_long.clone()
            },
            confirm_bars: if rng.random_bool(0.5) {
                a.confirm_bars
            } else {
                b.confirm_bars
            },
        }
    }
}

fn random_indicator(rng: &mut impl Rng) -> IndicatorSpec {
    const SOURCES: &[PriceField] = &[PriceField::Close, PriceField::High, PriceField::Low];
    const MA_PERIODS: &[usize] = &[10, 20, 50, 100, 200];
    const RSI_PERIODS: &[usize] = &[7, 14, 21, 28];
    const BB_PERIODS: &[usize] = &[10, 20, 30];
    const BB_STDS: &[f64] = &[1.5, 2.0, 2.5, 3.0];
    const ATR_PERIODS: &[usize] = &[7, 14, 21];

    match rng.random_range(0..5) {
        0 => IndicatorSpec::Sma {
            period: *MA_PERIODS.choose(rng).expect("non-empty"),
            source: *SOURCES.choose(rng).expect("non-empty"),
        },
        1 => IndicatorSpec::Ema {
            period: *MA_PERIODS.choose(rng).expect("non-empty"),
            source: *SOURCES.choose(rng).expect("non-empty"),
        },
        2 => IndicatorSpec::Rsi {
            period: *RSI_PERIODS.choose(rng).expect("non-empty"),
        },
        3 => IndicatorSpec::Bollinger {
            period: *BB_PERIODS.choose(rng).expect("non-empty"),
            std_dev: *BB_STDS.choose(rng).expect("non-empty"),
        },
        _ => IndicatorSpec::Atr {
            period: *ATR_PERIODS.choose(rng).expect("non-empty"),
        },
    }
}

/// Perturb a period by up to ±20%, floored at 5.
fn perturb_period(period: &mut usize, rng: &mut impl Rng) {
    let span = (*period as i64 / 5).max(1);
    let delta = rng.random_range(-span..=span);
    *period = (*period as i64 + delta).max(5) as usize;
}

fn mutate_indicator(spec: &mut IndicatorSpec, rng: &mut impl Rng) {
    match spec {
        IndicatorSpec::Sma { period, .. }
        | IndicatorSpec::Ema { period, .. }
        | IndicatorSpec::Rsi { period }
        | IndicatorSpec::Atr { period } => perturb_period(period, rng),
        IndicatorSpec::Bollinger { period, std_dev } => {
            perturb_period(period, rng);
            *std_dev = (*std_dev + rng.random_range(-0.5..0.5)).max(1.0);
        }
    }
}

// ── Evaluator ────────────────────────────────────────────────────────────

/// Executes a genome as a strategy: per bar, compute the declared
/// indicators, evaluate `entry_long` (→ +1) else `exit_long` (→ 0) else
/// hold the signal in force, then require N-bar confirmation before a new
/// signal takes effect.
#[derive(Debug)]
pub struct GenomeStrategy {
    pub genome: Genome,
    buffer: VecDeque<Bar>,
    seen_ts: i64,
    held: f64,
    confirmation: Confirmation,
}

impl GenomeStrategy {
    pub fn new(genome: Genome) -> Self {
        let confirmation = Confirmation::new(genome.confirm_bars);
        Self {
            genome,
            buffer: VecDeque::new(),
            seen_ts: i64::MIN,
            held: 0.0,
            confirmation,
        }
    }

    pub fn on_bar(&mut self, bars: &[Bar]) -> f64 {
        for b in bars {
            if b.ts <= self.seen_ts {
                continue;
            }
            self.seen_ts = b.ts;
            if self.buffer.len() == BUFFER_CAP {
                self.buffer.pop_front();
            }
            self.buffer.push_back(*b);
        }
        if self.buffer.len() < WARMUP_BARS {
            return 0.0;
        }

        let values = self.indicator_values();
        let raw = if self.genome.entry_long.evaluate(&values) {
            1.0
        } else if self.genome.exit_long.evaluate(&values) {
            0.0
        } else {
            self.held
        };

        self.confirmation.gate(raw);
        if self.confirmation.confirmed() {
            self.held = raw;
        }
        self.held
    }

    fn indicator_values(&self) -> HashMap<String, f64> {
        fn series<'a>(
            field: PriceField,
            closes: &'a [f64],
            highs: &'a [f64],
            lows: &'a [f64],
        ) -> &'a [f64] {
            match field {
                PriceField::Close => closes,
                PriceField::High => highs,
                PriceField::Low => lows,
            }
        }

        let bars: Vec<Bar> = self.buffer.iter().copied().collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

        let mut values = HashMap::new();
        for spec in &self.genome.indicators {
            match spec {
                IndicatorSpec::Sma { period, source } => {
                    if let Some(v) = sma(series(*source, &closes, &highs, &lows), *period) {
                        values.insert(format!("SMA_{period}"), v);
                    }
                }
                IndicatorSpec::Ema { period, source } => {
                    if let Some(v) = ema(series(*source, &closes, &highs, &lows), *period) {
                        values.insert(format!("EMA_{period}"), v);
                    }
                }
                IndicatorSpec::Rsi { period } => {
                    if let Some(v) = rsi(&closes, *period) {
                        values.insert("RSI".to_string(), v);
                    }
                }
                IndicatorSpec::Bollinger { period, std_dev } => {
                    if let Some((lower, middle, upper)) = bollinger(&closes, *period, *std_dev) {
                        values.insert("BB_lower".to_string(), lower);
                        values.insert("BB_middle".to_string(), middle);
                        values.insert("BB_upper".to_string(), upper);
                    }
                }
                IndicatorSpec::Atr { period } => {
                    if let Some(v) = atr(&bars, *period) {
                        values.insert("ATR".to_string(), v);
                    }
                }
            }
        }
        if let Some(last) = bars.last() {
            values.insert("close".to_string(), last.close);
            values.insert("high".to_string(), last.high);
            values.insert("low".to_string(), last.low);
        }
        values
    }
}

// ── Seeds ────────────────────────────────────────────────────────────────

/// The five hand-crafted starting points the evolver breeds from.
pub fn seed_genomes() -> Vec<Genome> {
    fn ind(left: &str, op: CmpOp, right: f64) -> Condition {
        Condition::IndicatorCompare {
            left: left.to_string(),
            op,
            right: Operand::Value(right),
        }
    }
    fn price(left: &str, op: CmpOp, right: &str) -> Condition {
        Condition::PriceCompare {
            left: left.to_string(),
            op,
            right: Operand::Name(right.to_string()),
        }
    }

    vec![
        // RSI mean reversion
        Genome {
            indicators: vec![IndicatorSpec::Rsi { period: 14 }],
            entry_long: Rule {
                conditions: vec![ind("RSI", CmpOp::Lt, 30.0)],
                logic: Logic::And,
            },
            exit_long: Rule {
                conditions: vec![ind("RSI", CmpOp::Gt, 70.0)],
                logic: Logic::Or,
            },
            confirm_bars: 2,
        },
        // SMA crossover with trend filter
        Genome {
            indicators: vec![
                IndicatorSpec::Sma {
                    period: 20,
                    source: PriceField::Close,
                },
                IndicatorSpec::Sma {
                    period: 50,
                    source: PriceField::Close,
                },
            ],
            entry_long: Rule {
                conditions: vec![
                    price("close", CmpOp::Gt, "SMA_20"),
                    Condition::IndicatorCompare {
                        left: "SMA_20".to_string(),
                        op: CmpOp::Gt,
                        right: Operand::Name("SMA_50".to_string()),
                    },
                ],
                logic: Logic::And,
            },
            exit_long: Rule {
                conditions: vec![price("close", CmpOp::Lt, "SMA_20")],
                logic: Logic::Or,
            },
            confirm_bars: 2,
        },
        // Bollinger bounce
        Genome {
            indicators: vec![
                IndicatorSpec::Bollinger {
                    period: 20,
                    std_dev: 2.0,
                },
                IndicatorSpec::Rsi { period: 14 },
            ],
            entry_long: Rule {
                conditions: vec![
                    price("close", CmpOp::Lt, "BB_lower"),
                    ind("RSI", CmpOp::Lt, 40.0),
                ],
                logic: Logic::And,
            },
            exit_long: Rule {
                conditions: vec![price("close", CmpOp::Gt, "BB_upper")],
                logic: Logic::Or,
            },
            confirm_bars: 2,
        },
        // EMA trend following
        Genome {
            indicators: vec![
                IndicatorSpec::Ema {
                    period: 20,
                    source: PriceField::Close,
                },
                IndicatorSpec::Atr { period: 14 },
            ],
            entry_long: Rule {
                conditions: vec![price("close", CmpOp::Gt, "EMA_20")],
                logic: Logic::And,
            },
            exit_long: Rule {
                conditions: vec![price("close", CmpOp::Lt, "EMA_20")],
                logic: Logic::Or,
            },
            confirm_bars: 3,
        },
        // Multi-indicator confluence
        Genome {
            indicators: vec![
                IndicatorSpec::Sma {
                    period: 50,
                    source: PriceField::Close,
                },
                IndicatorSpec::Rsi { period: 14 },
                IndicatorSpec::Bollinger {
                    period: 20,
                    std_dev: 2.0,
                },
            ],
            entry_long: Rule {
                conditions: vec![
                    price("close", CmpOp::Gt, "SMA_50"),
                    ind("RSI", CmpOp::Lt, 50.0),
                    price("close", CmpOp::Gt, "BB_lower"),
                ],
                logic: Logic::And,
            },
            exit_long: Rule {
                conditions: vec![ind("RSI", CmpOp::Gt, 70.0)],
                logic: Logic::Or,
            },
            confirm_bars: 2,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn flat_bars(n: usize, close: f64) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar {
                ts: i as i64,
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn wire_format_round_trips_losslessly() {
        let wire = json!({
            "indicators": [
                {"type": "SMA", "period": 20, "source": "close"},
                {"type": "RSI", "period": 14},
                {"type": "BB", "period": 20, "std_dev": 2.0}
            ],
            "entry_long": {
                "conditions": [
                    {"type": "indicator_compare", "left": "RSI", "op": "<", "right": 30},
                    {"type": "price_compare", "left": "close", "op": ">", "right": "BB_lower"}
                ],
                "logic": "AND"
            },
            "exit_long": {
                "conditions": [
                    {"type": "indicator_compare", "left": "RSI", "op": ">", "right": 70}
                ],
                "logic": "OR"
            },
            "confirm_bars": 2
        });
        let genome = Genome::from_value(&wire).unwrap();
        let back = Genome::from_value(&genome.to_value()).unwrap();
        assert_eq!(genome, back);
        assert_eq!(genome.indicators.len(), 3);
        assert_eq!(genome.confirm_bars, 2);
        assert!(matches!(
            genome.entry_long.conditions[0],
            Condition::IndicatorCompare {
                op: CmpOp::Lt,
                right: Operand::Value(v),
                ..
            } if (v - 30.0).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn unknown_indicator_tag_is_rejected() {
        let wire = json!({
            "indicators": [{"type": "MACD", "period": 12}],
            "entry_long": {"conditions": [], "logic": "AND"},
            "exit_long": {"conditions": [], "logic": "OR"},
            "confirm_bars": 1
        });
        assert!(Genome::from_value(&wire).is_err());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let wire = json!({
            "indicators": [{"type": "RSI", "period": 14}],
            "entry_long": {
                "conditions": [{"type": "indicator_compare", "left": "RSI", "op": "!=", "right": 30}],
                "logic": "AND"
            },
            "exit_long": {"conditions": [], "logic": "OR"},
            "confirm_bars": 1
        });
        assert!(Genome::from_value(&wire).is_err());
    }

    #[test]
    fn missing_indicator_value_evaluates_false() {
        let rule = Rule {
            conditions: vec![Condition::IndicatorCompare {
                left: "RSI".to_string(),
                op: CmpOp::Lt,
                right: Operand::Value(30.0),
            }],
            logic: Logic::And,
        };
        assert!(!rule.evaluate(&HashMap::new()));
    }

    #[test]
    fn or_logic_needs_one_true() {
        let mut values = HashMap::new();
        values.insert("RSI".to_string(), 80.0);
        values.insert("close".to_string(), 10.0);
        let rule = Rule {
            conditions: vec![
                Condition::IndicatorCompare {
                    left: "RSI".to_string(),
                    op: CmpOp::Lt,
                    right: Operand::Value(30.0),
                },
                Condition::IndicatorCompare {
                    left: "RSI".to_string(),
                    op: CmpOp::Gt,
                    right: Operand::Value(70.0),
                },
            ],
            logic: Logic::Or,
        };
        assert!(rule.evaluate(&values));
    }

    #[test]
    fn evaluator_stays_flat_during_warmup() {
        let mut s = GenomeStrategy::new(seed_genomes().remove(3));
        let bars = flat_bars(WARMUP_BARS - 1, 100.0);
        assert_eq!(s.on_bar(&bars), 0.0);
    }

    #[test]
    fn ema_trend_seed_goes_long_on_rally() {
        // EMA-trend seed with confirm_bars 3: close above EMA_20 for three
        // consecutive bars → long.
        let mut s = GenomeStrategy::new(seed_genomes().remove(3));
        let mut bars = flat_bars(60, 100.0);
        let mut signal = s.on_bar(&bars);
        for i in 0..5 {
            let ts = bars.last().unwrap().ts + 1;
            bars.push(Bar {
                ts,
                open: 110.0 + f64::from(i),
                high: 111.0 + f64::from(i),
                low: 109.0 + f64::from(i),
                close: 110.0 + f64::from(i),
                volume: 1.0,
            });
            signal = s.on_bar(&bars);
        }
        assert_eq!(signal, 1.0);
    }

    #[test]
    fn signal_holds_until_exit_confirms() {
        let mut s = GenomeStrategy::new(seed_genomes().remove(3));
        let mut bars = flat_bars(60, 100.0);
        s.on_bar(&bars);
        for i in 0..5 {
            let ts = bars.last().unwrap().ts + 1;
            bars.push(Bar {
                ts,
                open: 110.0,
                high: 111.0,
                low: 109.0,
                close: 110.0 + f64::from(i),
                volume: 1.0,
            });
            s.on_bar(&bars);
        }
        // One bar back under the EMA does not flip a confirm_bars=3 genome.
        let ts = bars.last().unwrap().ts + 1;
        bars.push(Bar {
            ts,
            open: 90.0,
            high: 91.0,
            low: 89.0,
            close: 90.0,
            volume: 1.0,
        });
        assert_eq!(s.on_bar(&bars), 1.0, "held through unconfirmed exit");
    }

    #[test]
    fn mutation_changes_something_and_stays_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        let seed = &seed_genomes()[0];
        let mut changed = false;
        for _ in 0..20 {
            let child = seed.mutate(&mut rng);
            assert!(!child.indicators.is_empty());
            assert!((1..=5).contains(&child.confirm_bars));
            // Round-trips through the wire format regardless of mutation.
            assert!(Genome::from_value(&child.to_value()).is_ok());
            changed |= child != *seed;
        }
        assert!(changed, "twenty mutations never changed the genome");
    }

    #[test]
    fn crossover_samples_both_parents() {
        let mut rng = StdRng::seed_from_u64(11);
        let seeds = seed_genomes();
        let child = Genome::crossover(&seeds[1], &seeds[2], &mut rng);
        assert!((2..=5).contains(&child.indicators.len()));
        let pool: Vec<&IndicatorSpec> = seeds[1]
            .indicators
            .iter()
            .chain(seeds[2].indicators.iter())
            .collect();
        for spec in &child.indicators {
            assert!(pool.contains(&spec));
        }
        assert!(
            child.entry_long == seeds[1].entry_long || child.entry_long == seeds[2].entry_long
        );
    }

    #[test]
    fn five_seeds_cover_the_families() {
        let seeds = seed_genomes();
        assert_eq!(seeds.len(), 5);
        for seed in &seeds {
            assert!(!seed.indicators.is_empty());
            assert!(!seed.entry_long.conditions.is_empty());
            assert!(!seed.exit_long.conditions.is_empty());
        }
    }
}
