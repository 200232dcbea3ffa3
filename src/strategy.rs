use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::EngineError;
use crate::indicator::{lift, roc, sma};
use crate::ohlc::PriceSeries;
use crate::rules::{self, RuleProgram};

/// Anything that turns a price series into one signal per bar.
///
/// Signals are `-1.0` (short), `0.0` (flat), `+1.0` (long) or a continuous
/// weight in between.
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;
    fn generate_signals(&self, series: &PriceSeries) -> Result<Vec<f64>>;
}

/// Serializable description of a strategy. This is what the registry
/// persists; [`StrategySpec::build`] turns it into a runnable [`Strategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategySpec {
    /// Always flat. Safe default when nothing else is known.
    Hold,
    CandleDirection,
    TrendMomentum {
        ma_short: usize,
        ma_long: usize,
        min_signals: usize,
    },
    /// Rule text from a producer; compiled and smoke-tested on build.
    Generated { source: String },
}

impl StrategySpec {
    pub fn default_trend() -> Self {
        StrategySpec::TrendMomentum {
            ma_short: 5,
            ma_long: 15,
            min_signals: 2,
        }
    }

    /// Built-in candidates every instrument starts with.
    pub fn builtin_candidates() -> Vec<(String, StrategySpec)> {
        vec![
            ("hold".to_string(), StrategySpec::Hold),
            ("trend_momentum".to_string(), StrategySpec::default_trend()),
            ("candle_direction".to_string(), StrategySpec::CandleDirection),
        ]
    }

    pub fn is_generated(&self) -> bool {
        matches!(self, StrategySpec::Generated { .. })
    }

    pub fn build(&self, id: &str) -> Result<Arc<dyn Strategy>, EngineError> {
        let id = id.to_string();
        let strategy: Arc<dyn Strategy> = match self {
            StrategySpec::Hold => Arc::new(Hold { id }),
            StrategySpec::CandleDirection => Arc::new(CandleDirection { id }),
            StrategySpec::TrendMomentum {
                ma_short,
                ma_long,
                min_signals,
            } => Arc::new(TrendMomentum {
                id,
                ma_short: *ma_short,
                ma_long: *ma_long,
                min_signals: *min_signals,
            }),
            StrategySpec::Generated { source } => Arc::new(GeneratedStrategy {
                id,
                program: rules::validate(source)?,
            }),
        };
        Ok(strategy)
    }
}

pub struct Hold {
    id: String,
}

impl Strategy for Hold {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate_signals(&self, series: &PriceSeries) -> Result<Vec<f64>> {
        Ok(vec![0.0; series.len()])
    }
}

/// Long on green candles, short on red ones.
pub struct CandleDirection {
    id: String,
}

impl Strategy for CandleDirection {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate_signals(&self, series: &PriceSeries) -> Result<Vec<f64>> {
        Ok(series
            .bars()
            .iter()
            .map(|b| {
                if b.close > b.open {
                    1.0
                } else if b.close < b.open {
                    -1.0
                } else {
                    0.0
                }
            })
            .collect())
    }
}

/// Trend + momentum score: price above the long MA, short MA above long MA,
/// and positive rate of change over the short window. Full weight on 3/3,
/// half weight on `min_signals`+ with positive momentum, short on 3/3 bearish.
pub struct TrendMomentum {
    id: String,
    ma_short: usize,
    ma_long: usize,
    min_signals: usize,
}

impl Strategy for TrendMomentum {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate_signals(&self, series: &PriceSeries) -> Result<Vec<f64>> {
        if self.ma_short == 0 || self.ma_short >= self.ma_long {
            bail!(
                "ma_short ({}) must be positive and below ma_long ({})",
                self.ma_short,
                self.ma_long
            );
        }
        if !(1..=3).contains(&self.min_signals) {
            bail!("min_signals must be 1..=3, got {}", self.min_signals);
        }

        let close = lift(&series.closes());
        let ma_s = sma(&close, self.ma_short);
        let ma_l = sma(&close, self.ma_long);
        let momentum = roc(&close, self.ma_short);

        let signals = (0..series.len())
            .map(|i| {
                let (Some(c), Some(s), Some(l), Some(m)) = (close[i], ma_s[i], ma_l[i], momentum[i])
                else {
                    return 0.0;
                };
                let trend_bull = c > l;
                let mom_bull = s > l;
                let roc_bull = m > 0.0;
                let score = [trend_bull, mom_bull, roc_bull].iter().filter(|x| **x).count();

                if score == 3 {
                    1.0
                } else if score >= self.min_signals && roc_bull {
                    0.5
                } else if c < l && s < l && m < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            })
            .collect();
        Ok(signals)
    }
}

/// A producer-supplied rule program.
pub struct GeneratedStrategy {
    id: String,
    program: RuleProgram,
}

impl Strategy for GeneratedStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate_signals(&self, series: &PriceSeries) -> Result<Vec<f64>> {
        Ok(self.program.evaluate(series))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn series(closes: &[f64]) -> PriceSeries {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        PriceSeries::from_closes("T", start, closes).unwrap()
    }

    #[test]
    fn spec_serializes_with_kind_tag() {
        let json = serde_json::to_string(&StrategySpec::default_trend()).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"trend_momentum","ma_short":5,"ma_long":15,"min_signals":2}"#
        );
        let back: StrategySpec = serde_json::from_str(r#"{"kind":"hold"}"#).unwrap();
        assert_eq!(back, StrategySpec::Hold);
    }

    #[test]
    fn hold_matches_length() {
        let s = series(&[1.0, 2.0, 3.0]);
        let strat = StrategySpec::Hold.build("hold").unwrap();
        assert_eq!(strat.generate_signals(&s).unwrap(), vec![0.0; 3]);
        assert_eq!(strat.id(), "hold");
    }

    #[test]
    fn trend_momentum_goes_long_in_uptrend_and_short_in_downtrend() {
        let up: Vec<f64> = (1..=30).map(|i| 100.0 + i as f64).collect();
        let down: Vec<f64> = (1..=30).map(|i| 200.0 - i as f64).collect();
        let strat = StrategySpec::default_trend().build("tm").unwrap();

        let sig_up = strat.generate_signals(&series(&up)).unwrap();
        assert_eq!(sig_up.len(), 30);
        assert!(sig_up[..14].iter().all(|s| *s == 0.0));
        assert_eq!(sig_up[29], 1.0);

        let sig_down = strat.generate_signals(&series(&down)).unwrap();
        assert_eq!(sig_down[29], -1.0);
    }

    #[test]
    fn trend_momentum_rejects_bad_params() {
        let strat = StrategySpec::TrendMomentum {
            ma_short: 20,
            ma_long: 10,
            min_signals: 2,
        }
        .build("bad")
        .unwrap();
        assert!(strat.generate_signals(&series(&[1.0; 30])).is_err());
    }

    #[test]
    fn generated_spec_is_validated_on_build() {
        let ok = StrategySpec::Generated {
            source: "long: close > sma(close, 3)".into(),
        };
        assert!(ok.build("g1").is_ok());
        let bad = StrategySpec::Generated {
            source: "def generate_signals(df): return []".into(),
        };
        assert!(matches!(
            bad.build("g2"),
            Err(EngineError::InvalidGeneratedStrategy(_))
        ));
    }
}
