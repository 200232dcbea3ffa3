use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::EngineError;
use crate::indicator::pct_change;

/// Minimum bars for meaningful statistics.
pub const MIN_SAMPLES: usize = 5;
pub const TRADING_DAYS: f64 = 252.0;
const SHARPE_EPSILON: f64 = 1e-8;

/// Performance of one signal series against one price series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Final equity minus one.
    pub pnl: f64,
    pub sharpe: f64,
    /// Non-positive; more negative is worse.
    pub max_drawdown: f64,
    pub hit_rate: f64,
    /// Bars with a nonzero strategy return.
    pub trade_count: usize,
    pub equity_curve: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricEngine {
    min_samples: usize,
}

impl Default for MetricEngine {
    fn default() -> Self {
        Self {
            min_samples: MIN_SAMPLES,
        }
    }
}

impl MetricEngine {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples: min_samples.max(2),
        }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Score `signals` against `closes`. The signal at bar `i - 1` is applied
    /// to the return from bar `i - 1` to bar `i`.
    pub fn compute(&self, closes: &[f64], signals: &[f64]) -> Result<Metrics, EngineError> {
        if closes.len() != signals.len() {
            return Err(EngineError::SignalLengthMismatch {
                prices: closes.len(),
                signals: signals.len(),
            });
        }
        if closes.len() < self.min_samples {
            return Err(EngineError::InsufficientData {
                len: closes.len(),
                min: self.min_samples,
            });
        }

        let returns = pct_change(closes);
        let strategy_returns: Vec<f64> = returns
            .iter()
            .enumerate()
            .map(|(i, r)| if i == 0 { 0.0 } else { r * signals[i - 1] })
            .collect();

        let mut equity = 1.0;
        let mut peak = f64::MIN;
        let mut max_drawdown = 0.0f64;
        let mut equity_curve = Vec::with_capacity(strategy_returns.len());
        for r in &strategy_returns {
            equity *= 1.0 + r;
            peak = peak.max(equity);
            max_drawdown = max_drawdown.min((equity - peak) / peak);
            equity_curve.push(equity);
        }

        let mean = strategy_returns.iter().mean();
        // sample stdev (n - 1)
        let sd = strategy_returns.iter().std_dev();
        let sharpe = mean / (sd + SHARPE_EPSILON) * TRADING_DAYS.sqrt();

        let wins = strategy_returns.iter().filter(|r| **r > 0.0).count();
        let trade_count = strategy_returns.iter().filter(|r| **r != 0.0).count();
        let hit_rate = if trade_count == 0 {
            0.0
        } else {
            wins as f64 / trade_count as f64
        };

        Ok(Metrics {
            pnl: equity - 1.0,
            sharpe,
            max_drawdown,
            hit_rate,
            trade_count,
            equity_curve,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_computed_four_bar_reference() {
        let closes = [100.0, 101.0, 99.0, 105.0];
        let signals = [0.0, 1.0, 1.0, -1.0];
        let m = MetricEngine::new(4).compute(&closes, &signals).unwrap();

        // strategy returns: [0, 0 * 0.01, 1 * (99-101)/101, 1 * (105-99)/99]
        let r2 = (99.0 - 101.0) / 101.0;
        let r3 = (105.0 - 99.0) / 99.0;
        let rets = [0.0, 0.0, r2, r3];
        let mean = (r2 + r3) / 4.0;
        let var = rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / 3.0;
        let sharpe = mean / (var.sqrt() + 1e-8) * 252f64.sqrt();

        assert!((m.sharpe - sharpe).abs() < 1e-9);
        assert!((m.sharpe - 4.643220).abs() < 1e-5);
        assert!((m.max_drawdown - r2).abs() < 1e-12);
        assert!((m.hit_rate - 0.5).abs() < 1e-12);
        assert_eq!(m.trade_count, 2);
        assert!((m.pnl - ((1.0 + r2) * (1.0 + r3) - 1.0)).abs() < 1e-12);
        assert_eq!(m.equity_curve.len(), 4);
        assert!(r2 < 0.0);
    }

    #[test]
    fn all_zero_signals_are_zero_safe() {
        let closes = [10.0, 12.0, 9.0, 11.0, 10.0, 13.0];
        let m = MetricEngine::default()
            .compute(&closes, &[0.0; 6])
            .unwrap();
        assert_eq!(m.sharpe, 0.0);
        assert_eq!(m.hit_rate, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.trade_count, 0);
        assert!(m.equity_curve.iter().all(|e| *e == 1.0));
    }

    #[test]
    fn short_series_is_insufficient_data() {
        let err = MetricEngine::default()
            .compute(&[1.0, 2.0, 3.0, 4.0], &[1.0; 4])
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { len: 4, min: 5 }));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = MetricEngine::default()
            .compute(&[1.0; 6], &[1.0; 5])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::SignalLengthMismatch {
                prices: 6,
                signals: 5
            }
        ));
    }

    #[test]
    fn drawdown_tracks_running_peak() {
        // long throughout: equity follows price / 100
        let closes = [100.0, 120.0, 90.0, 100.0, 130.0];
        let m = MetricEngine::default().compute(&closes, &[1.0; 5]).unwrap();
        assert!((m.max_drawdown - (-0.25)).abs() < 1e-12);
        assert!((m.pnl - 0.3).abs() < 1e-12);
        assert!((m.hit_rate - 0.75).abs() < 1e-12);
    }
}
