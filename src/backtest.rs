use anyhow::{Context, Result, bail};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::{fs, path::Path};
use tracing::{debug, info};

use crate::BacktestArgs;
use crate::error::EngineError;
use crate::metrics::{MIN_SAMPLES, MetricEngine};
use crate::ohlc::{self, PriceSeries};
use crate::strategy::{Strategy, StrategySpec};

/// Outcome of one strategy run over one price series. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub instrument: String,
    pub strategy_id: String,
    pub pnl: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub hit_rate: f64,
    pub trade_count: usize,
    pub equity_curve: Vec<f64>,
}

/// Result plus the signals that produced it, for export.
#[derive(Debug, Clone)]
pub struct BacktestRun {
    pub result: BacktestResult,
    pub signals: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BacktestRunner {
    metrics: MetricEngine,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "strategy panicked".to_string()
    }
}

impl BacktestRunner {
    pub fn new(metrics: MetricEngine) -> Self {
        Self { metrics }
    }

    pub fn run(&self, strategy: &dyn Strategy, series: &PriceSeries) -> Result<BacktestResult, EngineError> {
        self.run_detailed(strategy, series).map(|r| r.result)
    }

    /// Invoke the strategy, check its output, and score it.
    ///
    /// Errors and panics from the strategy become
    /// [`EngineError::StrategyExecution`]; a wrong-length signal vector is
    /// [`EngineError::SignalLengthMismatch`] and is never padded or truncated.
    pub fn run_detailed(
        &self,
        strategy: &dyn Strategy,
        series: &PriceSeries,
    ) -> Result<BacktestRun, EngineError> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| strategy.generate_signals(series)));
        let signals = match outcome {
            Ok(Ok(signals)) => signals,
            Ok(Err(e)) => return Err(EngineError::StrategyExecution(format!("{:#}", e))),
            Err(payload) => {
                return Err(EngineError::StrategyExecution(format!(
                    "panic: {}",
                    panic_message(payload.as_ref())
                )));
            }
        };

        if signals.len() != series.len() {
            return Err(EngineError::SignalLengthMismatch {
                prices: series.len(),
                signals: signals.len(),
            });
        }
        if let Some(i) = signals.iter().position(|s| !s.is_finite()) {
            return Err(EngineError::StrategyExecution(format!(
                "non-finite signal {} at bar {}",
                signals[i], i
            )));
        }

        let m = self.metrics.compute(&series.closes(), &signals)?;
        debug!(
            instrument = series.instrument(),
            strategy = strategy.id(),
            sharpe = m.sharpe,
            pnl = m.pnl,
            "backtest scored"
        );

        Ok(BacktestRun {
            result: BacktestResult {
                instrument: series.instrument().to_string(),
                strategy_id: strategy.id().to_string(),
                pnl: m.pnl,
                sharpe: m.sharpe,
                max_drawdown: m.max_drawdown,
                hit_rate: m.hit_rate,
                trade_count: m.trade_count,
                equity_curve: m.equity_curve,
            },
            signals,
        })
    }
}

/// Write bar-by-bar signals and equity for inspection.
pub fn export_signals(series: &PriceSeries, run: &BacktestRun, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create export dir")?;
    }
    let mut wtr = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("create {}", path.display()))?;
    wtr.write_record(["timestamp", "close", "signal", "equity"])?;
    for ((bar, signal), equity) in series
        .bars()
        .iter()
        .zip(&run.signals)
        .zip(&run.result.equity_curve)
    {
        wtr.write_record(&[
            bar.timestamp.to_rfc3339(),
            format!("{:.8}", bar.close),
            format!("{:.4}", signal),
            format!("{:.8}", equity),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Resolve the strategy named on the command line.
fn spec_from_args(args: &BacktestArgs) -> Result<(String, StrategySpec)> {
    if let Some(path) = &args.rules {
        let source =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "rules".to_string());
        return Ok((id, StrategySpec::Generated { source }));
    }
    let name = args.strategy.as_deref().unwrap_or("trend_momentum");
    let spec = match name {
        "hold" => StrategySpec::Hold,
        "candle_direction" => StrategySpec::CandleDirection,
        "trend_momentum" => StrategySpec::TrendMomentum {
            ma_short: args.ma_short.unwrap_or(5),
            ma_long: args.ma_long.unwrap_or(15),
            min_signals: args.min_signals.unwrap_or(2),
        },
        other => bail!("unknown strategy '{}'", other),
    };
    Ok((name.to_string(), spec))
}

pub fn print_result(r: &BacktestResult, bars: usize) {
    println!("📊 {} / {} Backtest", r.instrument, r.strategy_id);
    println!("   Bars: {}", bars);
    println!("   Trades: {}", r.trade_count);
    println!("   Total Return: {:.2}%", r.pnl * 100.0);
    println!("   Win Rate: {:.1}%", r.hit_rate * 100.0);
    println!("   Max Drawdown: {:.2}%", r.max_drawdown * 100.0);
    println!("   Sharpe Ratio: {:.2}", r.sharpe);
    println!();
}

pub fn execute(args: &BacktestArgs) -> Result<()> {
    let csv = args.csv.as_ref().context("--csv is required")?;
    let instrument = args
        .instrument
        .clone()
        .or_else(|| csv.file_stem().map(|s| s.to_string_lossy().to_uppercase()))
        .unwrap_or_else(|| "ASSET".to_string());
    let series = ohlc::read_series(&instrument, csv)?;
    info!("loaded {} bars for {}", series.len(), instrument);

    let (id, spec) = spec_from_args(args)?;
    let strategy = spec.build(&id)?;
    let runner = BacktestRunner::new(MetricEngine::new(args.min_samples.unwrap_or(MIN_SAMPLES)));
    let run = runner.run_detailed(strategy.as_ref(), &series)?;
    print_result(&run.result, series.len());

    if let Some(path) = &args.export {
        export_signals(&series, &run, path)?;
        info!("wrote {}", path.display());
    }
    Ok(())
}
