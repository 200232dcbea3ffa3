pub mod backtest;
pub mod error;
pub mod indicator;
pub mod metrics;
pub mod ohlc;
pub mod price_source;
pub mod producer;
pub mod ranking;
pub mod registry;
pub mod rules;
pub mod store;
pub mod strategy;
pub mod trainer;

use clap::Parser;
use std::path::PathBuf;

/// Backtest one strategy over one daily OHLCV CSV.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct BacktestArgs {
    /// Path to the price CSV (date|timestamp,open,high,low,close[,volume])
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Instrument name (defaults to the CSV file stem)
    #[arg(long)]
    pub instrument: Option<String>,

    /// Built-in strategy: hold, candle_direction, trend_momentum
    #[arg(long)]
    pub strategy: Option<String>,

    /// Rule file to backtest instead of a built-in
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Lookbacks (days) for trend_momentum
    #[arg(long)]
    pub ma_short: Option<usize>,
    #[arg(long)]
    pub ma_long: Option<usize>,

    /// Signals (of 3) needed for a half-weight long in trend_momentum
    #[arg(long)]
    pub min_signals: Option<usize>,

    /// Minimum bars before metrics are computed
    #[arg(long)]
    pub min_samples: Option<usize>,

    /// Write bar-by-bar signals and equity to this CSV
    #[arg(long)]
    pub export: Option<PathBuf>,
}

/// Compile and smoke-test a rule file.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct ValidateArgs {
    /// Rule file to check
    #[arg(long)]
    pub rules: Option<PathBuf>,
}

/// Rank forecasting models from the stored forecast history.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct RankArgs {
    /// Store directory
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Most recent forecasts considered
    #[arg(long)]
    pub history_limit: Option<usize>,

    /// Persist model_scores and routing_table after printing
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub write: Option<bool>,
}

/// Run the self-training cycle once or continuously.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct TrainArgs {
    /// Store directory
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Instruments to train (e.g. BTC ETH SOL)
    #[arg(long, num_args = 1..)]
    pub instruments: Option<Vec<String>>,

    /// Price source: csv or coingecko
    #[arg(long)]
    pub source: Option<String>,

    /// Directory of <INSTRUMENT>.csv files (csv source) or cache dir (coingecko)
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Your CoinGecko Pro API key (or set CG_PRO_API_KEY env)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Strategy producer: template or openai (openai falls back to template)
    #[arg(long)]
    pub producer: Option<String>,

    /// Chat model used by the openai producer
    #[arg(long)]
    pub openai_model: Option<String>,

    /// Instruments processed in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Timeout (s) for each price-source and producer call
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Days of price history per backtest
    #[arg(long)]
    pub lookback_days: Option<i64>,

    /// Most recent forecasts considered by the ranking pass
    #[arg(long)]
    pub history_limit: Option<usize>,

    /// Keep running cycles until Ctrl-C
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub continuous: Option<bool>,

    /// Minutes between cycles in continuous mode
    #[arg(long)]
    pub interval_minutes: Option<u64>,
}
