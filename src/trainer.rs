use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::TrainArgs;
use crate::backtest::{BacktestResult, BacktestRunner};
use crate::error::{EngineError, ErrorKind};
use crate::metrics::{MIN_SAMPLES, MetricEngine};
use crate::price_source::{CoinGeckoPriceSource, CsvPriceSource, DateRange, PriceSource};
use crate::producer::{
    FallbackProducer, MarketConditions, OpenAiProducer, ProducerContext, StrategyProducer,
    TemplateProducer,
};
use crate::ranking::{self, ForecastRecord, HISTORY_LIMIT, ModelScore, RankingEngine};
use crate::registry::{Candidate, DecayThresholds, StrategyRegistry};
use crate::rules;
use crate::store::{self, FileStore, Store};
use crate::strategy::StrategySpec;

/// Multiplicative confidence weights per forecasting model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightPolicy {
    pub boost: f64,
    pub decay: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    pub boost_accuracy: f64,
    pub boost_roi: f64,
    pub decay_accuracy: f64,
    pub decay_drift: f64,
}

impl Default for WeightPolicy {
    fn default() -> Self {
        Self {
            boost: 1.07,
            decay: 0.93,
            min_weight: 0.05,
            max_weight: 5.0,
            boost_accuracy: 0.7,
            boost_roi: 0.03,
            decay_accuracy: 0.4,
            decay_drift: 0.2,
        }
    }
}

impl WeightPolicy {
    pub fn update(&self, weight: f64, score: &ModelScore) -> f64 {
        let next = if score.lifetime_accuracy >= self.boost_accuracy || score.avg_roi > self.boost_roi {
            weight * self.boost
        } else if score.lifetime_accuracy < self.decay_accuracy
            || score.confidence_drift > self.decay_drift
        {
            weight * self.decay
        } else {
            weight
        };
        next.clamp(self.min_weight, self.max_weight)
    }

    /// Update every scored model in place. Unseen models start at 1.0;
    /// models with no score this pass keep their weight.
    pub fn apply(&self, weights: &mut BTreeMap<String, f64>, scores: &BTreeMap<String, ModelScore>) {
        for (model, score) in scores {
            let w = weights.entry(model.clone()).or_insert(1.0);
            *w = self.update(*w, score);
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub concurrency: usize,
    /// Applies to every price-source and producer call.
    pub dependency_timeout: Duration,
    pub history_limit: usize,
    pub lookback_days: i64,
    pub min_samples: usize,
    pub thresholds: DecayThresholds,
    pub weights: WeightPolicy,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            dependency_timeout: Duration::from_secs(30),
            history_limit: HISTORY_LIMIT,
            lookback_days: 120,
            min_samples: MIN_SAMPLES,
            thresholds: DecayThresholds::default(),
            weights: WeightPolicy::default(),
        }
    }
}

/// Cooperative cancellation for a cycle or the daemon loop.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for Failure {
    fn from(e: &EngineError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Outcome of one training cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub processed: Vec<String>,
    pub regenerated: Vec<String>,
    pub skipped: BTreeMap<String, ErrorKind>,
    pub failed: BTreeMap<String, Failure>,
    /// Instruments that were processed but whose replacement strategy was
    /// rejected; the previous strategy stays active.
    pub regen_failures: BTreeMap<String, Failure>,
    /// Never started because the cycle was cancelled first.
    #[serde(default)]
    pub not_run: Vec<String>,
    pub counts: BTreeMap<ErrorKind, usize>,
    pub ranking_ran: bool,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            cancelled: false,
            processed: vec![],
            regenerated: vec![],
            skipped: BTreeMap::new(),
            failed: BTreeMap::new(),
            regen_failures: BTreeMap::new(),
            not_run: vec![],
            counts: BTreeMap::new(),
            ranking_ran: false,
        }
    }

    fn count(&mut self, kind: ErrorKind) {
        *self.counts.entry(kind).or_default() += 1;
    }

    fn record(&mut self, instrument: String, outcome: Result<Processed, EngineError>) {
        match outcome {
            Ok(p) => {
                if let Some(e) = &p.regen_error {
                    self.count(e.kind());
                    self.regen_failures.insert(instrument.clone(), e.into());
                }
                if p.regenerated {
                    self.regenerated.push(instrument.clone());
                }
                self.processed.push(instrument);
            }
            Err(e) if e.is_skip() => {
                self.count(e.kind());
                self.skipped.insert(instrument, e.kind());
            }
            Err(e) => {
                self.count(e.kind());
                self.failed.insert(instrument, (&e).into());
            }
        }
    }

    pub fn print_summary(&self) {
        let secs = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        println!("📋 CYCLE REPORT {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("{}", "=".repeat(80));
        println!("   Processed: {}", self.processed.len());
        println!("   Regenerated: {}", self.regenerated.len());
        println!("   Skipped: {}", self.skipped.len());
        println!("   Failed: {}", self.failed.len());
        if !self.not_run.is_empty() {
            println!("   Not run: {}", self.not_run.join(", "));
        }
        println!("   Ranking pass: {}", if self.ranking_ran { "yes" } else { "skipped" });
        if self.cancelled {
            println!("   ⚠️  Cycle was cancelled");
        }
        println!("   Duration: {:.1}s", secs);
        println!();

        if !self.skipped.is_empty() || !self.failed.is_empty() || !self.regen_failures.is_empty() {
            println!("{:<12} {:<10} {:<26} {}", "Asset", "Status", "Kind", "Detail");
            println!("{}", "-".repeat(80));
            for (inst, kind) in &self.skipped {
                println!("{:<12} {:<10} {:<26} -", inst, "skipped", kind.to_string());
            }
            for (inst, f) in &self.failed {
                println!("{:<12} {:<10} {:<26} {}", inst, "failed", f.kind.to_string(), f.message);
            }
            for (inst, f) in &self.regen_failures {
                println!("{:<12} {:<10} {:<26} {}", inst, "regen", f.kind.to_string(), f.message);
            }
            println!();
        }

        if !self.counts.is_empty() {
            println!("   Counts by kind:");
            for (kind, n) in &self.counts {
                println!("     {:<26} {}", kind.to_string(), n);
            }
            println!();
        }
    }
}

#[derive(Debug)]
struct Processed {
    regenerated: bool,
    regen_error: Option<EngineError>,
}

fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::Store(format!("{:#}", e))
}

/// The self-training controller: backtests every instrument, replaces
/// decayed strategies, then reranks models and reweights them.
#[derive(Clone)]
pub struct Trainer {
    config: TrainerConfig,
    store: Arc<dyn Store>,
    prices: Arc<dyn PriceSource>,
    producer: Arc<dyn StrategyProducer>,
    registry: Arc<StrategyRegistry>,
    runner: BacktestRunner,
}

impl Trainer {
    /// Restores the registry from `active_strategies`. A store that cannot be
    /// read is an error.
    pub fn open(
        config: TrainerConfig,
        store: Arc<dyn Store>,
        prices: Arc<dyn PriceSource>,
        producer: Arc<dyn StrategyProducer>,
    ) -> Result<Self, EngineError> {
        let states = store::load_or_default(store.as_ref(), store::ACTIVE_STRATEGIES).map_err(store_err)?;
        let registry = Arc::new(StrategyRegistry::restore(states));
        let runner = BacktestRunner::new(MetricEngine::new(config.min_samples));
        Ok(Self {
            config,
            store,
            prices,
            producer,
            registry,
            runner,
        })
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub async fn run_cycle(&self, instruments: &[String], cancel: &CancelFlag) -> Result<CycleReport, EngineError> {
        self.run_cycle_at(instruments, cancel, Utc::now()).await
    }

    /// One full cycle as of `now`. Per-instrument failures end up in the
    /// report; only store failures are returned as errors.
    pub async fn run_cycle_at(
        &self,
        instruments: &[String],
        cancel: &CancelFlag,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, EngineError> {
        let mut report = CycleReport::new(Utc::now());
        let history: Vec<ForecastRecord> =
            store::load_or_default(self.store.as_ref(), store::FORECAST_HISTORY).map_err(store_err)?;
        let mut weights: BTreeMap<String, f64> =
            store::load_or_default(self.store.as_ref(), store::STRATEGY_WEIGHTS).map_err(store_err)?;

        info!(instruments = instruments.len(), "starting training cycle");
        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = vec![];
        let mut started = vec![];
        for instrument in instruments {
            if cancel.is_cancelled() {
                report.not_run.push(instrument.clone());
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.not_run.push(instrument.clone());
                    continue;
                }
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            started.push(instrument.clone());
            let this = self.clone();
            let cancel = cancel.clone();
            let inst = instrument.clone();
            tasks.push(tokio::spawn(async move {
                let _p = permit;
                this.process_instrument(&inst, &cancel, now).await
            }));
        }

        // barrier: ranking only sees a complete cycle
        let outcomes = join_all(tasks).await;
        for (instrument, outcome) in started.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|e| {
                Err(EngineError::StrategyExecution(format!("instrument task aborted: {}", e)))
            });
            match &outcome {
                Ok(_) => info!(instrument = %instrument, "processed"),
                Err(e) if e.is_skip() => warn!(instrument = %instrument, error = %e, "skipped"),
                Err(e) => error!(instrument = %instrument, error = %e, "failed"),
            }
            report.record(instrument.clone(), outcome);
        }

        if cancel.is_cancelled() {
            warn!("cycle cancelled; ranking pass skipped");
            report.cancelled = true;
            report.finished_at = Utc::now();
            store::save(self.store.as_ref(), store::LAST_CYCLE_REPORT, &report).map_err(store_err)?;
            return Ok(report);
        }

        let ranked = RankingEngine::new(self.config.history_limit).rank(&history, now);
        let leaderboard = ranking::strategy_leaderboard(&self.registry.active_results());
        self.config.weights.apply(&mut weights, &ranked.scores);

        let s = self.store.as_ref();
        store::save(s, store::MODEL_SCORES, &ranked.scores).map_err(store_err)?;
        store::save(s, store::ROUTING_TABLE, &ranked.routing).map_err(store_err)?;
        store::save(s, store::STRATEGY_LEADERBOARD, &leaderboard).map_err(store_err)?;
        store::save(s, store::STRATEGY_WEIGHTS, &weights).map_err(store_err)?;
        store::save(s, store::ACTIVE_STRATEGIES, &self.registry.snapshot()).map_err(store_err)?;

        report.ranking_ran = true;
        report.finished_at = Utc::now();
        store::save(s, store::LAST_CYCLE_REPORT, &report).map_err(store_err)?;
        info!(
            processed = report.processed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "training cycle complete"
        );
        Ok(report)
    }

    async fn process_instrument(
        &self,
        instrument: &str,
        cancel: &CancelFlag,
        now: DateTime<Utc>,
    ) -> Result<Processed, EngineError> {
        let lock = self.registry.instrument_lock(instrument);
        let _guard = lock.lock().await;
        self.registry.ensure_instrument(instrument);

        let secs = self.config.dependency_timeout.as_secs();
        let range = DateRange::last_days(now, self.config.lookback_days);
        let series = timeout(
            self.config.dependency_timeout,
            self.prices.get_series(instrument, range),
        )
        .await
        .map_err(|_| EngineError::DependencyTimeout {
            operation: format!("price fetch for {}", instrument),
            secs,
        })??;
        let series = Arc::new(series);

        let candidates = self.registry.candidates(instrument);
        let runner = self.runner;
        let s = series.clone();
        let results = tokio::task::spawn_blocking(move || {
            candidates
                .iter()
                .map(|c| (c.id.clone(), runner.run(c.strategy.as_ref(), &s)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| EngineError::StrategyExecution(format!("backtest task: {}", e)))?;

        let active_id = self.registry.active(instrument).map(|c| c.id);
        let mut scored: Vec<BacktestResult> = vec![];
        let mut first_err = None;
        for (id, result) in results {
            match result {
                Ok(r) => scored.push(r),
                Err(e) if Some(&id) == active_id.as_ref() && !matches!(e, EngineError::InsufficientData { .. }) => {
                    // keep the current strategy; nothing changes this cycle
                    return Err(e);
                }
                Err(e) => {
                    warn!(instrument, candidate = %id, error = %e, "candidate backtest failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        if scored.is_empty() {
            return Err(first_err.unwrap_or(EngineError::InsufficientData {
                len: series.len(),
                min: self.config.min_samples,
            }));
        }
        self.registry.record_results(instrument, &scored);

        if !self.registry.is_due(instrument, &self.config.thresholds) {
            return Ok(Processed {
                regenerated: false,
                regen_error: None,
            });
        }
        if cancel.is_cancelled() {
            info!(instrument, "due for regeneration but cycle is cancelled");
            return Ok(Processed {
                regenerated: false,
                regen_error: None,
            });
        }

        match self.regenerate(instrument, series, now).await {
            Ok(()) => Ok(Processed {
                regenerated: true,
                regen_error: None,
            }),
            Err(e) => {
                warn!(instrument, error = %e, "regeneration failed; keeping current strategy");
                Ok(Processed {
                    regenerated: false,
                    regen_error: Some(e),
                })
            }
        }
    }

    /// Ask the producer for a replacement, validate it, backtest it, and only
    /// then swap it in.
    async fn regenerate(
        &self,
        instrument: &str,
        series: Arc<crate::ohlc::PriceSeries>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let context = ProducerContext {
            metrics: self.registry.last_result(instrument),
            market: MarketConditions::from_series(&series),
        };
        let secs = self.config.dependency_timeout.as_secs();
        let text = timeout(
            self.config.dependency_timeout,
            self.producer.propose(instrument, &context),
        )
        .await
        .map_err(|_| EngineError::DependencyTimeout {
            operation: format!("strategy producer for {}", instrument),
            secs,
        })?
        .map_err(|e| EngineError::InvalidGeneratedStrategy(format!("producer failed: {:#}", e)))?;

        let id = format!("{}_auto_{}", instrument.to_lowercase(), now.format("%Y%m%d%H%M%S"));
        let spec = StrategySpec::Generated {
            source: rules::extract_source(&text).to_string(),
        };
        let candidate = Candidate::build(id, spec)?;

        let registry = self.registry.clone();
        let runner = self.runner;
        let inst = instrument.to_string();
        let result = tokio::task::spawn_blocking(move || {
            registry.try_regenerate(&inst, candidate, &series, &runner)
        })
        .await
        .map_err(|e| EngineError::StrategyExecution(format!("regeneration task: {}", e)))??;
        info!(
            instrument,
            strategy = %result.strategy_id,
            sharpe = result.sharpe,
            "regenerated strategy active"
        );
        Ok(())
    }
}

/// Repeat cycles every `interval` until `cancel` fires. A cycle that fails
/// on the store is logged and retried next interval.
pub async fn run_daemon(
    trainer: &Trainer,
    instruments: &[String],
    interval: Duration,
    cancel: &CancelFlag,
) -> Result<()> {
    println!("🚀 Starting self-training daemon");
    println!("Instruments: {}", instruments.join(", "));
    println!("Check Interval: {} minutes", interval.as_secs() / 60);
    println!();

    let mut iteration = 0;
    loop {
        iteration += 1;
        let start_time = Utc::now();
        println!(
            "⏰ === TRAINING CYCLE #{} - {} ===",
            iteration,
            start_time.format("%Y-%m-%d %H:%M:%S UTC")
        );

        match trainer.run_cycle(instruments, cancel).await {
            Ok(report) => report.print_summary(),
            Err(e) => {
                error!(error = %e, "cycle aborted");
                println!("   ❌ Cycle aborted: {}", e);
                println!("   ⏭️  Skipping this cycle, will retry in {} minutes", interval.as_secs() / 60);
            }
        }

        if cancel.is_cancelled() {
            println!("🛑 Cancelled; exiting daemon");
            break;
        }

        let next_run = start_time + ChronoDuration::from_std(interval).unwrap_or_else(|_| ChronoDuration::zero());
        println!("⏰ Next run scheduled for: {}", next_run.format("%Y-%m-%d %H:%M:%S UTC"));
        println!();

        tokio::select! {
            _ = sleep(interval) => {}
            _ = cancel.cancelled() => {
                println!("🛑 Cancelled; exiting daemon");
                break;
            }
        }
    }
    Ok(())
}

fn build_prices(args: &TrainArgs, request_timeout: Duration) -> Result<Arc<dyn PriceSource>> {
    let data = args.data.clone().unwrap_or_else(|| "./out".into());
    match args.source.as_deref().unwrap_or("csv") {
        "csv" => Ok(Arc::new(CsvPriceSource::new(data))),
        "coingecko" => {
            let api_key = match args.api_key.clone() {
                Some(key) => key,
                None => std::env::var("CG_PRO_API_KEY").context("CG_PRO_API_KEY not set")?,
            };
            Ok(Arc::new(
                CoinGeckoPriceSource::new(&api_key, request_timeout)?.with_cache_dir(data),
            ))
        }
        other => bail!("unknown price source '{}'", other),
    }
}

fn build_producer(args: &TrainArgs) -> Result<Arc<dyn StrategyProducer>> {
    match args.producer.as_deref().unwrap_or("template") {
        "template" => Ok(Arc::new(TemplateProducer)),
        "openai" => {
            let model = args.openai_model.as_deref().unwrap_or("gpt-4o-mini");
            match OpenAiProducer::from_env(model)? {
                Some(openai) => {
                    let tiers: Vec<Arc<dyn StrategyProducer>> =
                        vec![Arc::new(openai), Arc::new(TemplateProducer)];
                    Ok(Arc::new(FallbackProducer::new(tiers)))
                }
                None => {
                    println!("⚠️  OPENAI_API_KEY not set, using template producer");
                    Ok(Arc::new(TemplateProducer))
                }
            }
        }
        other => bail!("unknown producer '{}'", other),
    }
}

pub async fn execute(args: &TrainArgs, cancel: CancelFlag) -> Result<()> {
    let defaults = TrainerConfig::default();
    let config = TrainerConfig {
        concurrency: args.concurrency.unwrap_or(defaults.concurrency),
        dependency_timeout: args
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.dependency_timeout),
        history_limit: args.history_limit.unwrap_or(defaults.history_limit),
        lookback_days: args.lookback_days.unwrap_or(defaults.lookback_days),
        ..defaults
    };
    let instruments = args
        .instruments
        .clone()
        .filter(|v| !v.is_empty())
        .context("--instruments is required")?;
    let store_dir = args.store.clone().unwrap_or_else(|| "./state".into());
    let store: Arc<dyn Store> = Arc::new(FileStore::open(&store_dir)?);
    let prices = build_prices(args, config.dependency_timeout)?;
    let producer = build_producer(args)?;
    let trainer = Trainer::open(config, store, prices, producer)?;

    if args.continuous.unwrap_or(false) {
        let interval = Duration::from_secs(args.interval_minutes.unwrap_or(60).max(1) * 60);
        return run_daemon(&trainer, &instruments, interval, &cancel).await;
    }

    let report = trainer.run_cycle(&instruments, &cancel).await?;
    report.print_summary();
    if report.ranking_ran {
        ranking::print_leaderboard(&ranking::strategy_leaderboard(
            &trainer.registry().active_results(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(acc: f64, roi: f64, drift: f64) -> ModelScore {
        ModelScore {
            model_id: "m".into(),
            lifetime_accuracy: acc,
            avg_confidence: acc + drift,
            confidence_drift: drift,
            avg_roi: roi,
            forecast_count: 10,
            rolling_windows: BTreeMap::new(),
            acc_rank: 1,
            roi_rank: 1,
        }
    }

    #[test]
    fn weight_rules() {
        let p = WeightPolicy::default();
        assert!((p.update(1.0, &score(0.8, 0.0, 0.0)) - 1.07).abs() < 1e-12);
        assert!((p.update(1.0, &score(0.5, 0.05, 0.0)) - 1.07).abs() < 1e-12);
        assert!((p.update(1.0, &score(0.3, 0.0, 0.0)) - 0.93).abs() < 1e-12);
        assert!((p.update(1.0, &score(0.5, 0.0, 0.25)) - 0.93).abs() < 1e-12);
        assert_eq!(p.update(1.0, &score(0.5, 0.0, 0.1)), 1.0);
    }

    #[test]
    fn weights_stay_in_range() {
        let p = WeightPolicy::default();
        let mut w = 1.0;
        for _ in 0..200 {
            w = p.update(w, &score(0.9, 0.1, 0.0));
            assert!(w <= p.max_weight);
        }
        assert_eq!(w, p.max_weight);
        for _ in 0..200 {
            w = p.update(w, &score(0.1, -0.1, 0.5));
            assert!(w >= p.min_weight);
        }
        assert_eq!(w, p.min_weight);
    }

    #[test]
    fn apply_starts_unseen_models_at_one() {
        let mut weights = BTreeMap::new();
        weights.insert("old".to_string(), 2.0);
        let mut scores = BTreeMap::new();
        scores.insert("new".to_string(), score(0.9, 0.0, 0.0));
        WeightPolicy::default().apply(&mut weights, &scores);
        assert_eq!(weights["old"], 2.0);
        assert!((weights["new"] - 1.07).abs() < 1e-12);
    }

    #[tokio::test]
    async fn cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        assert!(!flag.is_cancelled());
        flag.cancel();
        waiter.await.unwrap();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn report_classifies_outcomes() {
        let mut r = CycleReport::new(Utc::now());
        r.record("A".into(), Ok(Processed { regenerated: true, regen_error: None }));
        r.record(
            "B".into(),
            Err(EngineError::DependencyTimeout {
                operation: "price fetch for B".into(),
                secs: 30,
            }),
        );
        r.record("C".into(), Err(EngineError::StrategyExecution("boom".into())));
        r.record(
            "D".into(),
            Ok(Processed {
                regenerated: false,
                regen_error: Some(EngineError::InvalidGeneratedStrategy("no rules".into())),
            }),
        );
        assert_eq!(r.processed, vec!["A", "D"]);
        assert_eq!(r.regenerated, vec!["A"]);
        assert_eq!(r.skipped["B"], ErrorKind::DependencyTimeout);
        assert_eq!(r.failed["C"].kind, ErrorKind::StrategyExecutionError);
        assert_eq!(r.regen_failures["D"].kind, ErrorKind::InvalidGeneratedStrategy);
        assert_eq!(r.counts.values().sum::<usize>(), 3);
    }

    #[test]
    fn report_serializes_kind_keys() {
        let mut r = CycleReport::new(Utc::now());
        r.count(ErrorKind::PriceUnavailable);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"PriceUnavailable\":1"));
        let back: CycleReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
