//! Forecast scoring, model ranking and per-instrument model routing.
//!
//! Every pass recomputes from the (bounded) forecast history; nothing is
//! carried over from a previous pass. All maps are `BTreeMap` so the same
//! history always serializes to the same bytes.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::RankArgs;
use crate::backtest::BacktestResult;
use crate::ohlc;
use crate::store::{self, FileStore, Store};

pub const FULL_HIT: f64 = 1.0;
pub const PARTIAL_HIT: f64 = 0.5;
pub const MISS: f64 = 0.0;
/// Moves within this band count as neutral.
pub const MATERIALITY: f64 = 0.01;
pub const WINDOWS_DAYS: [i64; 2] = [7, 30];
pub const HISTORY_LIMIT: usize = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub model_used: String,
    pub forecast_label: String,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub rationale: String,
}

/// One logged forecast together with the instrument price when it was made.
/// Later records for the same instrument resolve earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    #[serde(alias = "instrument")]
    pub token: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "entry_price")]
    pub price: f64,
    pub forecast: Forecast,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowScore {
    pub accuracy: f64,
    pub roi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    pub model_id: String,
    pub lifetime_accuracy: f64,
    pub avg_confidence: f64,
    /// Mean stated confidence minus accuracy; positive means overconfident.
    pub confidence_drift: f64,
    pub avg_roi: f64,
    /// Resolved forecasts only.
    pub forecast_count: usize,
    /// Keyed `"7d"` / `"30d"`; a window with no forecasts is absent.
    pub rolling_windows: BTreeMap<String, WindowScore>,
    pub acc_rank: usize,
    pub roi_rank: usize,
}

/// Instrument to selected model id.
pub type RoutingTable = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingOutput {
    pub scores: BTreeMap<String, ModelScore>,
    pub routing: RoutingTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub instrument: String,
    pub strategy_id: String,
    pub sharpe: f64,
    pub pnl: f64,
    pub max_drawdown: f64,
    pub hit_rate: f64,
}

// offset-less timestamps in older logs are UTC
fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    ohlc::parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// A forecast matched with the next later price for its instrument.
#[derive(Debug, Clone)]
struct Resolved<'a> {
    record: &'a ForecastRecord,
    model: String,
    score: f64,
    roi: f64,
}

/// Credit for a label given the resolved fractional move.
pub fn score_forecast(label: &str, pct_change: f64) -> f64 {
    let label = label.trim().to_ascii_lowercase();
    if pct_change.abs() <= MATERIALITY {
        if label == "neutral" { PARTIAL_HIT } else { MISS }
    } else if pct_change > MATERIALITY {
        if label == "bullish" { FULL_HIT } else { MISS }
    } else if label == "bearish" {
        FULL_HIT
    } else {
        MISS
    }
}

/// Return from acting on the label: long on bullish, short on bearish,
/// nothing on neutral.
pub fn directional_roi(label: &str, pct_change: f64) -> f64 {
    match label.trim().to_ascii_lowercase().as_str() {
        "bullish" => pct_change,
        "bearish" => -pct_change,
        _ => 0.0,
    }
}

fn mean(xs: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = xs.fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

/// Dense 1-based ranks, best first. Equal keys share a rank.
fn dense_ranks<K: Copy>(
    items: &[(String, K)],
    cmp: impl Fn(&K, &K) -> Ordering,
) -> HashMap<String, usize> {
    let sorted = items
        .iter()
        .sorted_by(|a, b| cmp(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)))
        .collect_vec();
    let mut ranks = HashMap::with_capacity(sorted.len());
    let mut rank = 0;
    let mut prev: Option<K> = None;
    for (id, key) in sorted {
        if prev.is_none_or(|p| cmp(&p, key) != Ordering::Equal) {
            rank += 1;
        }
        prev = Some(*key);
        ranks.insert(id.clone(), rank);
    }
    ranks
}

#[derive(Debug, Clone, Copy)]
pub struct RankingEngine {
    history_limit: usize,
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self {
            history_limit: HISTORY_LIMIT,
        }
    }
}

impl RankingEngine {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
        }
    }

    /// The most recent `history_limit` records, oldest first.
    fn bounded<'a>(&self, history: &'a [ForecastRecord]) -> Vec<&'a ForecastRecord> {
        let sorted = history
            .iter()
            .sorted_by_key(|r| r.timestamp)
            .collect_vec();
        let skip = sorted.len().saturating_sub(self.history_limit);
        sorted.into_iter().skip(skip).collect()
    }

    fn resolve<'a>(&self, records: &[&'a ForecastRecord]) -> Vec<Resolved<'a>> {
        // observed prices per instrument, ascending by time
        let mut prices: HashMap<&str, Vec<(DateTime<Utc>, f64)>> = HashMap::new();
        for &r in records {
            if r.price.is_finite() && r.price > 0.0 {
                prices
                    .entry(r.token.as_str())
                    .or_default()
                    .push((r.timestamp, r.price));
            }
        }

        records
            .iter()
            .filter_map(|&r| {
                let entry = r.price;
                if !(entry.is_finite() && entry > 0.0) {
                    return None;
                }
                let observed = prices.get(r.token.as_str())?;
                let next = observed.partition_point(|(ts, _)| *ts <= r.timestamp);
                let (_, resolved_price) = observed.get(next)?;
                let pct = (resolved_price - entry) / entry;
                let label = &r.forecast.forecast_label;
                Some(Resolved {
                    record: r,
                    model: r.forecast.model_used.trim().to_lowercase(),
                    score: score_forecast(label, pct),
                    roi: directional_roi(label, pct),
                })
            })
            .collect()
    }

    /// Score every model and route every instrument from `history` as of
    /// `now`. Pure: the same inputs give the same output.
    pub fn rank(&self, history: &[ForecastRecord], now: DateTime<Utc>) -> RankingOutput {
        let records = self.bounded(history);
        let resolved = self.resolve(&records);

        let by_model = resolved
            .iter()
            .into_group_map_by(|r| r.model.clone());

        let mut scores: BTreeMap<String, ModelScore> = BTreeMap::new();
        for (model, rows) in by_model {
            let accuracy = mean(rows.iter().map(|r| r.score));
            let avg_confidence = mean(rows.iter().map(|r| r.record.forecast.confidence_score));
            let avg_roi = mean(rows.iter().map(|r| r.roi));

            let mut rolling_windows = BTreeMap::new();
            for days in WINDOWS_DAYS {
                let cutoff = now - Duration::days(days);
                let recent = rows
                    .iter()
                    .filter(|r| r.record.timestamp > cutoff)
                    .collect_vec();
                if !recent.is_empty() {
                    rolling_windows.insert(
                        format!("{}d", days),
                        WindowScore {
                            accuracy: mean(recent.iter().map(|r| r.score)),
                            roi: mean(recent.iter().map(|r| r.roi)),
                        },
                    );
                }
            }

            scores.insert(
                model.clone(),
                ModelScore {
                    model_id: model,
                    lifetime_accuracy: accuracy,
                    avg_confidence,
                    confidence_drift: avg_confidence - accuracy,
                    avg_roi,
                    forecast_count: rows.len(),
                    rolling_windows,
                    acc_rank: 0,
                    roi_rank: 0,
                },
            );
        }

        let acc_keys = scores
            .values()
            .map(|s| (s.model_id.clone(), (s.lifetime_accuracy, s.avg_roi)))
            .collect_vec();
        let acc_ranks = dense_ranks(&acc_keys, |a, b| {
            b.0.total_cmp(&a.0).then_with(|| b.1.total_cmp(&a.1))
        });
        let roi_keys = scores
            .values()
            .map(|s| (s.model_id.clone(), s.avg_roi))
            .collect_vec();
        let roi_ranks = dense_ranks(&roi_keys, |a, b| b.total_cmp(a));
        for (id, s) in scores.iter_mut() {
            s.acc_rank = acc_ranks.get(id).copied().unwrap_or_default();
            s.roi_rank = roi_ranks.get(id).copied().unwrap_or_default();
        }

        RankingOutput {
            routing: route(&resolved),
            scores,
        }
    }
}

/// Per instrument: highest mean score, then most resolved forecasts, then
/// smallest model id.
fn route(resolved: &[Resolved<'_>]) -> RoutingTable {
    let mut per: BTreeMap<&str, BTreeMap<&str, (f64, usize)>> = BTreeMap::new();
    for r in resolved {
        let slot = per
            .entry(r.record.token.as_str())
            .or_default()
            .entry(r.model.as_str())
            .or_insert((0.0, 0));
        slot.0 += r.score;
        slot.1 += 1;
    }

    per.into_iter()
        .filter_map(|(instrument, models)| {
            models
                .into_iter()
                .map(|(model, (sum, n))| (model, sum / n as f64, n))
                .min_by(|a, b| {
                    b.1.total_cmp(&a.1)
                        .then_with(|| b.2.cmp(&a.2))
                        .then_with(|| a.0.cmp(&b.0))
                })
                .map(|(model, _, _)| (instrument.to_string(), model.to_string()))
        })
        .collect()
}

/// Rank active backtest results by Sharpe, then pnl, then instrument.
pub fn strategy_leaderboard(results: &[BacktestResult]) -> Vec<LeaderboardEntry> {
    results
        .iter()
        .sorted_by(|a, b| {
            b.sharpe
                .total_cmp(&a.sharpe)
                .then_with(|| b.pnl.total_cmp(&a.pnl))
                .then_with(|| a.instrument.cmp(&b.instrument))
        })
        .enumerate()
        .map(|(i, r)| LeaderboardEntry {
            rank: i + 1,
            instrument: r.instrument.clone(),
            strategy_id: r.strategy_id.clone(),
            sharpe: r.sharpe,
            pnl: r.pnl,
            max_drawdown: r.max_drawdown,
            hit_rate: r.hit_rate,
        })
        .collect()
}

/// Add one record to the stored forecast log, keeping only the most recent
/// `limit`. Returns the new log length.
pub fn append_forecast(store: &dyn Store, record: ForecastRecord, limit: usize) -> Result<usize> {
    let mut history: Vec<ForecastRecord> = store::load_or_default(store, store::FORECAST_HISTORY)?;
    history.push(record);
    history.sort_by_key(|r| r.timestamp);
    let excess = history.len().saturating_sub(limit.max(1));
    history.drain(..excess);
    store::save(store, store::FORECAST_HISTORY, &history)?;
    Ok(history.len())
}

pub fn print_rankings(out: &RankingOutput) {
    if out.scores.is_empty() {
        println!("❌ No resolved forecasts to rank.");
        return;
    }

    println!("🧠 MODEL SCORES");
    println!(
        "{:<20} {:<8} {:<8} {:<10} {:<10} {:<10} {:<10} {:<10}",
        "Model", "AccRank", "RoiRank", "Acc%", "ROI%", "Drift", "Acc7d%", "Forecasts"
    );
    println!("{}", "-".repeat(90));
    for s in out.scores.values().sorted_by_key(|s| (s.acc_rank, s.model_id.clone())) {
        let acc7 = s
            .rolling_windows
            .get("7d")
            .map(|w| format!("{:.1}", w.accuracy * 100.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<8} {:<8} {:<10.1} {:<10.2} {:<10.3} {:<10} {:<10}",
            s.model_id,
            s.acc_rank,
            s.roi_rank,
            s.lifetime_accuracy * 100.0,
            s.avg_roi * 100.0,
            s.confidence_drift,
            acc7,
            s.forecast_count
        );
    }
    println!();

    println!("🧭 ROUTING");
    for (instrument, model) in &out.routing {
        println!("   {:<12} → {}", instrument, model);
    }
    println!();
}

pub fn print_leaderboard(board: &[LeaderboardEntry]) {
    if board.is_empty() {
        return;
    }
    println!("⚡ STRATEGY LEADERBOARD (by Sharpe Ratio)");
    println!(
        "{:<6} {:<12} {:<24} {:<10} {:<10} {:<10} {:<10}",
        "Rank", "Asset", "Strategy", "Sharpe", "PnL%", "Max DD%", "Win Rate%"
    );
    println!("{}", "-".repeat(90));
    for e in board {
        println!(
            "{:<6} {:<12} {:<24} {:<10.2} {:<10.2} {:<10.2} {:<10.1}",
            e.rank,
            e.instrument,
            e.strategy_id,
            e.sharpe,
            e.pnl * 100.0,
            e.max_drawdown * 100.0,
            e.hit_rate * 100.0
        );
    }
    println!();
}

pub fn execute(args: &RankArgs) -> Result<()> {
    let dir = args.store.clone().unwrap_or_else(|| "./state".into());
    let store = FileStore::open(&dir)?;
    let history: Vec<ForecastRecord> = store::load_or_default(&store, store::FORECAST_HISTORY)?;
    let engine = RankingEngine::new(args.history_limit.unwrap_or(HISTORY_LIMIT));
    let out = engine.rank(&history, Utc::now());
    println!("Ranked {} forecasts from {}", history.len(), dir.display());
    println!();
    print_rankings(&out);

    let board: Vec<LeaderboardEntry> = store::load_or_default(&store, store::STRATEGY_LEADERBOARD)?;
    print_leaderboard(&board);

    if args.write.unwrap_or(false) {
        store::save(&store, store::MODEL_SCORES, &out.scores)?;
        store::save(&store, store::ROUTING_TABLE, &out.routing)?;
        println!("✅ Model scores and routing saved → {}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    fn rec(token: &str, day: u32, price: f64, model: &str, label: &str) -> ForecastRecord {
        ForecastRecord {
            token: token.into(),
            timestamp: ts(day),
            price,
            forecast: Forecast {
                model_used: model.into(),
                forecast_label: label.into(),
                confidence_score: 0.8,
                rationale: String::new(),
            },
        }
    }

    #[test]
    fn scoring_thresholds() {
        assert_eq!(score_forecast("bullish", 0.02), FULL_HIT);
        assert_eq!(score_forecast("Bearish", -0.02), FULL_HIT);
        assert_eq!(score_forecast("neutral", 0.005), PARTIAL_HIT);
        assert_eq!(score_forecast("neutral", 0.01), PARTIAL_HIT);
        assert_eq!(score_forecast("bullish", 0.01), MISS);
        assert_eq!(score_forecast("bearish", 0.05), MISS);
        assert_eq!(score_forecast("moon", 0.05), MISS);
    }

    #[test]
    fn last_forecast_per_instrument_is_unresolved() {
        let history = vec![
            rec("BTC", 1, 100.0, "a", "bullish"),
            rec("BTC", 2, 103.0, "a", "bullish"),
            rec("ETH", 1, 50.0, "a", "bearish"),
        ];
        let out = RankingEngine::default().rank(&history, ts(3));
        let a = &out.scores["a"];
        assert_eq!(a.forecast_count, 1);
        assert_eq!(a.lifetime_accuracy, 1.0);
        assert!((a.avg_roi - 0.03).abs() < 1e-12);
        assert!(!out.routing.contains_key("ETH"));
    }

    #[test]
    fn model_ids_are_case_folded() {
        let history = vec![
            rec("BTC", 1, 100.0, "GPT-4o", "bullish"),
            rec("BTC", 2, 105.0, "gpt-4o", "bullish"),
            rec("BTC", 3, 110.0, "gpt-4o", "neutral"),
        ];
        let out = RankingEngine::default().rank(&history, ts(4));
        assert_eq!(out.scores.len(), 1);
        assert_eq!(out.scores["gpt-4o"].forecast_count, 2);
    }

    #[test]
    fn rolling_window_excludes_old_forecasts() {
        let history = vec![
            rec("BTC", 1, 100.0, "a", "bearish"),
            rec("BTC", 20, 110.0, "a", "bullish"),
            rec("BTC", 21, 120.0, "a", "bullish"),
        ];
        let out = RankingEngine::default().rank(&history, ts(22));
        let a = &out.scores["a"];
        assert_eq!(a.lifetime_accuracy, 0.5);
        assert_eq!(a.rolling_windows["7d"].accuracy, 1.0);
        assert_eq!(a.rolling_windows["30d"].accuracy, 0.5);

        let later = RankingEngine::default().rank(&history, ts(31) + Duration::days(30));
        assert!(later.scores["a"].rolling_windows.is_empty());
    }

    #[test]
    fn equal_keys_share_dense_rank() {
        let history = vec![
            rec("BTC", 1, 100.0, "a", "bullish"),
            rec("BTC", 1, 100.0, "b", "bullish"),
            rec("BTC", 1, 100.0, "c", "bearish"),
            rec("BTC", 2, 110.0, "z", "neutral"),
        ];
        let out = RankingEngine::default().rank(&history, ts(3));
        assert_eq!(out.scores["a"].acc_rank, 1);
        assert_eq!(out.scores["b"].acc_rank, 1);
        assert_eq!(out.scores["c"].acc_rank, 2);
        // same score and count: smallest id wins
        assert_eq!(out.routing["BTC"], "a");
    }

    #[test]
    fn routing_prefers_more_evidence_on_equal_score() {
        let history = vec![
            rec("BTC", 1, 100.0, "b", "bullish"),
            rec("BTC", 2, 110.0, "b", "bullish"),
            rec("BTC", 2, 110.0, "a", "bullish"),
            rec("BTC", 3, 120.0, "x", "neutral"),
        ];
        let out = RankingEngine::default().rank(&history, ts(4));
        assert_eq!(out.scores["a"].lifetime_accuracy, 1.0);
        assert_eq!(out.scores["b"].lifetime_accuracy, 1.0);
        assert_eq!(out.routing["BTC"], "b");
    }

    #[test]
    fn non_positive_entry_price_is_unresolved() {
        let history = vec![
            rec("BTC", 1, 0.0, "a", "bullish"),
            rec("BTC", 2, 100.0, "a", "bullish"),
        ];
        let out = RankingEngine::default().rank(&history, ts(3));
        assert!(out.scores.is_empty());
        assert!(out.routing.is_empty());
    }

    #[test]
    fn history_is_bounded_to_most_recent() {
        let history: Vec<_> = (1..=10)
            .map(|d| rec("BTC", d, 100.0 + d as f64 * 5.0, "a", "bullish"))
            .collect();
        let out = RankingEngine::new(4).rank(&history, ts(11));
        assert_eq!(out.scores["a"].forecast_count, 3);
    }

    #[test]
    fn leaderboard_orders_by_sharpe_then_pnl() {
        let mk = |inst: &str, sharpe: f64, pnl: f64| BacktestResult {
            instrument: inst.into(),
            strategy_id: "s".into(),
            pnl,
            sharpe,
            max_drawdown: 0.0,
            hit_rate: 0.0,
            trade_count: 0,
            equity_curve: vec![],
        };
        let board = strategy_leaderboard(&[mk("ETH", 1.0, 0.1), mk("BTC", 2.0, 0.0), mk("SOL", 1.0, 0.2)]);
        let order: Vec<_> = board.iter().map(|e| e.instrument.as_str()).collect();
        assert_eq!(order, ["BTC", "SOL", "ETH"]);
        assert_eq!(board[2].rank, 3);
    }

    #[test]
    fn reads_logged_records_with_entry_price_and_naive_time() {
        let json = r#"[
          {"timestamp": "2025-07-06T22:08:05.123456", "token": "ETH",
           "forecast": {"forecast_label": "BULLISH", "confidence_score": 0.8,
                        "rationale": "flows", "model_used": "GPT4",
                        "metadata": {"time_horizon": "medium"}},
           "entry_price": 2500.0},
          {"timestamp": "2025-07-07T22:08:05", "token": "ETH",
           "forecast": {"forecast_label": "NEUTRAL", "model_used": "GPT4"},
           "entry_price": 2600.0}
        ]"#;
        let history: Vec<ForecastRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(history[0].price, 2500.0);
        assert_eq!(
            history[1].timestamp,
            Utc.with_ymd_and_hms(2025, 7, 7, 22, 8, 5).unwrap()
        );

        let out = RankingEngine::default().rank(&history, history[1].timestamp);
        assert_eq!(out.scores["gpt4"].forecast_count, 1);
        assert_eq!(out.scores["gpt4"].lifetime_accuracy, 1.0);

        // what we write reads back unchanged
        let again: Vec<ForecastRecord> =
            serde_json::from_str(&serde_json::to_string(&history).unwrap()).unwrap();
        assert_eq!(again, history);
    }

    #[test]
    fn append_forecast_trims_oldest() {
        let store = MemoryStore::new();
        for d in 1..=5 {
            append_forecast(&store, rec("BTC", d, 100.0, "a", "neutral"), 3).unwrap();
        }
        let history: Vec<ForecastRecord> =
            store::load_or_default(&store, store::FORECAST_HISTORY).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp, ts(3));
    }
}
