use chrono::{DateTime, Duration, TimeZone, Utc};
use crypto_selftrain::ranking::{Forecast, ForecastRecord, RankingEngine, append_forecast};
use crypto_selftrain::store::{self, MemoryStore};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

fn rec(day: i64, price: f64, model: &str, label: &str) -> ForecastRecord {
    ForecastRecord {
        token: "ETH".into(),
        timestamp: start() + Duration::days(day),
        price,
        forecast: Forecast {
            model_used: model.into(),
            forecast_label: label.into(),
            confidence_score: 0.7,
            rationale: String::new(),
        },
    }
}

/// Eleven daily observations of a steadily rising price. Model A always
/// calls bullish; model B is right on the first three of the ten that
/// resolve.
fn two_model_history() -> Vec<ForecastRecord> {
    let mut history = vec![];
    for day in 0..11 {
        let price = 100.0 * 1.02f64.powi(day as i32);
        history.push(rec(day, price, "model-a", "bullish"));
        let b_label = if day < 3 { "bullish" } else { "bearish" };
        history.push(rec(day, price, "model-b", b_label));
    }
    history
}

#[test]
fn accurate_model_ranks_first_and_is_routed() {
    let now = start() + Duration::days(12);
    let out = RankingEngine::default().rank(&two_model_history(), now);

    let a = &out.scores["model-a"];
    let b = &out.scores["model-b"];
    assert_eq!(a.forecast_count, 10);
    assert_eq!(b.forecast_count, 10);
    assert!((a.lifetime_accuracy - 1.0).abs() < 1e-12);
    assert!((b.lifetime_accuracy - 0.3).abs() < 1e-12);
    assert_eq!(a.acc_rank, 1);
    assert_eq!(b.acc_rank, 2);
    assert!(a.avg_roi > 0.0 && b.avg_roi < 0.0);
    assert_eq!(a.roi_rank, 1);
    assert_eq!(out.routing.get("ETH").map(String::as_str), Some("model-a"));
}

#[test]
fn ranking_twice_serializes_identically() {
    let history = two_model_history();
    let now = start() + Duration::days(12);
    let engine = RankingEngine::default();
    let first = serde_json::to_string(&engine.rank(&history, now)).unwrap();
    let second = serde_json::to_string(&engine.rank(&history, now)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn a_further_correct_forecast_never_lowers_accuracy() {
    let mut history = two_model_history();
    let now = start() + Duration::days(13);
    let before = RankingEngine::default().rank(&history, now).scores["model-b"].lifetime_accuracy;

    // day 10 bearish call from B stays wrong; add B bullish on day 11 and a
    // higher day-12 price so day 11 resolves in B's favour
    history.push(rec(11, 100.0 * 1.02f64.powi(11), "model-b", "bullish"));
    history.push(rec(12, 100.0 * 1.02f64.powi(12), "model-a", "bullish"));
    let after = RankingEngine::default().rank(&history, now).scores["model-b"].lifetime_accuracy;

    assert!(after >= before, "{} < {}", after, before);
}

#[test]
fn stored_history_feeds_the_ranking_pass() {
    let store = MemoryStore::new();
    for r in two_model_history() {
        append_forecast(&store, r, 300).unwrap();
    }
    let history: Vec<ForecastRecord> = store::load_or_default(&store, store::FORECAST_HISTORY).unwrap();
    assert_eq!(history.len(), 22);

    let out = RankingEngine::default().rank(&history, start() + Duration::days(12));
    assert_eq!(out.routing["ETH"], "model-a");
}
