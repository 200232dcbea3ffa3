use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{env, fmt, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::backtest::BacktestResult;
use crate::indicator::{lift, pct_change, sma};
use crate::ohlc::PriceSeries;
use crate::rules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Sideways,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trend::Up => "up",
            Trend::Down => "down",
            Trend::Sideways => "sideways",
        })
    }
}

const VOL_WINDOW: usize = 30;
const TREND_MA: usize = 20;
const TREND_LOOKBACK: usize = 5;
const TREND_BAND: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    /// Population stdev of daily returns over the last 30 bars.
    pub volatility: f64,
    pub trend: Trend,
    pub last_close: f64,
}

impl MarketConditions {
    /// `None` until there are enough bars for the trend MA and its slope.
    pub fn from_series(series: &PriceSeries) -> Option<Self> {
        let closes = series.closes();
        if closes.len() < TREND_MA + TREND_LOOKBACK {
            return None;
        }
        let tail = &closes[closes.len().saturating_sub(VOL_WINDOW + 1)..];
        let rets = pct_change(tail);
        let rets = &rets[1..];
        let mean = rets.iter().sum::<f64>() / rets.len() as f64;
        let volatility =
            (rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rets.len() as f64).sqrt();

        let ma = sma(&lift(&closes), TREND_MA);
        let now = ma[ma.len() - 1]?;
        let before = ma[ma.len() - 1 - TREND_LOOKBACK]?;
        let slope = (now - before) / before;
        let trend = if slope > TREND_BAND {
            Trend::Up
        } else if slope < -TREND_BAND {
            Trend::Down
        } else {
            Trend::Sideways
        };

        Some(Self {
            volatility,
            trend,
            last_close: *closes.last()?,
        })
    }
}

/// What a producer is told about the instrument it is replacing a strategy
/// for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerContext {
    pub metrics: Option<BacktestResult>,
    pub market: Option<MarketConditions>,
}

/// Source of new strategy rule text. Output is untrusted and must be
/// validated by the caller.
#[async_trait]
pub trait StrategyProducer: Send + Sync {
    fn name(&self) -> &str {
        "producer"
    }

    async fn propose(&self, instrument: &str, context: &ProducerContext) -> Result<String>;
}

const RULE_LANGUAGE: &str = r#"Write the strategy in this line-based rule language, nothing else:
  # comment
  let <name> = <expr>
  long: <condition>
  short: <condition>
Inputs: open high low close volume. Functions (period is an integer literal 1..500):
  sma(x,n) ema(x,n) rsi(x,n) roc(x,n) std(x,n) lag(x,n) highest(x,n) lowest(x,n)
Operators: + - * / > < >= <= == != and or not, parentheses.
At least one of long:/short: is required; at most one of each. Bars where both hold are flat."#;

pub fn build_prompt(instrument: &str, context: &ProducerContext) -> String {
    let perf = match &context.metrics {
        Some(m) => format!(
            "Sharpe: {:.3}, Max Drawdown: {:.2}%, Hit Rate: {:.1}%, PnL: {:.2}%, Trades: {}",
            m.sharpe,
            m.max_drawdown * 100.0,
            m.hit_rate * 100.0,
            m.pnl * 100.0,
            m.trade_count
        ),
        None => "no backtest yet".to_string(),
    };
    let market = match &context.market {
        Some(c) => format!(
            "Volatility (30d stdev of daily returns): {:.4}, Dominant Trend: {}, Last Close: {:.4}",
            c.volatility, c.trend, c.last_close
        ),
        None => "unknown".to_string(),
    };
    format!(
        r#"You are a crypto strategy engineer. The current strategy for {instrument} is underperforming.
PERFORMANCE: {perf}
MARKET: {market}

Create a new strategy with clear long/short logic, lower drawdown and a better hit rate.

{RULE_LANGUAGE}

Only return the rules."#
    )
}

/// Chat-completions producer over raw `reqwest`.
#[derive(Debug, Clone)]
pub struct OpenAiProducer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    name: String,
}

impl OpenAiProducer {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let model = model.into();
        Ok(Self {
            client,
            api_key: api_key.into(),
            name: format!("openai:{}", model),
            model,
            base_url: "https://api.openai.com/v1".to_string(),
        })
    }

    /// `None` when `OPENAI_API_KEY` is not set.
    pub fn from_env(model: &str) -> Result<Option<Self>> {
        match env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Some(Self::new(key, model)?)),
            _ => Ok(None),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl StrategyProducer for OpenAiProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn propose(&self, instrument: &str, context: &ProducerContext) -> Result<String> {
        let request_body = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": build_prompt(instrument, context)
                }
            ],
            "temperature": 0.4,
            "max_tokens": 800
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, error_text);
        }

        let response_json: serde_json::Value = response.json().await?;
        let content = response_json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| anyhow!("no content in OpenAI response"))?;

        let body = rules::extract_source(content).trim();
        if body.is_empty() {
            bail!("empty OpenAI response for {}", instrument);
        }
        Ok(body.to_string())
    }
}

/// Offline producer: picks a rule set from the market regime and tunes it
/// from the failing metrics. Always returns the same text for the same
/// context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateProducer;

#[async_trait]
impl StrategyProducer for TemplateProducer {
    fn name(&self) -> &str {
        "template"
    }

    async fn propose(&self, instrument: &str, context: &ProducerContext) -> Result<String> {
        let trend = context.market.map(|m| m.trend).unwrap_or(Trend::Sideways);
        let m = context.metrics.as_ref();
        // slower averages when the last strategy whipsawed
        let (fast, slow) = match m {
            Some(m) if m.hit_rate < 0.3 => (10, 40),
            _ => (5, 20),
        };
        let deep_drawdown = m.is_some_and(|m| m.max_drawdown.abs() > 0.25);

        let mut lines = vec![
            format!("# {} regime template for {}", trend, instrument),
            format!("let fast = ema(close, {})", fast),
            format!("let slow = sma(close, {})", slow),
            "let mom = rsi(close, 14)".to_string(),
        ];
        if deep_drawdown {
            lines.push("let calm = std(close, 20) < sma(std(close, 20), 20) * 1.2".to_string());
        }
        let guard = if deep_drawdown { " and calm" } else { "" };
        match trend {
            Trend::Up => {
                lines.push(format!("long: fast > slow and mom < 70{}", guard));
            }
            Trend::Down => {
                lines.push(format!("short: fast < slow and mom > 30{}", guard));
            }
            Trend::Sideways => {
                lines.push(format!("long: mom < 30{}", guard));
                lines.push(format!("short: mom > 70{}", guard));
            }
        }
        Ok(lines.join("\n"))
    }
}

/// Tries each producer in order and returns the first output that compiles.
#[derive(Clone)]
pub struct FallbackProducer {
    tiers: Vec<Arc<dyn StrategyProducer>>,
}

impl FallbackProducer {
    pub fn new(tiers: Vec<Arc<dyn StrategyProducer>>) -> Self {
        Self { tiers }
    }
}

#[async_trait]
impl StrategyProducer for FallbackProducer {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn propose(&self, instrument: &str, context: &ProducerContext) -> Result<String> {
        let mut failures = Vec::new();
        for tier in &self.tiers {
            match tier.propose(instrument, context).await {
                Ok(text) => match rules::compile(&text) {
                    Ok(_) => {
                        info!(instrument, producer = tier.name(), "producer answered");
                        return Ok(text);
                    }
                    Err(e) => {
                        warn!(instrument, producer = tier.name(), error = %e, "producer output does not compile");
                        failures.push(format!("{}: {}", tier.name(), e));
                    }
                },
                Err(e) => {
                    warn!(instrument, producer = tier.name(), error = %e, "producer failed");
                    failures.push(format!("{}: {}", tier.name(), e));
                }
            }
        }
        bail!("all producers failed: {}", failures.join("; "))
    }
}
