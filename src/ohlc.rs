use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tempfile::NamedTempFile;

use crate::error::EngineError;

/// One OHLCV record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Convenience constructor for daily close-only data.
    pub fn daily(date: NaiveDate, close: f64) -> Self {
        Self {
            timestamp: date_to_utc(date),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }
}

/// Ordered bars for one instrument. Timestamps are strictly ascending and
/// closes are finite and positive; the constructor enforces both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSeries {
    instrument: String,
    bars: Vec<Bar>,
}

impl PriceSeries {
    pub fn new(instrument: impl Into<String>, bars: Vec<Bar>) -> Result<Self, EngineError> {
        let instrument = instrument.into();
        for (i, bar) in bars.iter().enumerate() {
            if !bar.close.is_finite() || bar.close <= 0.0 {
                return Err(EngineError::MalformedSeries(format!(
                    "{}: close {} at row {} is not a positive number",
                    instrument, bar.close, i
                )));
            }
            if i > 0 && bar.timestamp <= bars[i - 1].timestamp {
                return Err(EngineError::MalformedSeries(format!(
                    "{}: timestamp {} at row {} is not after {}",
                    instrument,
                    bar.timestamp,
                    i,
                    bars[i - 1].timestamp
                )));
            }
        }
        Ok(Self { instrument, bars })
    }

    /// Build a series from closes only, one bar per day starting at `start`.
    pub fn from_closes(
        instrument: impl Into<String>,
        start: NaiveDate,
        closes: &[f64],
    ) -> Result<Self, EngineError> {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar::daily(start + chrono::Duration::days(i as i64), *c))
            .collect();
        Self::new(instrument, bars)
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn opens(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.open).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.bars.iter().map(|b| b.timestamp).collect()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }

    /// Keep only bars within `[from, to]`.
    pub fn window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            instrument: self.instrument.clone(),
            bars: self
                .bars
                .iter()
                .filter(|b| b.timestamp >= from && b.timestamp <= to)
                .copied()
                .collect(),
        }
    }
}

/// CSV row as written by exporters: either a `date` or a `timestamp` column,
/// optional open/high/low/volume.
#[derive(Debug, Clone, Deserialize)]
struct Row {
    #[serde(default)]
    date: Option<NaiveDate>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
}

pub fn date_to_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Parse RFC 3339, a naive ISO datetime (taken as UTC), `YYYY-MM-DD`, or a
/// unix timestamp in seconds or milliseconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date_to_utc(d));
    }
    if let Ok(n) = raw.parse::<i64>() {
        // anything past year 2286 in seconds is really milliseconds
        let dt = if n.abs() > 9_999_999_999 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
        return dt.with_context(|| format!("timestamp {} out of range", n));
    }
    bail!("unrecognized timestamp '{}'", raw)
}

pub fn read_series(instrument: &str, path: &Path) -> Result<PriceSeries> {
    let mut rdr = ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut bars = Vec::new();

    for (i, rec) in rdr.deserialize::<Row>().enumerate() {
        let r = rec.with_context(|| format!("{} row {}", path.display(), i + 1))?;
        let timestamp = match (&r.timestamp, r.date) {
            (Some(ts), _) if !ts.is_empty() => parse_timestamp(ts)?,
            (_, Some(d)) => date_to_utc(d),
            _ => bail!("{} row {}: missing date/timestamp", path.display(), i + 1),
        };
        bars.push(Bar {
            timestamp,
            open: r.open.unwrap_or(r.close),
            high: r.high.unwrap_or(r.close),
            low: r.low.unwrap_or(r.close),
            close: r.close,
            volume: r.volume.unwrap_or(0.0),
        });
    }
    bars.sort_by_key(|b| b.timestamp);
    Ok(PriceSeries::new(instrument, bars)?)
}

/// Write a series to CSV via temp file + rename so readers never see a
/// half-written file.
pub fn save_series(series: &PriceSeries, path: &Path) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).context("create series dir")?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let mut wtr = WriterBuilder::new().from_writer(tmp.as_file_mut());
        wtr.write_record(["timestamp", "open", "high", "low", "close", "volume"])?;
        for b in series.bars() {
            wtr.write_record(&[
                b.timestamp.to_rfc3339(),
                format!("{:.8}", b.open),
                format!("{:.8}", b.high),
                format!("{:.8}", b.low),
                format!("{:.8}", b.close),
                format!("{:.4}", b.volume),
            ])?;
        }
        wtr.flush()?;
    }
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn rejects_unsorted_or_duplicate_timestamps() {
        let a = Bar::daily(d("2024-01-02"), 10.0);
        let b = Bar::daily(d("2024-01-01"), 11.0);
        assert!(matches!(
            PriceSeries::new("X", vec![a, b]),
            Err(EngineError::MalformedSeries(_))
        ));
        assert!(PriceSeries::new("X", vec![a, a]).is_err());
    }

    #[test]
    fn rejects_non_positive_close() {
        let err = PriceSeries::from_closes("X", d("2024-01-01"), &[1.0, 0.0]).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn parses_timestamp_formats() {
        let a = parse_timestamp("2024-03-01").unwrap();
        let b = parse_timestamp("2024-03-01T00:00:00Z").unwrap();
        let c = parse_timestamp("1709251200").unwrap();
        let ms = parse_timestamp("1709251200000").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(c, ms);
        assert!(parse_timestamp("yesterday").is_err());

        let naive = parse_timestamp("2024-03-01T12:30:00.250000").unwrap();
        assert_eq!(naive, parse_timestamp("2024-03-01T12:30:00.25Z").unwrap());
        assert_eq!(
            parse_timestamp("2024-03-01 12:30:00").unwrap(),
            parse_timestamp("2024-03-01T12:30:00Z").unwrap()
        );
    }

    #[test]
    fn reads_date_column_csv_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETH.csv");
        fs::write(
            &path,
            "date,open,high,low,close\n2024-01-02,2,3,1,2.5\n2024-01-01,1,2,0.5,1.5\n",
        )
        .unwrap();
        let s = read_series("ETH", &path).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.closes(), vec![1.5, 2.5]);
        assert_eq!(s.volumes(), vec![0.0, 0.0]);
    }

    #[test]
    fn save_then_read_keeps_bars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("SOL.csv");
        let s = PriceSeries::from_closes("SOL", d("2024-05-01"), &[10.0, 11.0, 12.5]).unwrap();
        save_series(&s, &path).unwrap();
        let back = read_series("SOL", &path).unwrap();
        assert_eq!(back.timestamps(), s.timestamps());
        assert_eq!(back.closes(), s.closes());
    }
}
