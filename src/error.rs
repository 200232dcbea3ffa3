use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures a single instrument can hit during backtesting, ranking or
/// regeneration. Only `Store` is fatal for a whole training cycle.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("signal length mismatch: strategy returned {signals} signals for {prices} bars")]
    SignalLengthMismatch { prices: usize, signals: usize },

    #[error("strategy execution failed: {0}")]
    StrategyExecution(String),

    #[error("insufficient data: {len} bars, need at least {min}")]
    InsufficientData { len: usize, min: usize },

    #[error("price unavailable for {instrument}: {reason}")]
    PriceUnavailable { instrument: String, reason: String },

    #[error("{operation} timed out after {secs}s")]
    DependencyTimeout { operation: String, secs: u64 },

    #[error("invalid generated strategy: {0}")]
    InvalidGeneratedStrategy(String),

    #[error("malformed price series: {0}")]
    MalformedSeries(String),

    #[error("store error: {0}")]
    Store(String),
}

/// Flat discriminant of [`EngineError`], used for per-cycle counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SignalLengthMismatch,
    StrategyExecutionError,
    InsufficientData,
    PriceUnavailable,
    DependencyTimeout,
    InvalidGeneratedStrategy,
    MalformedSeries,
    Store,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::SignalLengthMismatch { .. } => ErrorKind::SignalLengthMismatch,
            EngineError::StrategyExecution(_) => ErrorKind::StrategyExecutionError,
            EngineError::InsufficientData { .. } => ErrorKind::InsufficientData,
            EngineError::PriceUnavailable { .. } => ErrorKind::PriceUnavailable,
            EngineError::DependencyTimeout { .. } => ErrorKind::DependencyTimeout,
            EngineError::InvalidGeneratedStrategy(_) => ErrorKind::InvalidGeneratedStrategy,
            EngineError::MalformedSeries(_) => ErrorKind::MalformedSeries,
            EngineError::Store(_) => ErrorKind::Store,
        }
    }

    /// Skips are expected outcomes that leave the instrument for next cycle.
    pub fn is_skip(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InsufficientData | ErrorKind::PriceUnavailable | ErrorKind::DependencyTimeout
        )
    }

    pub fn price_unavailable(instrument: &str, reason: impl ToString) -> Self {
        EngineError::PriceUnavailable {
            instrument: instrument.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::SignalLengthMismatch => "SignalLengthMismatch",
            ErrorKind::StrategyExecutionError => "StrategyExecutionError",
            ErrorKind::InsufficientData => "InsufficientData",
            ErrorKind::PriceUnavailable => "PriceUnavailable",
            ErrorKind::DependencyTimeout => "DependencyTimeout",
            ErrorKind::InvalidGeneratedStrategy => "InvalidGeneratedStrategy",
            ErrorKind::MalformedSeries => "MalformedSeries",
            ErrorKind::Store => "Store",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_kinds_are_not_failures() {
        assert!(EngineError::InsufficientData { len: 3, min: 5 }.is_skip());
        assert!(EngineError::price_unavailable("BTC", "no file").is_skip());
        assert!(
            EngineError::DependencyTimeout {
                operation: "price fetch".into(),
                secs: 30
            }
            .is_skip()
        );
        assert!(!EngineError::StrategyExecution("boom".into()).is_skip());
        assert!(
            !EngineError::SignalLengthMismatch {
                prices: 10,
                signals: 9
            }
            .is_skip()
        );
    }

    #[test]
    fn kind_names_match_taxonomy() {
        assert_eq!(
            EngineError::StrategyExecution("x".into()).kind().to_string(),
            "StrategyExecutionError"
        );
        assert_eq!(ErrorKind::DependencyTimeout.to_string(), "DependencyTimeout");
    }
}
