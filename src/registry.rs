use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::backtest::{BacktestResult, BacktestRunner};
use crate::error::EngineError;
use crate::ohlc::PriceSeries;
use crate::strategy::{Strategy, StrategySpec};

/// Floors below which the active strategy is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayThresholds {
    pub min_sharpe: f64,
    /// Magnitude; drawdowns are stored as negative fractions.
    pub max_drawdown: f64,
    pub min_hit_rate: f64,
}

impl Default for DecayThresholds {
    fn default() -> Self {
        Self {
            min_sharpe: 0.5,
            max_drawdown: 0.25,
            min_hit_rate: 0.3,
        }
    }
}

impl DecayThresholds {
    /// True when `last` is missing or breaches any floor.
    pub fn is_due(&self, last: Option<&BacktestResult>) -> bool {
        match last {
            None => true,
            Some(r) => {
                r.sharpe < self.min_sharpe
                    || r.max_drawdown.abs() > self.max_drawdown
                    || r.hit_rate < self.min_hit_rate
            }
        }
    }
}

#[derive(Clone)]
pub struct Candidate {
    pub id: String,
    pub spec: StrategySpec,
    pub strategy: Arc<dyn Strategy>,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .finish()
    }
}

impl Candidate {
    /// Build (and for generated specs, validate) a runnable candidate.
    pub fn build(id: impl Into<String>, spec: StrategySpec) -> Result<Self, EngineError> {
        let id = id.into();
        let strategy = spec.build(&id)?;
        Ok(Self { id, spec, strategy })
    }

    pub fn with_strategy(
        id: impl Into<String>,
        spec: StrategySpec,
        strategy: Arc<dyn Strategy>,
    ) -> Self {
        Self {
            id: id.into(),
            spec,
            strategy,
        }
    }
}

/// Persisted form of one instrument's slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    pub active: String,
    pub candidates: BTreeMap<String, StrategySpec>,
    #[serde(default)]
    pub last_result: Option<BacktestResult>,
}

#[derive(Debug, Clone)]
struct Slot {
    candidates: Vec<Candidate>,
    active: String,
    last_result: Option<BacktestResult>,
}

impl Slot {
    fn with_builtins() -> Self {
        let candidates = StrategySpec::builtin_candidates()
            .into_iter()
            .filter_map(|(id, spec)| Candidate::build(id, spec).ok())
            .collect();
        Self {
            candidates,
            active: "hold".to_string(),
            last_result: None,
        }
    }

    fn find(&self, id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }
}

/// Candidate strategies per instrument and the one currently active.
///
/// Readers take cheap `Arc` snapshots. The active strategy only changes
/// under the write lock, so a concurrent reader sees either the old or the
/// new strategy. Long operations (fetch, backtest, regeneration) are
/// serialized per instrument via [`StrategyRegistry::instrument_lock`].
#[derive(Default)]
pub struct StrategyRegistry {
    slots: RwLock<HashMap<String, Slot>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Critical section for one instrument.
    pub fn instrument_lock(&self, instrument: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Register the built-in candidates for an unseen instrument.
    pub fn ensure_instrument(&self, instrument: &str) {
        if self.read_slots().contains_key(instrument) {
            return;
        }
        self.write_slots()
            .entry(instrument.to_string())
            .or_insert_with(Slot::with_builtins);
    }

    pub fn instruments(&self) -> Vec<String> {
        let mut v: Vec<String> = self.read_slots().keys().cloned().collect();
        v.sort();
        v
    }

    pub fn candidates(&self, instrument: &str) -> Vec<Candidate> {
        self.read_slots()
            .get(instrument)
            .map(|s| s.candidates.clone())
            .unwrap_or_default()
    }

    pub fn active(&self, instrument: &str) -> Option<Candidate> {
        let slots = self.read_slots();
        let slot = slots.get(instrument)?;
        slot.find(&slot.active).cloned()
    }

    pub fn last_result(&self, instrument: &str) -> Option<BacktestResult> {
        self.read_slots()
            .get(instrument)
            .and_then(|s| s.last_result.clone())
    }

    pub fn active_results(&self) -> Vec<BacktestResult> {
        let slots = self.read_slots();
        let mut v: Vec<BacktestResult> = slots
            .values()
            .filter_map(|s| s.last_result.clone())
            .collect();
        v.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        v
    }

    /// Make the best of this cycle's candidate results active: highest
    /// Sharpe, then pnl, then smallest id. With no results the slot is left
    /// untouched.
    pub fn record_results(&self, instrument: &str, results: &[BacktestResult]) -> Option<String> {
        let best = results.iter().min_by(|a, b| {
            b.sharpe
                .total_cmp(&a.sharpe)
                .then_with(|| b.pnl.total_cmp(&a.pnl))
                .then_with(|| a.strategy_id.cmp(&b.strategy_id))
        })?;

        let mut slots = self.write_slots();
        let slot = slots
            .entry(instrument.to_string())
            .or_insert_with(Slot::with_builtins);
        slot.find(&best.strategy_id)?;
        if slot.active != best.strategy_id {
            info!(
                instrument,
                from = %slot.active,
                to = %best.strategy_id,
                "active strategy changed"
            );
        }
        slot.active = best.strategy_id.clone();
        slot.last_result = Some(best.clone());
        Some(best.strategy_id.clone())
    }

    pub fn is_due(&self, instrument: &str, thresholds: &DecayThresholds) -> bool {
        thresholds.is_due(self.last_result(instrument).as_ref())
    }

    /// Backtest a regenerated candidate on `series` and, only if that
    /// succeeds, install it as the instrument's generated candidate and make
    /// it active. On any error the slot is unchanged.
    pub fn try_regenerate(
        &self,
        instrument: &str,
        candidate: Candidate,
        series: &PriceSeries,
        runner: &BacktestRunner,
    ) -> Result<BacktestResult, EngineError> {
        let result = match runner.run(candidate.strategy.as_ref(), series) {
            Ok(r) => r,
            Err(e) => {
                warn!(instrument, candidate = %candidate.id, error = %e, "regenerated strategy rejected");
                return Err(e);
            }
        };

        let mut slots = self.write_slots();
        let slot = slots
            .entry(instrument.to_string())
            .or_insert_with(Slot::with_builtins);
        slot.candidates
            .retain(|c| !c.spec.is_generated() && c.id != candidate.id);
        info!(instrument, from = %slot.active, to = %candidate.id, "swapped in regenerated strategy");
        slot.active = candidate.id.clone();
        slot.candidates.push(candidate);
        slot.last_result = Some(result.clone());
        Ok(result)
    }

    pub fn snapshot(&self) -> BTreeMap<String, SlotState> {
        self.read_slots()
            .iter()
            .map(|(instrument, slot)| {
                (
                    instrument.clone(),
                    SlotState {
                        active: slot.active.clone(),
                        candidates: slot
                            .candidates
                            .iter()
                            .map(|c| (c.id.clone(), c.spec.clone()))
                            .collect(),
                        last_result: slot.last_result.clone(),
                    },
                )
            })
            .collect()
    }

    /// Rebuild from persisted state. Candidates that no longer build are
    /// dropped; built-ins are always present; a missing active id falls back
    /// to `hold`.
    pub fn restore(states: BTreeMap<String, SlotState>) -> Self {
        let registry = Self::new();
        {
            let mut slots = registry.write_slots();
            for (instrument, state) in states {
                let mut slot = Slot::with_builtins();
                for (id, spec) in state.candidates {
                    if slot.find(&id).is_some() {
                        continue;
                    }
                    match Candidate::build(id.clone(), spec) {
                        Ok(c) => slot.candidates.push(c),
                        Err(e) => warn!(instrument, candidate = %id, error = %e, "dropping stored candidate"),
                    }
                }
                if slot.find(&state.active).is_some() {
                    slot.active = state.active;
                    slot.last_result = state.last_result;
                }
                slots.insert(instrument, slot);
            }
        }
        registry
    }
}
