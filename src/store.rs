use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{ErrorKind as IoErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const FORECAST_HISTORY: &str = "forecast_history";
pub const MODEL_SCORES: &str = "model_scores";
pub const ROUTING_TABLE: &str = "routing_table";
pub const STRATEGY_WEIGHTS: &str = "strategy_weights";
pub const ACTIVE_STRATEGIES: &str = "active_strategies";
pub const STRATEGY_LEADERBOARD: &str = "strategy_leaderboard";
pub const LAST_CYCLE_REPORT: &str = "last_cycle_report";

/// Durable key-value persistence. Values are JSON text; no multi-key
/// transaction is implied.
pub trait Store: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
}

/// Read and decode `key`. A missing key or an undecodable value yields the
/// default; only a failed read is an error.
pub fn load_or_default<T>(store: &dyn Store, key: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(raw) = store.read(key).with_context(|| format!("read {}", key))? else {
        debug!(key, "no stored value, using default");
        return Ok(T::default());
    };
    match serde_json::from_str(&raw) {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!(key, error = %e, "stored value unreadable, using default");
            Ok(T::default())
        }
    }
}

pub fn save<T: Serialize + ?Sized>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value).with_context(|| format!("encode {}", key))?;
    store.write(key, &raw).with_context(|| format!("write {}", key))
}

/// Non-empty and only `[A-Za-z0-9_-]`, so it is safe as a file stem.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// One `<key>.json` file per key under a directory.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place while holding an exclusive lock on `.store.lock`, so a reader never
/// sees a half-written file.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create store dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if !is_plain_name(key) {
            anyhow::bail!("invalid store key {:?}", key);
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    /// Exclusive lock; held for as long as the returned handle lives.
    fn lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(self.dir.join(".store.lock"))?;
        file.lock_exclusive()?;
        Ok(file)
    }
}

impl Store for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let _guard = self.lock().context("lock store")?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .with_context(|| format!("persist {}", path.display()))?;
        debug!(key, bytes = value.len(), "stored");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn file_store_round_trips_and_reports_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.read(MODEL_SCORES).unwrap(), None);

        let mut weights = BTreeMap::new();
        weights.insert("gpt-4o".to_string(), 1.07);
        save(&store, STRATEGY_WEIGHTS, &weights).unwrap();

        let back: BTreeMap<String, f64> = load_or_default(&store, STRATEGY_WEIGHTS).unwrap();
        assert_eq!(back, weights);
        assert!(dir.path().join("strategy_weights.json").exists());
    }

    #[test]
    fn corrupt_value_falls_back_to_default() {
        let store = MemoryStore::new();
        store.write(ROUTING_TABLE, "{\"BTC\": \"gpt").unwrap();
        let table: BTreeMap<String, String> = load_or_default(&store, ROUTING_TABLE).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn keys_cannot_escape_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.write("../evil", "{}").is_err());
        assert!(store.read("").is_err());
    }

    #[test]
    fn read_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        // a directory where the file should be
        fs::create_dir(dir.path().join("model_scores.json")).unwrap();
        let res: Result<BTreeMap<String, f64>> = load_or_default(&store, MODEL_SCORES);
        assert!(res.is_err());
    }
}
