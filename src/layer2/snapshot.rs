// Candle Snapshot - warm-start persistence for the CandleStore
// JSON file per process: ring-buffer contents and recent ticks per symbol

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::{Candle, Tick, Timeframe};
use crate::layer2::candle_store::CandleStore;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub ticks: Vec<Tick>,
    pub m1: Vec<Candle>,
    pub m5: Vec<Candle>,
    pub m15: Vec<Candle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub version: u32,
    pub saved_at: i64,
    pub symbols: BTreeMap<String, SymbolSnapshot>,
}

impl CandleSnapshot {
    /// Capture sealed buffers of every symbol. Forming bars are not included.
    pub fn capture(store: &CandleStore, saved_at: i64) -> Self {
        let mut symbols = BTreeMap::new();
        for symbol in store.symbols() {
            let Some(handle) = store.get(&symbol) else { continue };
            let guard = handle.read();
            symbols.insert(
                symbol,
                SymbolSnapshot {
                    ticks: guard.ticks().iter().cloned().collect(),
                    m1: guard.recent(Timeframe::M1, usize::MAX),
                    m5: guard.recent(Timeframe::M5, usize::MAX),
                    m15: guard.recent(Timeframe::M15, usize::MAX),
                },
            );
        }
        Self {
            version: SNAPSHOT_VERSION,
            saved_at,
            symbols,
        }
    }

    /// Load every symbol into the store, replacing what it held
    pub fn restore_into(self, store: &CandleStore) -> usize {
        let count = self.symbols.len();
        for (symbol, snap) in self.symbols {
            let handle = store.handle(&symbol);
            handle.write().restore(snap.ticks, snap.m1, snap.m5, snap.m15);
        }
        count
    }
}

// ============================================================================
// Snapshot Store
// ============================================================================

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write atomically: temp file in the same directory, then rename over the target
    pub fn save(&self, store: &CandleStore, saved_at: i64) -> Result<usize, SnapshotError> {
        let snapshot = CandleSnapshot::capture(store, saved_at);
        let count = snapshot.symbols.len();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec(&snapshot)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        info!(path = %self.path.display(), symbols = count, "Candle snapshot saved");
        Ok(count)
    }

    pub fn load(&self) -> Result<Option<CandleSnapshot>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read(&self.path)?;
        let snapshot: CandleSnapshot = serde_json::from_slice(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(Some(snapshot))
    }

    /// Warm-start the store. Missing or unreadable snapshots leave it empty.
    pub fn warm_start(&self, store: &CandleStore) -> usize {
        match self.load() {
            Ok(Some(snapshot)) => {
                let saved_at = snapshot.saved_at;
                let restored = snapshot.restore_into(store);
                info!(path = %self.path.display(), symbols = restored, saved_at, "Warm-started from snapshot");
                restored
            }
            Ok(None) => {
                info!(path = %self.path.display(), "No candle snapshot, starting empty");
                0
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable candle snapshot");
                0
            }
        }
    }
}
