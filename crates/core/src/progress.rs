//! In-memory registry of batch progress, keyed by counter.
//!
//! A single reader/writer lock guards the whole map. Each record is mutated
//! only by the worker that owns its counter; status and download handlers
//! read snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::asset::is_result_file;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("target not found for counter {0}")]
    NotFound(u64),
    #[error("batch {0} is still in progress")]
    NotReady(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressRecord {
    pub counter: u64,
    pub total: usize,
    pub current: usize,
    /// `None` exactly while the batch is in flight.
    pub output_file: Option<PathBuf>,
}

impl ProgressRecord {
    pub fn is_complete(&self) -> bool {
        self.output_file.is_some()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    records: BTreeMap<u64, ProgressRecord>,
    last_counter: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next unused counter. Counters are never reused within a process.
    pub fn allocate_counter(&self) -> u64 {
        let mut state = self.write();
        state.last_counter += 1;
        state.last_counter
    }

    pub fn start(&self, counter: u64, total: usize) {
        self.write().records.insert(
            counter,
            ProgressRecord {
                counter,
                total,
                current: 0,
                output_file: None,
            },
        );
    }

    /// Count one finished item. `current` never exceeds `total`.
    pub fn advance(&self, counter: u64) {
        if let Some(record) = self.write().records.get_mut(&counter) {
            if record.current < record.total {
                record.current += 1;
            }
        }
    }

    pub fn complete(&self, counter: u64, output_file: PathBuf) {
        if let Some(record) = self.write().records.get_mut(&counter) {
            record.output_file = Some(output_file);
        }
    }

    pub fn lookup(&self, counter: u64) -> Result<ProgressRecord, RegistryError> {
        self.read()
            .records
            .get(&counter)
            .cloned()
            .ok_or(RegistryError::NotFound(counter))
    }

    /// Path of a completed batch's artifact.
    pub fn output_file(&self, counter: u64) -> Result<PathBuf, RegistryError> {
        self.lookup(counter)?
            .output_file
            .ok_or(RegistryError::NotReady(counter))
    }

    pub fn remove(&self, counter: u64) -> Option<ProgressRecord> {
        self.write().records.remove(&counter)
    }

    /// All records ordered by counter.
    pub fn snapshot(&self) -> Vec<ProgressRecord> {
        self.read().records.values().cloned().collect()
    }

    /// Drop completed records whose artifact has disappeared from disk.
    pub fn reconcile(&self) -> usize {
        let missing: Vec<u64> = self
            .snapshot()
            .into_iter()
            .filter(|record| {
                record
                    .output_file
                    .as_deref()
                    .is_some_and(|path| !path.exists())
            })
            .map(|record| record.counter)
            .collect();

        if missing.is_empty() {
            return 0;
        }

        let mut state = self.write();
        for counter in &missing {
            state.records.remove(counter);
            debug!(counter, "Removed progress record with missing artifact");
        }
        missing.len()
    }

    /// Register one completed record per artifact already present in `dir`.
    ///
    /// Files are taken in filename order and numbered after the highest
    /// counter handed out so far. A missing directory seeds nothing.
    pub fn seed_from_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read output directory: {}", dir.display()))?
            .flatten()
            .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
            .filter(|entry| is_result_file(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.path())
            .collect();
        found.sort();

        let mut state = self.write();
        for path in &found {
            state.last_counter += 1;
            let counter = state.last_counter;
            state.records.insert(
                counter,
                ProgressRecord {
                    counter,
                    total: 0,
                    current: 0,
                    output_file: Some(path.clone()),
                },
            );
        }

        info!(
            seeded = found.len(),
            output_dir = %dir.display(),
            "Seeded progress registry from existing artifacts"
        );
        Ok(found.len())
    }
}

/// Progress sink handed to the item loop. The synchronous fast path runs
/// untracked.
#[derive(Debug, Clone)]
pub enum Tracking {
    Tracked {
        registry: ProgressRegistry,
        counter: u64,
    },
    Untracked,
}

impl Tracking {
    pub fn advance(&self) {
        match self {
            Self::Tracked { registry, counter } => registry.advance(*counter),
            Self::Untracked => {}
        }
    }
}
