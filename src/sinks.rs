//! Persistence sinks for vitals and sleep records
//!
//! Both sinks are idempotent: vitals on `(side, timestamp)`, sleep records on
//! `(side, entered_bed_at)`. A repeated key is ignored, so replaying a range
//! that was already persisted is harmless.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;

use crate::error::EngineError;
use crate::types::{Side, SleepRecord, StoredVitals, VitalsRecord};

type VitalsKey = (Side, i64);
type SleepKey = (Side, DateTime<Utc>);

fn vitals_key(v: &StoredVitals) -> VitalsKey {
    (v.side, v.timestamp)
}

fn sleep_key(r: &SleepRecord) -> SleepKey {
    (r.side, r.entered_bed_at)
}

fn lock_error<T>(err: std::sync::PoisonError<T>) -> EngineError {
    EngineError::Sink(err.to_string())
}

/// Destination for periodic vitals
pub trait VitalsSink: Send + Sync {
    /// Persist `record` floored to integers. Returns `false` when a record
    /// with the same side and timestamp already exists.
    fn insert(&self, record: &VitalsRecord) -> Result<bool, EngineError>;
}

/// Destination for sleep sessions
pub trait SleepRecordSink: Send + Sync {
    /// Persist `records`, skipping already-stored sessions. Returns the
    /// number newly written.
    fn insert_many(&self, records: &[SleepRecord]) -> Result<usize, EngineError>;
}

#[derive(Debug, Default)]
pub struct MemoryVitalsSink {
    rows: Mutex<BTreeMap<VitalsKey, StoredVitals>>,
}

impl MemoryVitalsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows ordered by side then timestamp
    pub fn rows(&self) -> Vec<StoredVitals> {
        self.rows
            .lock()
            .map(|rows| rows.values().copied().collect())
            .unwrap_or_default()
    }
}

impl VitalsSink for MemoryVitalsSink {
    fn insert(&self, record: &VitalsRecord) -> Result<bool, EngineError> {
        let stored = record.floored();
        let mut rows = self.rows.lock().map_err(lock_error)?;
        if rows.contains_key(&vitals_key(&stored)) {
            return Ok(false);
        }
        rows.insert(vitals_key(&stored), stored);
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemorySleepSink {
    records: Mutex<BTreeMap<SleepKey, SleepRecord>>,
}

impl MemorySleepSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SleepRecord> {
        self.records
            .lock()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl SleepRecordSink for MemorySleepSink {
    fn insert_many(&self, records: &[SleepRecord]) -> Result<usize, EngineError> {
        let mut stored = self.records.lock().map_err(lock_error)?;
        let mut written = 0;
        for record in records {
            if !stored.contains_key(&sleep_key(record)) {
                stored.insert(sleep_key(record), record.clone());
                written += 1;
            }
        }
        Ok(written)
    }
}

/// Append-only newline-delimited JSON file with a key index
#[derive(Debug)]
struct NdjsonLog<K> {
    path: PathBuf,
    file: File,
    seen: HashSet<K>,
}

impl<K: std::hash::Hash + Eq> NdjsonLog<K> {
    /// Open `path` for appending, indexing the keys of existing lines
    fn open<T: DeserializeOwned>(path: &Path, key: impl Fn(&T) -> K) -> Result<Self, EngineError> {
        let mut seen = HashSet::new();
        if path.is_file() {
            let reader = BufReader::new(File::open(path)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(&line) {
                    Ok(row) => {
                        seen.insert(key(&row));
                    }
                    Err(err) => warn!("{}:{}: skipping unreadable row: {}", path.display(), number + 1, err),
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("opened {} with {} existing rows", path.display(), seen.len());
        Ok(Self {
            path: path.to_path_buf(),
            file,
            seen,
        })
    }

    fn append<T: serde::Serialize>(&mut self, key: K, row: &T) -> Result<bool, EngineError> {
        if self.seen.contains(&key) {
            return Ok(false);
        }
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.seen.insert(key);
        Ok(true)
    }
}

/// Vitals appended to an NDJSON file
#[derive(Debug)]
pub struct NdjsonVitalsSink {
    log: Mutex<NdjsonLog<VitalsKey>>,
}

impl NdjsonVitalsSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let log = NdjsonLog::open(path.as_ref(), vitals_key)?;
        Ok(Self {
            log: Mutex::new(log),
        })
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.log.lock().ok().map(|log| log.path.clone())
    }
}

impl VitalsSink for NdjsonVitalsSink {
    fn insert(&self, record: &VitalsRecord) -> Result<bool, EngineError> {
        let stored = record.floored();
        let mut log = self.log.lock().map_err(lock_error)?;
        log.append(vitals_key(&stored), &stored)
    }
}

/// Sleep records appended to an NDJSON file
#[derive(Debug)]
pub struct NdjsonSleepSink {
    log: Mutex<NdjsonLog<SleepKey>>,
}

impl NdjsonSleepSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let log = NdjsonLog::open(path.as_ref(), sleep_key)?;
        Ok(Self {
            log: Mutex::new(log),
        })
    }
}

impl SleepRecordSink for NdjsonSleepSink {
    fn insert_many(&self, records: &[SleepRecord]) -> Result<usize, EngineError> {
        let mut log = self.log.lock().map_err(lock_error)?;
        let mut written = 0;
        for record in records {
            if log.append(sleep_key(record), record)? {
                written += 1;
            }
        }
        log.file.flush()?;
        Ok(written)
    }
}
