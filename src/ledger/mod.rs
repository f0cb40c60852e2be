//! The persisted record of which actions ran against which files.
//!
//! A `Ledger` holds two generations during a pass: `previous`, the state the
//! pass started from, and `working`, which the pass mutates. Staleness is
//! always judged against `previous`; every write lands in `working`. At the
//! end of a pass, files that were not visited are evicted from `working` and
//! the result is persisted atomically.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use tokio::fs as tokio_fs;
use tracing::{debug, warn};

use crate::error::{ImageLockError, Result};
use crate::fs::write_file_async_atomic;
use crate::stats::RecordOutcome;
use crate::types::{ActionRecord, FileKey, FreshnessToken, LedgerMap};

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    previous: LedgerMap,
    working: LedgerMap,
    visited: HashSet<FileKey>,
}

impl Ledger {
    /// An empty ledger that will persist to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self::from_map(path, LedgerMap::new())
    }

    /// A ledger whose previous and working generations both start as `map`.
    pub fn from_map(path: impl Into<PathBuf>, map: LedgerMap) -> Self {
        Ledger {
            path: path.into(),
            previous: map.clone(),
            working: map,
            visited: HashSet::new(),
        }
    }

    /// Load the ledger stored at `path`.
    ///
    /// A missing file yields an empty ledger. A file that exists but does not
    /// parse is `CorruptLedger`; the caller must not continue with an empty
    /// ledger in that case.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = match tokio_fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no ledger on disk, starting empty");
                return Ok(Self::empty(path));
            }
            Err(e) => return Err(ImageLockError::Io(e)),
        };

        let map: LedgerMap =
            serde_json::from_str(&content).map_err(|source| ImageLockError::CorruptLedger {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), files = map.len(), "ledger loaded");
        Ok(Self::from_map(path, map))
    }

    /// Load the ledger, or start empty when `fresh` is set and the stored
    /// ledger is corrupt.
    pub async fn load_or_fresh(path: impl Into<PathBuf>, fresh: bool) -> Result<Self> {
        let path = path.into();
        match Self::load(&path).await {
            Err(ImageLockError::CorruptLedger { source, .. }) if fresh => {
                warn!(
                    path = %path.display(),
                    "ledger is corrupt ({source}), starting fresh"
                );
                Ok(Self::empty(path))
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a new pass: the working generation becomes `previous` and the
    /// visited set is cleared.
    pub fn begin_pass(&mut self) {
        self.previous = self.working.clone();
        self.visited.clear();
    }

    /// Whether `action` must run against `key` in the state `token`.
    pub fn is_stale(&self, key: &FileKey, action: &str, token: &FreshnessToken) -> bool {
        self.previous
            .get(key)
            .and_then(|record| record.get(action))
            .is_none_or(|stored| stored != token)
    }

    /// Record that `action` succeeded against `key` in the state `token`.
    pub fn record(
        &mut self,
        key: &FileKey,
        action: &str,
        token: &FreshnessToken,
    ) -> RecordOutcome {
        let is_new_file = !self.working.contains_key(key);
        let record = self.working.entry(key.clone()).or_default();

        let outcome = match record.insert(action.to_string(), token.clone()) {
            None if is_new_file => RecordOutcome::NewFile,
            None => RecordOutcome::NewAction,
            Some(old) if old != *token => RecordOutcome::UpdatedAction,
            Some(_) => RecordOutcome::Unchanged,
        };
        debug!(key = %key, action, token = %token, ?outcome, "recorded action");
        outcome
    }

    /// Note that `key` exists on disk during this pass.
    pub fn mark_visited(&mut self, key: &FileKey) {
        self.visited.insert(key.clone());
    }

    /// Keep every previous entry at or beneath `prefix`, for subtrees that
    /// could not be read this pass.
    pub fn retain_under(&mut self, prefix: &FileKey) {
        let retained: Vec<FileKey> = self
            .previous
            .keys()
            .filter(|key| *key == prefix || key.is_under(prefix))
            .cloned()
            .collect();
        if !retained.is_empty() {
            debug!(prefix = %prefix, count = retained.len(), "retaining unreadable entries");
        }
        self.visited.extend(retained);
    }

    /// Remove every file from `previous` that was not visited this pass.
    ///
    /// Must only run after the walk has fully completed.
    pub fn evict_unvisited(&mut self) -> BTreeSet<FileKey> {
        let stale: BTreeSet<FileKey> = self
            .previous
            .keys()
            .filter(|key| !self.visited.contains(*key))
            .cloned()
            .collect();

        stale
            .into_iter()
            .filter(|key| {
                let removed = self.working.remove(key).is_some();
                if removed {
                    debug!(key = %key, "evicted");
                }
                removed
            })
            .collect()
    }

    /// Atomically write the working generation to disk.
    ///
    /// On failure the in-memory state is untouched and persisting can be retried.
    pub async fn persist(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.working)?;
        write_file_async_atomic(&self.path, &content).await?;
        debug!(path = %self.path.display(), files = self.working.len(), "ledger persisted");
        Ok(())
    }

    /// The working generation.
    pub fn entries(&self) -> &LedgerMap {
        &self.working
    }

    pub fn get(&self, key: &FileKey) -> Option<&ActionRecord> {
        self.working.get(key)
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }
}
