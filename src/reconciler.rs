//! One reconciliation pass over a directory tree.
//!
//! The walk is concurrent within a single task: every entry of a directory
//! is visited through its own future and the futures are joined before the
//! directory counts as done. All ledger mutations happen synchronously under
//! one lock that is never held across an await point, so interleaved visits
//! cannot corrupt the visited set or the action records.

use std::fs::{FileType, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::fs as tokio_fs;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::action::ActionRunner;
use crate::config::RunConfig;
use crate::display::Progress;
use crate::error::{ImageLockError, Result};
use crate::fs::temp_path_for;
use crate::ledger::Ledger;
use crate::stats::RunStats;
use crate::token::{FreshnessSource, MtimeSource};
use crate::types::{FileKey, is_skipped_name};

/// Pause between ledger write attempts.
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Drives passes of one action over one root.
#[derive(Clone)]
pub struct Reconciler {
    root: PathBuf,
    runner: Arc<dyn ActionRunner>,
    tokens: Arc<dyn FreshnessSource>,
    concurrency: usize,
    persist_retries: u32,
    skip_keys: Vec<FileKey>,
    progress: Option<Arc<dyn Progress>>,
}

/// A directory entry collected before it is visited.
struct Entry {
    path: PathBuf,
    file_type: Option<FileType>,
}

/// Everything a pass mutates. Only touched through `PassState::with`.
struct PassInner<'l> {
    ledger: &'l mut Ledger,
    stats: RunStats,
}

struct PassState<'l> {
    inner: Mutex<PassInner<'l>>,
    permits: Semaphore,
    progress: Option<Arc<dyn Progress>>,
}

impl<'l> PassState<'l> {
    fn new(ledger: &'l mut Ledger, concurrency: usize, progress: Option<Arc<dyn Progress>>) -> Self {
        PassState {
            inner: Mutex::new(PassInner {
                ledger,
                stats: RunStats::new(),
            }),
            permits: Semaphore::new(concurrency.max(1)),
            progress,
        }
    }

    /// Run a synchronous mutation against the ledger and counters.
    ///
    /// Progress is reported from a snapshot after the lock is released.
    fn with<T>(&self, f: impl FnOnce(&mut PassInner<'l>) -> T) -> T {
        let (result, snapshot) = {
            let mut inner = self.inner.lock();
            let result = f(&mut *inner);
            let snapshot = self.progress.is_some().then(|| inner.stats.clone());
            (result, snapshot)
        };
        if let (Some(progress), Some(stats)) = (&self.progress, snapshot) {
            progress.update(&stats);
        }
        result
    }

    fn finish(self) -> (RunStats, &'l mut Ledger) {
        let inner = self.inner.into_inner();
        (inner.stats, inner.ledger)
    }
}

impl Reconciler {
    pub fn new(
        root: impl Into<PathBuf>,
        runner: Arc<dyn ActionRunner>,
        tokens: Arc<dyn FreshnessSource>,
    ) -> Self {
        Reconciler {
            root: root.into(),
            runner,
            tokens,
            concurrency: 8,
            persist_retries: 0,
            skip_keys: Vec::new(),
            progress: None,
        }
    }

    /// Build a reconciler for `config`. The ledger file and the output
    /// directory are skipped if they live inside the root.
    pub fn from_config(config: &RunConfig, runner: Arc<dyn ActionRunner>) -> Self {
        let settings = &config.settings;
        let tokens = Arc::new(MtimeSource::new(settings.token_field));
        Reconciler::new(settings.root.clone(), runner, tokens)
            .with_concurrency(settings.concurrency)
            .with_persist_retries(settings.persist_retries)
            .skip_path(&settings.ledger)
            .skip_path(&temp_path_for(&settings.ledger))
            .skip_path(&settings.output_dir)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_persist_retries(mut self, retries: u32) -> Self {
        self.persist_retries = retries;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Never visit `path`, or anything beneath it, if it lies inside the root.
    pub fn skip_path(mut self, path: &Path) -> Self {
        let absolute = |p: &Path| std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf());
        if let Some(key) = FileKey::from_path(&absolute(&self.root), &absolute(path)) {
            self.skip_keys.push(key);
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn action(&self) -> &str {
        self.runner.name()
    }

    /// Whether a path reported by the filesystem could affect a pass.
    pub fn is_relevant(&self, path: &Path) -> bool {
        let absolute = |p: &Path| std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf());
        let root = absolute(&self.root);
        let path = absolute(path);
        let Ok(relative) = path.strip_prefix(&root) else {
            return false;
        };
        // The root itself changed (e.g. was removed or recreated).
        if relative.as_os_str().is_empty() {
            return true;
        }
        if relative
            .components()
            .any(|c| is_skipped_name(&c.as_os_str().to_string_lossy()))
        {
            return false;
        }
        FileKey::from_path(&root, &path).is_some_and(|key| !self.is_skipped_key(&key))
    }

    fn is_skipped_key(&self, key: &FileKey) -> bool {
        self.skip_keys
            .iter()
            .any(|skip| key == skip || key.is_under(skip))
    }

    /// Walk the tree, run the action on stale files and evict files that
    /// disappeared. The ledger is not persisted.
    ///
    /// Fails only when the root itself cannot be read; per-entry problems
    /// are counted in the returned stats.
    pub async fn reconcile(&self, ledger: &mut Ledger) -> Result<RunStats> {
        ledger.begin_pass();
        info!(root = %self.root.display(), action = self.action(), "run through files");

        let root_unreadable = |source| ImageLockError::RootUnreadable {
            path: self.root.clone(),
            source,
        };
        let metadata = tokio_fs::metadata(&self.root)
            .await
            .map_err(root_unreadable)?;
        if !metadata.is_dir() {
            return Err(root_unreadable(io::Error::other("not a directory")));
        }
        let entries = read_entries(&self.root).await.map_err(root_unreadable)?;

        let state = PassState::new(ledger, self.concurrency, self.progress.clone());
        join_all(entries.into_iter().map(|entry| self.visit(&state, entry))).await;

        let (mut stats, ledger) = state.finish();
        let evicted = ledger.evict_unvisited();
        stats.files_deleted = evicted.len();

        info!(
            files = stats.files,
            performed = stats.tasks_performed,
            failed = stats.actions_failed,
            evicted = stats.files_deleted,
            "pass complete"
        );
        Ok(stats)
    }

    /// Persist the ledger, retrying failed writes.
    pub async fn persist(&self, ledger: &Ledger) -> Result<()> {
        let mut attempt = 0;
        loop {
            match ledger.persist().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.persist_retries => {
                    attempt += 1;
                    warn!("ledger write failed (attempt {attempt}): {e}");
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A complete pass: reconcile, then persist.
    pub async fn scan(&self, ledger: &mut Ledger) -> Result<RunStats> {
        let stats = self.reconcile(ledger).await?;
        self.persist(ledger).await?;
        Ok(stats)
    }

    fn visit<'s, 'l: 's>(&'s self, state: &'s PassState<'l>, entry: Entry) -> BoxFuture<'s, ()> {
        async move {
            let Some(key) = FileKey::from_path(&self.root, &entry.path) else {
                warn!("skipping {}: name is not valid UTF-8", entry.path.display());
                state.with(|pass| pass.stats.traversal_errors += 1);
                return;
            };
            if self.is_skipped_key(&key) {
                return;
            }

            let metadata = match tokio_fs::metadata(&entry.path).await {
                Ok(metadata) => metadata,
                Err(e) => return self.traversal_error(state, &key, &entry.path, e),
            };

            if metadata.is_dir() {
                if entry.file_type.is_some_and(|t| t.is_symlink()) {
                    debug!(key = %key, "not following directory symlink");
                    return;
                }
                match read_entries(&entry.path).await {
                    Ok(children) => {
                        join_all(children.into_iter().map(|child| self.visit(state, child))).await;
                    }
                    Err(e) => self.traversal_error(state, &key, &entry.path, e),
                }
            } else if metadata.is_file() {
                self.visit_file(state, key, &entry.path, &metadata).await;
            }
        }
        .boxed()
    }

    async fn visit_file(
        &self,
        state: &PassState<'_>,
        key: FileKey,
        path: &Path,
        metadata: &Metadata,
    ) {
        let token = match self.tokens.token(path, metadata) {
            Ok(token) => token,
            Err(ImageLockError::Traversal { source, .. }) => {
                return self.traversal_error(state, &key, path, source);
            }
            Err(e) => return self.traversal_error(state, &key, path, io::Error::other(e)),
        };
        let action = self.action();

        let stale = state.with(|pass| {
            pass.stats.files += 1;
            pass.ledger.mark_visited(&key);
            let stale = pass.ledger.is_stale(&key, action, &token);
            if stale {
                pass.stats.actions_found += 1;
            } else {
                pass.stats.actions_ignored += 1;
                debug!(key = %key, action, "action already exists");
            }
            stale
        });
        if !stale {
            return;
        }

        let _permit = state.permits.acquire().await.ok();
        match self.runner.run(path, &key).await {
            Ok(()) => state.with(|pass| {
                pass.stats.tasks_performed += 1;
                let outcome = pass.ledger.record(&key, action, &token);
                pass.stats.count_record(outcome);
            }),
            Err(e) => {
                warn!("{e}");
                state.with(|pass| pass.stats.actions_failed += 1);
            }
        }
    }

    fn traversal_error(&self, state: &PassState<'_>, key: &FileKey, path: &Path, err: io::Error) {
        let vanished = err.kind() == io::ErrorKind::NotFound;
        if vanished {
            debug!(key = %key, "entry vanished during the walk");
        } else {
            warn!("{}", ImageLockError::Traversal {
                path: path.to_path_buf(),
                source: err,
            });
        }
        state.with(|pass| {
            pass.stats.traversal_errors += 1;
            if !vanished {
                pass.ledger.retain_under(key);
            }
        });
    }
}

async fn read_entries(dir: &Path) -> io::Result<Vec<Entry>> {
    let mut reader = tokio_fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        if is_skipped_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        entries.push(Entry {
            path: entry.path(),
            file_type: entry.file_type().await.ok(),
        });
    }
    Ok(entries)
}
